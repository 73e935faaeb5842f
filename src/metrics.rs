//! Scalar metrics: the writer collaborator seam plus small, explicit aggregates.
//!
//! The loop emits structured key→value records; what happens to them (TensorBoard, W&B, a log
//! line) is the writer's business. `TracingWriter` is the batteries-included choice.

use std::collections::BTreeMap;

/// The Logger/Writer collaborator: receives one scalar per call.
pub trait MetricsWriter {
    fn scalar(&mut self, epoch: usize, step: usize, key: &str, value: f64);
}

/// Emits scalars as structured `tracing` events under the `refl::metrics` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingWriter;

impl MetricsWriter for TracingWriter {
    fn scalar(&mut self, epoch: usize, step: usize, key: &str, value: f64) {
        tracing::info!(target: "refl::metrics", epoch, step, key, value);
    }
}

/// Records every scalar in memory; the writer used by tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryWriter {
    pub records: Vec<(usize, usize, String, f64)>,
}

impl MemoryWriter {
    /// All values written under `key`, in order.
    pub fn values(&self, key: &str) -> Vec<f64> {
        self.records
            .iter()
            .filter(|(_, _, k, _)| k == key)
            .map(|&(_, _, _, v)| v)
            .collect()
    }
}

impl MetricsWriter for MemoryWriter {
    fn scalar(&mut self, epoch: usize, step: usize, key: &str, value: f64) {
        self.records.push((epoch, step, key.to_string(), value));
    }
}

/// Drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullWriter;

impl MetricsWriter for NullWriter {
    fn scalar(&mut self, _epoch: usize, _step: usize, _key: &str, _value: f64) {}
}

/// Streaming mean over f64 observations.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunningMean {
    sum: f64,
    count: usize,
}

impl RunningMean {
    pub fn push(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// NaN when nothing has been observed.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            f64::NAN
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Summary of one epoch of training (+ optional evaluation pass).
#[derive(Debug, Clone, Default)]
pub struct EpochReport {
    pub epoch: usize,
    /// Training steps attempted this epoch (OOM-skipped steps included).
    pub steps: usize,
    pub train_loss: f64,
    pub train_reward: f64,
    /// Mean validation reward per reward-model name.
    pub val_rewards: BTreeMap<String, f64>,
    pub oom_skipped: usize,
    pub overflow_skipped: usize,
}

/// Whole-run summary returned by the trainer.
#[derive(Debug, Clone, Default)]
pub struct TrainReport {
    pub epochs: Vec<EpochReport>,
}

impl TrainReport {
    pub fn total_steps(&self) -> usize {
        self.epochs.iter().map(|e| e.steps).sum()
    }

    pub fn total_oom_skipped(&self) -> usize {
        self.epochs.iter().map(|e| e.oom_skipped).sum()
    }
}
