//! The ReFL training loop: epochs of reward-scored partial sampling with backprop through the
//! single gradient-enabled step, plus deterministic evaluation passes.
//!
//! Per training step: fetch batch → batch transforms → partial sampling (train midpoint) →
//! score with the train reward model → `loss = -mean(reward)` → scale → backward → finite-check
//! → SGD step at `lr / scale` → scaler update. Evaluation passes use the pinned midpoint, no
//! backprop, and every validation reward model.
//!
//! Everything here is single-stream and sequential: parameters are mutated only by the
//! optimizer step, the scaler once per step, and ordering is program order.

use std::collections::BTreeMap;

use burn_core::module::AutodiffModule;
use burn_core::tensor::backend::AutodiffBackend;
use burn_core::tensor::Tensor;
use burn_optim::{GradientsParams, LearningRate, Optimizer, SgdConfig};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::data::{BatchSource, BatchTransform};
use crate::diffusion::DiffusionModel;
use crate::metrics::{EpochReport, MetricsWriter, RunningMean, TrainReport};
use crate::reward::RewardModel;
use crate::sampler::{sample_partial, SampleMode};
use crate::scaler::{GradScaler, GradScalerConfig};
use crate::schedule::MidpointRange;
use crate::{Error, Result};

/// Learning-rate policy over global steps.
#[derive(Debug, Clone, Copy)]
pub enum LrSchedule {
    Constant,
    /// Linear ramp from `base / warmup_steps` to `base`, then constant.
    LinearWarmup { warmup_steps: usize },
    /// Half-cosine decay from `base` to 0 over `total_steps`.
    Cosine { total_steps: usize },
}

impl Default for LrSchedule {
    fn default() -> Self {
        Self::Constant
    }
}

impl LrSchedule {
    pub fn lr_at(self, base: LearningRate, step: usize) -> LearningRate {
        match self {
            LrSchedule::Constant => base,
            LrSchedule::LinearWarmup { warmup_steps } => {
                if warmup_steps == 0 || step >= warmup_steps {
                    base
                } else {
                    base * (step + 1) as f64 / warmup_steps as f64
                }
            }
            LrSchedule::Cosine { total_steps } => {
                let p = step.min(total_steps) as f64 / total_steps.max(1) as f64;
                base * 0.5 * (1.0 + (std::f64::consts::PI * p).cos())
            }
        }
    }
}

/// Training configuration. Validated once at startup, read-only afterwards.
#[derive(Debug, Clone)]
pub struct ReflTrainConfig {
    pub epochs: usize,
    /// Iterations per epoch for iteration-based training (the source is cycled); `None` means
    /// one pass over the source per epoch.
    pub epoch_len: Option<usize>,
    pub min_mid_timestep: usize,
    pub max_mid_timestep: usize,
    pub lr: LearningRate,
    pub lr_schedule: LrSchedule,
    /// Treat an adapter out-of-memory failure during a training step as skippable.
    pub skip_oom: bool,
    pub seed: u64,
    pub scaler: GradScalerConfig,
}

impl Default for ReflTrainConfig {
    fn default() -> Self {
        Self {
            epochs: 1,
            epoch_len: None,
            min_mid_timestep: 10,
            max_mid_timestep: 40,
            lr: 1e-3,
            lr_schedule: LrSchedule::Constant,
            skip_oom: true,
            seed: 123,
            scaler: GradScalerConfig::default(),
        }
    }
}

impl ReflTrainConfig {
    pub fn midpoint_range(&self) -> MidpointRange {
        MidpointRange {
            min_mid: self.min_mid_timestep,
            max_mid: self.max_mid_timestep,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(Error::Domain("epochs must be >= 1"));
        }
        if self.epoch_len == Some(0) {
            return Err(Error::Domain("epoch_len must be >= 1 when set"));
        }
        if !self.lr.is_finite() || self.lr <= 0.0 {
            return Err(Error::Domain("lr must be positive and finite"));
        }
        self.midpoint_range().validate()?;
        self.scaler.validate()
    }
}

struct StepOutcome<B: AutodiffBackend> {
    midpoint: usize,
    reward: Tensor<B, 1>,
}

fn tensor_mean<B: AutodiffBackend>(t: &Tensor<B, 1>) -> Result<f64> {
    let v = t
        .to_data()
        .to_vec::<f32>()
        .map_err(|_| Error::Domain("scalar tensor read failed"))?;
    if v.is_empty() {
        return Err(Error::Shape("reward must be non-empty"));
    }
    Ok(v.iter().map(|&x| x as f64).sum::<f64>() / v.len() as f64)
}

/// Run ReFL training and return the trained model with a per-epoch report.
///
/// State machine per epoch: a training pass over `train_source` (bounded by `epoch_len` when
/// set), then an evaluation pass over `val_source` (when given) scoring every validation
/// reward model at the pinned midpoint. The only recoverable failures are adapter
/// out-of-memory (when `cfg.skip_oom`, training pass only) and non-finite gradients (the
/// scaler skips that optimizer step); everything else terminates the run.
#[allow(clippy::too_many_arguments)]
pub fn train_refl<B, M>(
    device: &B::Device,
    mut model: M,
    train_reward: &dyn RewardModel<B>,
    val_rewards: &[Box<dyn RewardModel<B>>],
    train_source: &mut dyn BatchSource<B>,
    mut val_source: Option<&mut dyn BatchSource<B>>,
    transforms: &[Box<dyn BatchTransform<B>>],
    cfg: &ReflTrainConfig,
    writer: &mut dyn MetricsWriter,
) -> Result<(M, TrainReport)>
where
    B: AutodiffBackend,
    M: DiffusionModel<B> + AutodiffModule<B>,
{
    cfg.validate()?;
    let range = cfg.midpoint_range();
    let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed);
    let mut optim = SgdConfig::new().init::<B, M>();
    let mut scaler = GradScaler::new(cfg.scaler)?;
    let mut report = TrainReport::default();
    let mut global_step = 0usize;

    for epoch in 0..cfg.epochs {
        train_source.reset();
        let mut loss_mean = RunningMean::default();
        let mut reward_mean = RunningMean::default();
        let mut steps = 0usize;
        let mut oom_skipped = 0usize;
        let overflows_before = scaler.overflows();

        // Training pass.
        loop {
            if let Some(limit) = cfg.epoch_len {
                if steps >= limit {
                    break;
                }
            }
            let mut batch = match train_source.next_batch(&mut rng)? {
                Some(b) => b,
                None if cfg.epoch_len.is_some() => {
                    // Iteration-based training cycles the source within the epoch.
                    train_source.reset();
                    train_source
                        .next_batch(&mut rng)?
                        .ok_or(Error::Domain("batch source yielded no batches"))?
                }
                None => break,
            };
            steps += 1;

            let attempt = (|| -> Result<StepOutcome<B>> {
                for t in transforms {
                    t.apply(&mut batch)?;
                }
                let midpoint = sample_partial(
                    &mut model,
                    &mut batch,
                    SampleMode::Train,
                    &range,
                    device,
                    &mut rng,
                )?;
                let image = batch
                    .image
                    .clone()
                    .ok_or(Error::Domain("sampling did not produce an image"))?;
                let reward = train_reward.score(image, &batch.tokenized_text.view())?;
                Ok(StepOutcome { midpoint, reward })
            })();

            let step = match attempt {
                Ok(s) => s,
                Err(Error::OutOfMemory(msg)) if cfg.skip_oom => {
                    tracing::warn!(
                        target: "refl::trainer",
                        epoch,
                        step = global_step,
                        "skipping training step after out-of-memory: {msg}"
                    );
                    oom_skipped += 1;
                    global_step += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let reward_value = tensor_mean(&step.reward)?;
            let loss = step.reward.mean().neg();
            let loss_value = tensor_mean(&loss)?;

            let scaled = loss.mul_scalar(scaler.scale());
            let grads = scaled.backward();
            let finite = loss_value.is_finite() && model.grads_finite(&grads);
            if finite {
                let grads = GradientsParams::from_grads(grads, &model);
                // Momentum-free SGD: unscaling folds into the learning rate.
                let lr = cfg.lr_schedule.lr_at(cfg.lr, global_step) / scaler.scale() as f64;
                model = optim.step(lr, model, grads);
            } else {
                tracing::warn!(
                    target: "refl::trainer",
                    epoch,
                    step = global_step,
                    "non-finite loss or gradients; skipping optimizer step"
                );
            }
            scaler.update(!finite);

            loss_mean.push(loss_value);
            reward_mean.push(reward_value);
            writer.scalar(epoch, global_step, "train/loss", loss_value);
            writer.scalar(epoch, global_step, "train/reward", reward_value);
            writer.scalar(epoch, global_step, "train/midpoint", step.midpoint as f64);
            writer.scalar(epoch, global_step, "train/scale", f64::from(scaler.scale()));
            global_step += 1;
        }

        // Evaluation pass: pinned midpoint, no backprop, every validation reward model.
        let mut val_means: BTreeMap<String, RunningMean> = BTreeMap::new();
        if let Some(src) = val_source.as_deref_mut() {
            src.reset();
            while let Some(mut batch) = src.next_batch(&mut rng)? {
                for t in transforms {
                    t.apply(&mut batch)?;
                }
                sample_partial(
                    &mut model,
                    &mut batch,
                    SampleMode::Eval,
                    &range,
                    device,
                    &mut rng,
                )?;
                let image = batch
                    .image
                    .clone()
                    .ok_or(Error::Domain("sampling did not produce an image"))?
                    .detach();
                for rm in val_rewards {
                    let r = rm.score(image.clone(), &batch.tokenized_text.view())?;
                    val_means
                        .entry(rm.name().to_string())
                        .or_default()
                        .push(tensor_mean(&r)?);
                }
            }
        }

        let val_rewards_out: BTreeMap<String, f64> = val_means
            .into_iter()
            .map(|(name, m)| (name, m.mean()))
            .collect();
        for (name, value) in &val_rewards_out {
            writer.scalar(epoch, global_step, &format!("val/{name}_reward"), *value);
        }
        writer.scalar(epoch, global_step, "epoch/train_loss", loss_mean.mean());
        writer.scalar(epoch, global_step, "epoch/oom_skipped", oom_skipped as f64);

        report.epochs.push(EpochReport {
            epoch,
            steps,
            train_loss: loss_mean.mean(),
            train_reward: reward_mean.mean(),
            val_rewards: val_rewards_out,
            oom_skipped,
            overflow_skipped: scaler.overflows() - overflows_before,
        });
    }

    Ok((model, report))
}
