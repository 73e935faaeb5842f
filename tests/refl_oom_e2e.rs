//! Out-of-memory recovery: an adapter OOM inside a training step must be skippable without
//! losing the rest of the run, and fatal when skipping is disabled.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use burn_core as burn;

use burn::module::{Ignored, Module};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use ndarray::{Array2, ArrayView2};
use rand_chacha::ChaCha8Rng;

use refl::data::InMemoryPrompts;
use refl::diffusion::{CondLatentDiffusion, CondLatentDiffusionConfig, DiffusionModel};
use refl::metrics::MemoryWriter;
use refl::reward::ContrastReward;
use refl::schedule::NoiseSchedule;
use refl::trainer::{train_refl, ReflTrainConfig};
use refl::{Error, NdBackend};

const VOCAB: usize = 32;

/// Delegates to the real generator but reports a simulated allocator failure on the n-th
/// trajectory call.
#[derive(Module, Debug)]
struct FaultyDiffusion<B: Backend> {
    inner: CondLatentDiffusion<B>,
    fail_on: usize,
    calls: Ignored<Arc<AtomicUsize>>,
}

impl<B: AutodiffBackend> DiffusionModel<B> for FaultyDiffusion<B> {
    fn set_timesteps(&mut self, count: usize, device: &B::Device) -> refl::Result<()> {
        self.inner.set_timesteps(count, device)
    }

    fn do_k_diffusion_steps(
        &self,
        latents: Option<Tensor<B::InnerBackend, 2>>,
        start_index: usize,
        end_index: usize,
        tokenized_text: &ArrayView2<'_, i64>,
        return_pred_original: bool,
        rng: &mut ChaCha8Rng,
    ) -> refl::Result<(Tensor<B::InnerBackend, 2>, Tensor<B::InnerBackend, 2>)> {
        let n = self.calls.0.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.fail_on {
            return Err(Error::OutOfMemory("simulated allocator failure".into()));
        }
        self.inner.do_k_diffusion_steps(
            latents,
            start_index,
            end_index,
            tokenized_text,
            return_pred_original,
            rng,
        )
    }

    fn sample_image(
        &self,
        latents: Tensor<B::InnerBackend, 2>,
        start_index: usize,
        end_index: usize,
        encoder_hidden_states: Tensor<B::InnerBackend, 2>,
    ) -> refl::Result<Tensor<B, 2>> {
        self.inner
            .sample_image(latents, start_index, end_index, encoder_hidden_states)
    }

    fn grads_finite(&self, grads: &B::Gradients) -> bool {
        self.inner.grads_finite(grads)
    }

    fn image_dim(&self) -> usize {
        DiffusionModel::<B>::image_dim(&self.inner)
    }
}

fn faulty_model(fail_on: usize) -> FaultyDiffusion<NdBackend> {
    let device = Default::default();
    FaultyDiffusion {
        inner: CondLatentDiffusionConfig {
            vocab_size: VOCAB,
            cond_dim: 6,
            latent_dim: 4,
            hidden_dim: 12,
            image_dim: 8,
            schedule: NoiseSchedule::Cosine,
        }
        .init(&device),
        fail_on,
        calls: Ignored(Arc::new(AtomicUsize::new(0))),
    }
}

fn prompt_matrix(n: usize) -> Array2<i64> {
    Array2::from_shape_fn((n, 4), |(i, k)| ((i * 7 + k * 3) % VOCAB) as i64)
}

fn cfg(skip_oom: bool) -> ReflTrainConfig {
    ReflTrainConfig {
        epochs: 1,
        epoch_len: Some(4),
        min_mid_timestep: 1,
        max_mid_timestep: 6,
        lr: 1e-2,
        skip_oom,
        seed: 17,
        ..Default::default()
    }
}

#[test]
fn skip_oom_survives_one_failed_step_and_keeps_counting() {
    let device = Default::default();
    let reward = ContrastReward::new("contrast");
    let mut source = InMemoryPrompts::new(prompt_matrix(8), 2, false).unwrap();
    let mut writer = MemoryWriter::default();

    let (_, report) = train_refl(
        &device,
        faulty_model(2),
        &reward,
        &[],
        &mut source,
        None,
        &[],
        &cfg(true),
        &mut writer,
    )
    .unwrap();

    // All four steps were attempted; exactly one was skipped and produced no metrics.
    assert_eq!(report.total_steps(), 4);
    assert_eq!(report.total_oom_skipped(), 1);
    assert_eq!(writer.values("train/loss").len(), 3);
    assert!(report.epochs[0].train_loss.is_finite());
}

#[test]
fn oom_is_fatal_when_skipping_is_disabled() {
    let device = Default::default();
    let reward = ContrastReward::new("contrast");
    let mut source = InMemoryPrompts::new(prompt_matrix(8), 2, false).unwrap();
    let mut writer = MemoryWriter::default();

    let err = train_refl(
        &device,
        faulty_model(2),
        &reward,
        &[],
        &mut source,
        None,
        &[],
        &cfg(false),
        &mut writer,
    )
    .unwrap_err();
    assert!(matches!(err, Error::OutOfMemory(_)));
}

#[test]
fn oom_during_evaluation_is_always_fatal() {
    let device = Default::default();
    let reward = ContrastReward::new("contrast");
    let mut source = InMemoryPrompts::new(prompt_matrix(4), 2, false).unwrap();
    let mut val = InMemoryPrompts::new(prompt_matrix(2), 2, false).unwrap();
    let mut writer = MemoryWriter::default();

    // Two train steps succeed; the third trajectory call happens in the eval pass.
    let mut cfg = cfg(true);
    cfg.epoch_len = Some(2);

    let err = train_refl(
        &device,
        faulty_model(3),
        &reward,
        &[],
        &mut source,
        Some(&mut val),
        &[],
        &cfg,
        &mut writer,
    )
    .unwrap_err();
    assert!(matches!(err, Error::OutOfMemory(_)));
}
