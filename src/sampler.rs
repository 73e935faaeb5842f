//! The core ReFL sampling procedure: partial denoising with a randomly placed gradient window.
//!
//! Denoising is a long iterative chain; differentiating through all of it is memory-prohibitive
//! and numerically unstable. This procedure runs the prefix of the trajectory without gradient
//! tracking up to a midpoint `m`, then takes exactly one further step with gradients enabled
//! and decodes it. Randomizing `m` over training steps spreads the one-step signal across the
//! whole trajectory; pinning it during evaluation makes validation metrics reproducible.

use burn_core::tensor::backend::AutodiffBackend;
use rand_chacha::ChaCha8Rng;

use crate::data::Batch;
use crate::diffusion::DiffusionModel;
use crate::schedule::MidpointRange;
use crate::Result;

/// Which midpoint policy to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleMode {
    /// Uniform midpoint in `[min_mid, max_mid - 1)`.
    Train,
    /// Midpoint pinned to `max_mid - 1`.
    Eval,
}

impl SampleMode {
    pub fn is_train(self) -> bool {
        matches!(self, SampleMode::Train)
    }
}

/// Partially denoise a batch and write the decoded image into it.
///
/// 1. validate the midpoint range (fails fast, before any model call),
/// 2. `set_timesteps(max_mid)`,
/// 3. draw the midpoint `m` for `mode`,
/// 4. advance `0 → m` without gradient tracking,
/// 5. advance `m → m + 1` with gradients enabled and decode into `batch.image`.
///
/// Returns `m` so callers can log it. Deterministic given `rng`'s state and the batch.
pub fn sample_partial<B, M>(
    model: &mut M,
    batch: &mut Batch<B>,
    mode: SampleMode,
    range: &MidpointRange,
    device: &B::Device,
    rng: &mut ChaCha8Rng,
) -> Result<usize>
where
    B: AutodiffBackend,
    M: DiffusionModel<B>,
{
    range.validate()?;
    model.set_timesteps(range.max_mid, device)?;
    let m = range.sample(mode.is_train(), rng)?;

    let (latents, encoder_hidden_states) = model.do_k_diffusion_steps(
        None,
        0,
        m,
        &batch.tokenized_text.view(),
        false,
        rng,
    )?;
    let image = model.sample_image(latents, m, m + 1, encoder_hidden_states)?;

    batch.image = Some(image);
    Ok(m)
}
