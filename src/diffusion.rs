//! The generator-side adapter: timestep scheduling, no-grad trajectory stepping, and the single
//! gradient-enabled step that decodes to image space.
//!
//! The gradient contract is carried by the types. `do_k_diffusion_steps` works entirely on
//! `B::InnerBackend` tensors (the module's `valid()` view), so no computation graph exists for
//! the trajectory prefix. `sample_image` re-enters the autodiff backend through
//! `Tensor::from_inner` and runs exactly one step, which is the only place gradients can reach
//! the generator's parameters.

use burn_core as burn;

use burn::module::{AutodiffModule, Ignored, Module};
use burn::tensor::activation::{relu, tanh};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use burn_nn::{Embedding, EmbeddingConfig, Linear, LinearConfig};
use ndarray::{Array2, ArrayView2};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::data::{array2_to_tensor, ids_to_tensor};
use crate::schedule::{ddim_advance, DiffusionSchedule, NoiseSchedule};
use crate::{Error, Result};

/// Capability set the training loop needs from a denoising generator.
///
/// Any model exposing these operations is substitutable; the crate ships
/// [`CondLatentDiffusion`] as a small reference implementation.
pub trait DiffusionModel<B: AutodiffBackend> {
    /// Configure the noise schedule with `count` discretization steps.
    ///
    /// Must be called once per batch before stepping; idempotent for an unchanged `count`
    /// (the rebuilt table compares equal, no stateful drift).
    fn set_timesteps(&mut self, count: usize, device: &B::Device) -> Result<()>;

    /// Deterministically advance the trajectory from `start_index` to `end_index` without
    /// gradient tracking.
    ///
    /// When `latents` is unset, initializes from standard normal noise drawn from `rng`.
    /// Returns the advanced latent (or, with `return_pred_original`, the predicted original
    /// sample at the last step) together with the encoder hidden state used for conditioning,
    /// cached so later steps need not re-encode the text.
    ///
    /// Fails with [`Error::Shape`] if the conditioning batch size disagrees with `latents`.
    #[allow(clippy::too_many_arguments)]
    fn do_k_diffusion_steps(
        &self,
        latents: Option<Tensor<B::InnerBackend, 2>>,
        start_index: usize,
        end_index: usize,
        tokenized_text: &ArrayView2<'_, i64>,
        return_pred_original: bool,
        rng: &mut ChaCha8Rng,
    ) -> Result<(Tensor<B::InnerBackend, 2>, Tensor<B::InnerBackend, 2>)>;

    /// Run exactly one further denoising step (`end_index == start_index + 1`) with gradient
    /// tracking enabled, then decode the predicted original sample into image space.
    fn sample_image(
        &self,
        latents: Tensor<B::InnerBackend, 2>,
        start_index: usize,
        end_index: usize,
        encoder_hidden_states: Tensor<B::InnerBackend, 2>,
    ) -> Result<Tensor<B, 2>>;

    /// Whether every parameter gradient in `grads` is finite (gradient-scaler support).
    fn grads_finite(&self, grads: &B::Gradients) -> bool;

    /// Width of the decoded image vectors this model produces.
    fn image_dim(&self) -> usize;
}

/// Configuration for the reference generator.
#[derive(Debug, Clone)]
pub struct CondLatentDiffusionConfig {
    pub vocab_size: usize,
    /// Width of the pooled encoder hidden state.
    pub cond_dim: usize,
    pub latent_dim: usize,
    /// Hidden width of the noise-predictor MLP.
    pub hidden_dim: usize,
    /// Width of the decoded image vectors.
    pub image_dim: usize,
    pub schedule: NoiseSchedule,
}

impl Default for CondLatentDiffusionConfig {
    fn default() -> Self {
        Self {
            vocab_size: 256,
            cond_dim: 16,
            latent_dim: 8,
            hidden_dim: 32,
            image_dim: 32,
            schedule: NoiseSchedule::Cosine,
        }
    }
}

impl CondLatentDiffusionConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> CondLatentDiffusion<B> {
        let encoder = EmbeddingConfig::new(self.vocab_size, self.cond_dim).init(device);
        let eps_in = LinearConfig::new(self.latent_dim + self.cond_dim + 1, self.hidden_dim)
            .with_bias(true)
            .init(device);
        let eps_out = LinearConfig::new(self.hidden_dim, self.latent_dim)
            .with_bias(true)
            .init(device);
        let decoder = LinearConfig::new(self.latent_dim, self.image_dim)
            .with_bias(true)
            .init(device);
        CondLatentDiffusion {
            encoder,
            eps_in,
            eps_out,
            decoder,
            latent_dim: self.latent_dim,
            image_dim: self.image_dim,
            schedule_kind: Ignored(self.schedule),
            schedule: Ignored(None),
        }
    }
}

/// Reference generator: token embedding → mean-pooled hidden state, a small MLP noise
/// predictor over `[latent, hidden, progress]`, and a linear+tanh decoder to image space.
///
/// Intentionally boring: enough structure to exercise the sampling/optimization protocol
/// without importing a real U-Net.
#[derive(Module, Debug)]
pub struct CondLatentDiffusion<B: Backend> {
    encoder: Embedding<B>,
    eps_in: Linear<B>,
    eps_out: Linear<B>,
    decoder: Linear<B>,
    latent_dim: usize,
    image_dim: usize,
    schedule_kind: Ignored<NoiseSchedule>,
    schedule: Ignored<Option<DiffusionSchedule>>,
}

impl<Bk: Backend> CondLatentDiffusion<Bk> {
    /// The currently configured schedule, if `set_timesteps` has run.
    pub fn current_schedule(&self) -> Option<&DiffusionSchedule> {
        self.schedule.0.as_ref()
    }

    fn require_schedule(&self) -> Result<&DiffusionSchedule> {
        self.schedule
            .0
            .as_ref()
            .ok_or(Error::Domain("set_timesteps must be called before stepping"))
    }

    fn device(&self) -> Bk::Device {
        self.decoder.weight.device()
    }

    fn encode_text(&self, ids: burn::tensor::Tensor<Bk, 2, burn::tensor::Int>) -> Tensor<Bk, 2> {
        let emb = self.encoder.forward(ids);
        let [b, _s, e] = emb.dims();
        emb.mean_dim(1).reshape([b, e])
    }

    fn predict_eps(
        &self,
        latents: Tensor<Bk, 2>,
        hidden: Tensor<Bk, 2>,
        progress: f32,
    ) -> Tensor<Bk, 2> {
        let [b, _] = latents.dims();
        let t_feat = Tensor::<Bk, 2>::full([b, 1], progress, &self.device());
        let feats = Tensor::cat(vec![latents, hidden, t_feat], 1);
        self.eps_out.forward(relu(self.eps_in.forward(feats)))
    }

    /// One schedule step `from → from + 1`; returns `(x_next, pred_x0)`.
    fn advance(
        &self,
        schedule: &DiffusionSchedule,
        x: Tensor<Bk, 2>,
        hidden: Tensor<Bk, 2>,
        from: usize,
    ) -> Result<(Tensor<Bk, 2>, Tensor<Bk, 2>)> {
        let eps = self.predict_eps(x.clone(), hidden, schedule.progress(from));
        ddim_advance(schedule, x, eps, from)
    }

    fn decode(&self, pred_x0: Tensor<Bk, 2>) -> Tensor<Bk, 2> {
        tanh(self.decoder.forward(pred_x0))
    }
}

impl<B: AutodiffBackend> DiffusionModel<B> for CondLatentDiffusion<B> {
    fn set_timesteps(&mut self, count: usize, _device: &B::Device) -> Result<()> {
        if self.schedule.0.as_ref().is_some_and(|s| s.count() == count) {
            return Ok(());
        }
        self.schedule = Ignored(Some(DiffusionSchedule::new(self.schedule_kind.0, count)?));
        Ok(())
    }

    fn do_k_diffusion_steps(
        &self,
        latents: Option<Tensor<B::InnerBackend, 2>>,
        start_index: usize,
        end_index: usize,
        tokenized_text: &ArrayView2<'_, i64>,
        return_pred_original: bool,
        rng: &mut ChaCha8Rng,
    ) -> Result<(Tensor<B::InnerBackend, 2>, Tensor<B::InnerBackend, 2>)> {
        let schedule = self.require_schedule()?;
        if end_index < start_index || end_index > schedule.count() {
            return Err(Error::Domain("trajectory index out of schedule bounds"));
        }
        let b = tokenized_text.nrows();
        if b == 0 {
            return Err(Error::Shape("conditioning batch must be non-empty"));
        }

        // No-grad scope: the whole prefix runs on the frozen inner-backend view.
        let frozen = self.valid();
        let device = frozen.device();
        let hidden = frozen.encode_text(ids_to_tensor(&device, tokenized_text));

        let mut x = match latents {
            Some(l) => {
                let [lb, ld] = l.dims();
                if lb != b {
                    return Err(Error::Shape(
                        "conditioning batch size disagrees with latents",
                    ));
                }
                if ld != self.latent_dim {
                    return Err(Error::Shape("latent dimension disagrees with model"));
                }
                l
            }
            None => {
                let mut noise = Array2::<f32>::zeros((b, self.latent_dim));
                for i in 0..b {
                    for k in 0..self.latent_dim {
                        noise[[i, k]] = StandardNormal.sample(rng);
                    }
                }
                array2_to_tensor(&device, &noise.view())
            }
        };

        // When no steps are taken, the predicted original falls back to the latent itself.
        let mut pred_x0 = x.clone();
        for i in start_index..end_index {
            let (next, p0) = frozen.advance(schedule, x, hidden.clone(), i)?;
            x = next;
            pred_x0 = p0;
        }

        let out = if return_pred_original { pred_x0 } else { x };
        Ok((out, hidden))
    }

    fn sample_image(
        &self,
        latents: Tensor<B::InnerBackend, 2>,
        start_index: usize,
        end_index: usize,
        encoder_hidden_states: Tensor<B::InnerBackend, 2>,
    ) -> Result<Tensor<B, 2>> {
        let schedule = self.require_schedule()?;
        if end_index != start_index + 1 {
            return Err(Error::Domain("sample_image advances exactly one step"));
        }
        if end_index > schedule.count() {
            return Err(Error::Domain("trajectory index out of schedule bounds"));
        }
        let [lb, ld] = latents.dims();
        let [hb, _] = encoder_hidden_states.dims();
        if lb != hb {
            return Err(Error::Shape(
                "conditioning batch size disagrees with latents",
            ));
        }
        if ld != self.latent_dim {
            return Err(Error::Shape("latent dimension disagrees with model"));
        }

        // Re-enter the autodiff graph. The prefix tensors arrive as detached leaves; the only
        // tracked values in this step are the module's own parameters.
        let x = Tensor::from_inner(latents);
        let hidden = Tensor::from_inner(encoder_hidden_states);
        let (_x_next, pred_x0) = self.advance(schedule, x, hidden, start_index)?;
        Ok(self.decode(pred_x0))
    }

    fn grads_finite(&self, grads: &B::Gradients) -> bool {
        fn finite<B: AutodiffBackend, const D: usize>(
            t: Tensor<B, D>,
            grads: &B::Gradients,
        ) -> bool {
            match t.grad(grads) {
                Some(g) => g
                    .to_data()
                    .to_vec::<f32>()
                    .map(|v| v.iter().all(|x| x.is_finite()))
                    .unwrap_or(false),
                None => true,
            }
        }

        let mut ok = finite(self.encoder.weight.val(), grads)
            && finite(self.eps_in.weight.val(), grads)
            && finite(self.eps_out.weight.val(), grads)
            && finite(self.decoder.weight.val(), grads);
        for bias in [&self.eps_in.bias, &self.eps_out.bias, &self.decoder.bias] {
            if let Some(b) = bias {
                ok = ok && finite(b.val(), grads);
            }
        }
        ok
    }

    fn image_dim(&self) -> usize {
        self.image_dim
    }
}
