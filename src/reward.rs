//! The reward-side adapter: frozen scoring models mapping generated images (and optionally the
//! conditioning text) to per-sample scalar rewards.
//!
//! Frozen mode is structural here: the reference scorers hold plain tensors, not module
//! parameters, so a backward pass never produces gradients for their weights while the graph
//! still flows *through* the input image into the upstream generator. That is exactly the
//! contract the training loop relies on.

use burn_core::tensor::backend::Backend;
use burn_core::tensor::{Int, Tensor, TensorData};
use ndarray::{Array2, ArrayView2};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::data::array2_to_tensor;
use crate::{Error, Result};

/// Capability set the loop needs from a scoring model.
///
/// Implementations must be frozen (no gradients for their own weights) and must return one
/// scalar per sample. Several can be evaluated per batch for validation; exactly one forms the
/// optimized loss.
pub trait RewardModel<B: Backend> {
    fn name(&self) -> &str;

    /// Per-sample reward for an image batch and its text conditioning.
    fn score(
        &self,
        images: Tensor<B, 2>,
        tokenized_text: &ArrayView2<'_, i64>,
    ) -> Result<Tensor<B, 1>>;
}

/// Cosine affinity between a pooled text embedding and a linear projection of the image.
///
/// A stand-in for CLIP-style preference scorers: random frozen tables, but the right gradient
/// and shape behavior.
#[derive(Debug, Clone)]
pub struct PromptAffinityReward<B: Backend> {
    name: String,
    token_embed: Tensor<B, 2>,
    proj: Tensor<B, 2>,
    vocab_size: usize,
}

impl<B: Backend> PromptAffinityReward<B> {
    pub fn new(
        device: &B::Device,
        name: impl Into<String>,
        vocab_size: usize,
        image_dim: usize,
        embed_dim: usize,
        seed: u64,
    ) -> Result<Self> {
        if vocab_size == 0 || image_dim == 0 || embed_dim == 0 {
            return Err(Error::Domain("reward dimensions must be >= 1"));
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let scale = 1.0 / (embed_dim as f32).sqrt();
        let mut gauss = |rows: usize, cols: usize| {
            let mut w = Array2::<f32>::zeros((rows, cols));
            for i in 0..rows {
                for k in 0..cols {
                    let z: f32 = StandardNormal.sample(&mut rng);
                    w[[i, k]] = scale * z;
                }
            }
            w
        };
        let token_embed = gauss(vocab_size, embed_dim);
        let proj = gauss(image_dim, embed_dim);
        Ok(Self {
            name: name.into(),
            token_embed: array2_to_tensor(device, &token_embed.view()),
            proj: array2_to_tensor(device, &proj.view()),
            vocab_size,
        })
    }

    fn pooled_text(&self, tokenized_text: &ArrayView2<'_, i64>) -> Result<Tensor<B, 1, Int>> {
        if tokenized_text
            .iter()
            .any(|&id| id < 0 || id as usize >= self.vocab_size)
        {
            return Err(Error::Domain("token id out of reward vocabulary"));
        }
        let flat: Vec<i64> = tokenized_text.iter().copied().collect();
        let n = flat.len();
        Ok(Tensor::from_data(
            TensorData::new(flat, [n]),
            &self.token_embed.device(),
        ))
    }
}

impl<B: Backend> RewardModel<B> for PromptAffinityReward<B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn score(
        &self,
        images: Tensor<B, 2>,
        tokenized_text: &ArrayView2<'_, i64>,
    ) -> Result<Tensor<B, 1>> {
        let [b, img_dim] = images.dims();
        let (tb, seq) = tokenized_text.dim();
        if tb != b {
            return Err(Error::Shape("reward batch sizes disagree"));
        }
        if img_dim != self.proj.dims()[0] {
            return Err(Error::Shape("image width disagrees with reward projection"));
        }

        let [_, embed_dim] = self.proj.dims();
        let indices = self.pooled_text(tokenized_text)?;
        let text = self
            .token_embed
            .clone()
            .select(0, indices)
            .reshape([b, seq, embed_dim])
            .mean_dim(1)
            .reshape([b, embed_dim]);

        let img = images.matmul(self.proj.clone());

        let dot = (text.clone() * img.clone()).sum_dim(1).reshape([b]);
        let tn = (text.clone() * text).sum_dim(1).sqrt().reshape([b]);
        let in_ = (img.clone() * img).sum_dim(1).sqrt().reshape([b]);
        Ok(dot / (tn * in_).add_scalar(1e-6))
    }
}

/// Text-free reward: per-sample pixel variance.
///
/// Useful as a validation scorer that rewards non-collapsed images.
#[derive(Debug, Clone, Default)]
pub struct ContrastReward {
    name: String,
}

impl ContrastReward {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl<B: Backend> RewardModel<B> for ContrastReward {
    fn name(&self) -> &str {
        &self.name
    }

    fn score(
        &self,
        images: Tensor<B, 2>,
        _tokenized_text: &ArrayView2<'_, i64>,
    ) -> Result<Tensor<B, 1>> {
        let [b, d] = images.dims();
        if d == 0 {
            return Err(Error::Shape("image width must be >= 1"));
        }
        let mean = images.clone().mean_dim(1);
        let sq_mean = images.powf_scalar(2.0).mean_dim(1);
        Ok((sq_mean - mean.clone() * mean).reshape([b]))
    }
}
