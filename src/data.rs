//! Batches and the dataloader/transform collaborator seams.
//!
//! The loop's data contract is deliberately thin: a batch is tokenized text conditioning, plus
//! (after sampling) the generated image. Prefetching, augmentation, and real dataset plumbing
//! belong to the `BatchSource` implementor, not to this crate.

use burn_core::tensor::backend::Backend;
use burn_core::tensor::{Int, Tensor, TensorData};
use ndarray::{Array2, ArrayView2, Axis};
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

use crate::{Error, Result};

/// One training/evaluation batch.
///
/// Owned by a single step: produced by a `BatchSource`, mutated in place by the sampling
/// procedure (the `image` field is filled in), consumed by the reward models, then dropped.
#[derive(Debug, Clone)]
pub struct Batch<B: Backend> {
    /// Tokenized text conditioning, one row per sample.
    pub tokenized_text: Array2<i64>,
    /// Generated image, written by the sampling procedure.
    pub image: Option<Tensor<B, 2>>,
}

impl<B: Backend> Batch<B> {
    pub fn new(tokenized_text: Array2<i64>) -> Self {
        Self {
            tokenized_text,
            image: None,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.tokenized_text.nrows()
    }
}

/// The dataloader collaborator: yields batches until exhausted for the epoch.
pub trait BatchSource<B: Backend> {
    /// Next batch, or `None` when the epoch is exhausted.
    ///
    /// The rng is the loop's deterministic stream; sources that shuffle must draw from it so
    /// runs stay reproducible end to end.
    fn next_batch(&mut self, rng: &mut ChaCha8Rng) -> Result<Option<Batch<B>>>;

    /// Rewind for the next epoch.
    fn reset(&mut self);
}

/// A batch transform applied before sampling (device moves, truncation, and so on).
pub trait BatchTransform<B: Backend> {
    fn apply(&self, batch: &mut Batch<B>) -> Result<()>;
}

/// In-memory prompt source: a fixed token matrix served in (optionally shuffled) minibatches.
///
/// This is the reference `BatchSource` used by the tests and benches; real dataloaders live
/// outside the crate.
#[derive(Debug, Clone)]
pub struct InMemoryPrompts {
    ids: Array2<i64>,
    batch_size: usize,
    shuffle: bool,
    order: Vec<usize>,
    cursor: usize,
}

impl InMemoryPrompts {
    pub fn new(ids: Array2<i64>, batch_size: usize, shuffle: bool) -> Result<Self> {
        if ids.nrows() == 0 || ids.ncols() == 0 {
            return Err(Error::Domain("prompt matrix must be non-empty"));
        }
        if batch_size == 0 {
            return Err(Error::Domain("batch_size must be >= 1"));
        }
        let order = (0..ids.nrows()).collect();
        Ok(Self {
            ids,
            batch_size,
            shuffle,
            order,
            cursor: 0,
        })
    }

    /// Number of batches per epoch (the final ragged batch counts).
    pub fn batches_per_epoch(&self) -> usize {
        self.ids.nrows().div_ceil(self.batch_size)
    }
}

impl<B: Backend> BatchSource<B> for InMemoryPrompts {
    fn next_batch(&mut self, rng: &mut ChaCha8Rng) -> Result<Option<Batch<B>>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }
        if self.cursor == 0 && self.shuffle {
            self.order.shuffle(rng);
        }

        let end = (self.cursor + self.batch_size).min(self.order.len());
        let rows: Vec<usize> = self.order[self.cursor..end].to_vec();
        self.cursor = end;

        let ids = self.ids.select(Axis(0), &rows);
        Ok(Some(Batch::new(ids)))
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }
}

/// Host `f32` matrix → backend tensor.
pub fn array2_to_tensor<B: Backend>(device: &B::Device, x: &ArrayView2<'_, f32>) -> Tensor<B, 2> {
    let (n, d) = x.dim();
    let data = TensorData::new(x.iter().copied().collect::<Vec<f32>>(), [n, d]);
    Tensor::from_data(data, device)
}

/// Host token-id matrix → backend int tensor.
pub fn ids_to_tensor<B: Backend>(
    device: &B::Device,
    ids: &ArrayView2<'_, i64>,
) -> Tensor<B, 2, Int> {
    let (n, s) = ids.dim();
    let data = TensorData::new(ids.iter().copied().collect::<Vec<i64>>(), [n, s]);
    Tensor::from_data(data, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use rand::SeedableRng;

    type B = NdArray<f32>;

    fn prompt_matrix(n: usize, s: usize) -> Array2<i64> {
        let mut ids = Array2::<i64>::zeros((n, s));
        for i in 0..n {
            for k in 0..s {
                ids[[i, k]] = ((i * 31 + k * 7) % 97) as i64;
            }
        }
        ids
    }

    #[test]
    fn in_memory_prompts_cover_every_row_once_per_epoch() {
        let mut src = InMemoryPrompts::new(prompt_matrix(10, 4), 3, true).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        let mut seen = 0usize;
        let mut batches = 0usize;
        while let Some(batch) = BatchSource::<B>::next_batch(&mut src, &mut rng).unwrap() {
            seen += batch.batch_size();
            batches += 1;
        }
        assert_eq!(seen, 10);
        assert_eq!(batches, src.batches_per_epoch());

        // Exhausted until reset.
        assert!(BatchSource::<B>::next_batch(&mut src, &mut rng)
            .unwrap()
            .is_none());
        BatchSource::<B>::reset(&mut src);
        assert!(BatchSource::<B>::next_batch(&mut src, &mut rng)
            .unwrap()
            .is_some());
    }

    #[test]
    fn shuffled_order_is_seed_deterministic() {
        let ids = prompt_matrix(8, 3);
        let mut a = InMemoryPrompts::new(ids.clone(), 8, true).unwrap();
        let mut b = InMemoryPrompts::new(ids, 8, true).unwrap();
        let mut rng_a = ChaCha8Rng::seed_from_u64(42);
        let mut rng_b = ChaCha8Rng::seed_from_u64(42);

        let ba = BatchSource::<B>::next_batch(&mut a, &mut rng_a).unwrap().unwrap();
        let bb = BatchSource::<B>::next_batch(&mut b, &mut rng_b).unwrap().unwrap();
        assert_eq!(ba.tokenized_text, bb.tokenized_text);
    }

    #[test]
    fn conversion_helpers_preserve_shape() {
        let device = Default::default();
        let ids = prompt_matrix(2, 5);
        let t = ids_to_tensor::<B>(&device, &ids.view());
        assert_eq!(t.dims(), [2, 5]);
    }
}
