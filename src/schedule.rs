//! Noise schedule + midpoint policy for partial denoising.
//!
//! This module is tiny and deterministic: the schedule is a pure function of its configuration
//! (no stateful drift between calls), and the DDIM-style update is fixed-step with no hidden
//! tolerances.
//!
//! Index convention: a schedule with `count` discretization steps owns a table
//! `alpha_bar[0..=count]` where index `0` is the noisiest point of the trajectory and index
//! `count` is the clean end (`alpha_bar == 1`). Advancing from index `i` to `i + 1` removes
//! noise.

use burn_core::tensor::backend::Backend;
use burn_core::tensor::Tensor;

use crate::{Error, Result};

/// Numeric floor for `alpha_bar` at the noisy end; keeps `1/sqrt(alpha_bar)` bounded in f32.
const ALPHA_BAR_FLOOR: f32 = 1e-4;

/// Shape of the `alpha_bar` curve over the trajectory.
///
/// `s` below is the *remaining-noise fraction*: `s = 1 - index / count`, so `s = 1` at the
/// noisy end of the trajectory and `s = 0` at the clean end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseSchedule {
    /// `alpha_bar(s) = 1 - s`.
    Linear,
    /// Squared-cosine curve (Nichol & Dhariwal, arXiv:2102.09672):
    /// `alpha_bar(s) = cos^2(((s + 0.008) / 1.008) * pi/2)`, normalized so `alpha_bar(0) = 1`.
    Cosine,
}

impl Default for NoiseSchedule {
    fn default() -> Self {
        Self::Cosine
    }
}

impl NoiseSchedule {
    /// `alpha_bar` as a function of remaining-noise fraction `s in [0, 1]`, clamped away from 0.
    #[inline]
    pub fn alpha_bar(self, s: f32) -> f32 {
        let raw = match self {
            NoiseSchedule::Linear => 1.0 - s,
            NoiseSchedule::Cosine => {
                let f = |u: f32| {
                    let c = ((u + 0.008) / 1.008 * core::f32::consts::FRAC_PI_2).cos();
                    c * c
                };
                f(s) / f(0.0)
            }
        };
        raw.clamp(ALPHA_BAR_FLOOR, 1.0)
    }
}

/// An immutable discretized noise schedule, as configured by `set_timesteps`.
///
/// Construction is a pure function of `(kind, count)`: building the same schedule twice yields
/// tables that compare equal, which is how the idempotence contract of `set_timesteps` is
/// verified.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffusionSchedule {
    kind: NoiseSchedule,
    count: usize,
    alpha_bar: Vec<f32>,
}

impl DiffusionSchedule {
    pub fn new(kind: NoiseSchedule, count: usize) -> Result<Self> {
        if count < 2 {
            return Err(Error::Domain("schedule needs at least 2 steps"));
        }
        let alpha_bar = (0..=count)
            .map(|i| kind.alpha_bar(1.0 - i as f32 / count as f32))
            .collect();
        Ok(Self {
            kind,
            count,
            alpha_bar,
        })
    }

    /// Number of discretization steps; valid trajectory indices are `0..=count`.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn kind(&self) -> NoiseSchedule {
        self.kind
    }

    /// `alpha_bar` at a trajectory index.
    pub fn alpha_bar(&self, index: usize) -> Result<f32> {
        self.alpha_bar
            .get(index)
            .copied()
            .ok_or(Error::Domain("trajectory index out of schedule bounds"))
    }

    /// Fraction of the trajectory already traversed at `index` (0 at pure noise, 1 at clean).
    ///
    /// Used as the scalar time feature fed to noise predictors.
    pub fn progress(&self, index: usize) -> f32 {
        index as f32 / self.count as f32
    }
}

/// One deterministic DDIM-style update from `from_index` to `from_index + 1`.
///
/// Given the latent `x` at `from_index` and the predicted noise `eps`:
///
/// \[
/// \hat{x}_0 = (x - \sqrt{1-\bar\alpha_i}\,\epsilon) / \sqrt{\bar\alpha_i},
/// \qquad
/// x_{i+1} = \sqrt{\bar\alpha_{i+1}}\,\hat{x}_0 + \sqrt{1-\bar\alpha_{i+1}}\,\epsilon.
/// \]
///
/// Returns `(x_next, pred_x0)`. Generic over any `Backend` so the same arithmetic serves both
/// the no-grad prefix (inner backend) and the single gradient-enabled step (autodiff backend).
pub fn ddim_advance<B: Backend>(
    schedule: &DiffusionSchedule,
    x: Tensor<B, 2>,
    eps: Tensor<B, 2>,
    from_index: usize,
) -> Result<(Tensor<B, 2>, Tensor<B, 2>)> {
    let a_from = schedule.alpha_bar(from_index)?;
    let a_to = schedule.alpha_bar(from_index + 1)?;

    let inv_sqrt_a = 1.0 / a_from.sqrt();
    let noise_coef = (1.0 - a_from).sqrt() * inv_sqrt_a;

    let pred_x0 = x.mul_scalar(inv_sqrt_a) - eps.clone().mul_scalar(noise_coef);
    let x_next = pred_x0.clone().mul_scalar(a_to.sqrt()) + eps.mul_scalar((1.0 - a_to).sqrt());
    Ok((x_next, pred_x0))
}

/// The band of trajectory indices the midpoint may be drawn from.
///
/// `max_mid` is also the `count` handed to `set_timesteps`, so the gradient-enabled step from
/// `m` to `m + 1` always stays inside the schedule table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidpointRange {
    pub min_mid: usize,
    pub max_mid: usize,
}

impl MidpointRange {
    /// Fail-fast configuration check: the training draw below needs a non-empty half-open
    /// range `[min_mid, max_mid - 1)`.
    pub fn validate(&self) -> Result<()> {
        if self.max_mid < 2 || self.max_mid - 1 <= self.min_mid {
            return Err(Error::InvalidScheduleRange {
                min_mid: self.min_mid,
                max_mid: self.max_mid,
            });
        }
        Ok(())
    }

    /// Draw the midpoint `m`:
    ///
    /// - training: uniform integer in `[min_mid, max_mid - 1)`,
    /// - evaluation: pinned to `max_mid - 1` so validation metrics are reproducible.
    ///
    /// Either way `min_mid <= m < max_mid`.
    pub fn sample(&self, is_train: bool, rng: &mut impl rand::Rng) -> Result<usize> {
        self.validate()?;
        if is_train {
            Ok(rng.random_range(self.min_mid..self.max_mid - 1))
        } else {
            Ok(self.max_mid - 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    type B = NdArray<f32>;

    #[test]
    fn schedule_table_is_monotone_and_anchored() {
        for kind in [NoiseSchedule::Linear, NoiseSchedule::Cosine] {
            let s = DiffusionSchedule::new(kind, 40).unwrap();
            let first = s.alpha_bar(0).unwrap();
            let last = s.alpha_bar(40).unwrap();
            assert!(first <= 2.0 * ALPHA_BAR_FLOOR, "noisy end: {first}");
            assert!((last - 1.0).abs() < 1e-6, "clean end: {last}");
            for i in 0..40 {
                assert!(s.alpha_bar(i).unwrap() <= s.alpha_bar(i + 1).unwrap() + 1e-7);
            }
        }
    }

    #[test]
    fn schedule_construction_is_idempotent() {
        let a = DiffusionSchedule::new(NoiseSchedule::Cosine, 24).unwrap();
        let b = DiffusionSchedule::new(NoiseSchedule::Cosine, 24).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn schedule_rejects_degenerate_counts() {
        assert!(DiffusionSchedule::new(NoiseSchedule::Linear, 1).is_err());
    }

    #[test]
    fn ddim_advance_with_zero_noise_recovers_x0_scaling() {
        let device = Default::default();
        let sched = DiffusionSchedule::new(NoiseSchedule::Linear, 10).unwrap();
        let x = Tensor::<B, 2>::from_data([[0.5f32, -0.25], [1.0, 0.0]], &device);
        let eps = Tensor::<B, 2>::zeros([2, 2], &device);

        let (x_next, pred_x0) = ddim_advance(&sched, x.clone(), eps, 5).unwrap();

        let a5 = sched.alpha_bar(5).unwrap();
        let a6 = sched.alpha_bar(6).unwrap();
        let x_vals = x.to_data().to_vec::<f32>().unwrap();
        let p_vals = pred_x0.to_data().to_vec::<f32>().unwrap();
        let n_vals = x_next.to_data().to_vec::<f32>().unwrap();
        for k in 0..4 {
            assert!((p_vals[k] - x_vals[k] / a5.sqrt()).abs() < 1e-5);
            assert!((n_vals[k] - p_vals[k] * a6.sqrt()).abs() < 1e-5);
        }
    }

    #[test]
    fn midpoint_range_rejects_empty_band() {
        for (min_mid, max_mid) in [(5usize, 6usize), (5, 5), (7, 6), (0, 1)] {
            let r = MidpointRange { min_mid, max_mid };
            assert!(
                matches!(r.validate(), Err(Error::InvalidScheduleRange { .. })),
                "expected failure for min={min_mid} max={max_mid}"
            );
        }
    }

    #[test]
    fn eval_midpoint_is_pinned() {
        let r = MidpointRange {
            min_mid: 10,
            max_mid: 40,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..16 {
            assert_eq!(r.sample(false, &mut rng).unwrap(), 39);
        }
    }

    proptest! {
        #[test]
        fn train_midpoints_stay_in_band(
            min_mid in 0usize..30,
            width in 2usize..40,
            seed in 0u64..64,
        ) {
            let r = MidpointRange { min_mid, max_mid: min_mid + width };
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            for _ in 0..32 {
                let m = r.sample(true, &mut rng).unwrap();
                prop_assert!(m >= r.min_mid);
                prop_assert!(m < r.max_mid);
            }
        }

        #[test]
        fn same_seed_same_midpoint_sequence(seed in 0u64..256) {
            let r = MidpointRange { min_mid: 3, max_mid: 20 };
            let mut a = ChaCha8Rng::seed_from_u64(seed);
            let mut b = ChaCha8Rng::seed_from_u64(seed);
            for _ in 0..16 {
                prop_assert_eq!(r.sample(true, &mut a).unwrap(), r.sample(true, &mut b).unwrap());
            }
        }
    }
}
