//! Adaptive loss scaling for mixed-precision-style training.
//!
//! The loop multiplies the loss by a scale factor before backprop; if any resulting parameter
//! gradient is non-finite, that optimizer step is skipped and the scale shrinks, otherwise the
//! scale grows every `growth_interval` good steps. With the momentum-free SGD used in this
//! crate, dividing the learning rate by the scale is exactly equivalent to unscaling the
//! gradients, so the trainer applies `lr / scale` instead of touching the gradient tensors.

/// Scaler configuration. Defaults follow the conventional AMP values.
#[derive(Debug, Clone, Copy)]
pub struct GradScalerConfig {
    pub init_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    /// Consecutive finite steps before the scale grows.
    pub growth_interval: usize,
    /// Disabled scalers report a fixed scale of 1 and never skip.
    pub enabled: bool,
}

impl Default for GradScalerConfig {
    fn default() -> Self {
        Self {
            init_scale: 65_536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2_000,
            enabled: true,
        }
    }
}

impl GradScalerConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if !self.init_scale.is_finite() || self.init_scale <= 0.0 {
            return Err(crate::Error::Domain("init_scale must be positive and finite"));
        }
        if self.growth_factor <= 1.0 {
            return Err(crate::Error::Domain("growth_factor must be > 1"));
        }
        if self.backoff_factor <= 0.0 || self.backoff_factor >= 1.0 {
            return Err(crate::Error::Domain("backoff_factor must be in (0, 1)"));
        }
        if self.growth_interval == 0 {
            return Err(crate::Error::Domain("growth_interval must be >= 1"));
        }
        Ok(())
    }
}

/// Scale-factor state machine. Mutated once per step, sequentially.
#[derive(Debug, Clone)]
pub struct GradScaler {
    cfg: GradScalerConfig,
    scale: f32,
    good_steps: usize,
    overflows: usize,
}

impl GradScaler {
    pub fn new(cfg: GradScalerConfig) -> crate::Result<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            scale: cfg.init_scale,
            good_steps: 0,
            overflows: 0,
        })
    }

    /// Current multiplier applied to the loss.
    pub fn scale(&self) -> f32 {
        if self.cfg.enabled {
            self.scale
        } else {
            1.0
        }
    }

    /// Overflow events observed so far (each one skipped an optimizer step).
    pub fn overflows(&self) -> usize {
        self.overflows
    }

    /// Record the outcome of one step. `found_inf` means the step was skipped.
    pub fn update(&mut self, found_inf: bool) {
        if !self.cfg.enabled {
            return;
        }
        if found_inf {
            self.overflows += 1;
            self.good_steps = 0;
            self.scale = (self.scale * self.cfg.backoff_factor).max(f32::MIN_POSITIVE);
        } else {
            self.good_steps += 1;
            if self.good_steps >= self.cfg.growth_interval {
                self.good_steps = 0;
                self.scale = (self.scale * self.cfg.growth_factor).min(f32::MAX / 2.0);
            }
        }
    }
}
