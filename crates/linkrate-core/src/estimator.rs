//! # Power Estimation
//!
//! Turns buffers of complex baseband samples into a smoothed scalar power
//! metric. Each buffer contributes its mean instantaneous power
//! `mean(|s|^2)`, which is folded into an EWMA:
//!
//! ```text
//! avg_power = alpha * inst_power + (1 - alpha) * avg_power
//! ```
//!
//! During an optional calibration period (the first `N` buffers) the metric
//! follows `inst_power` directly so the average does not have to climb up
//! from zero.
//!
//! `update` is bounded and non-blocking: one pass over the buffer, no
//! allocation, no I/O.

use crate::config::ConfigError;
use crate::ewma::Ewma;
use crate::sample::IqSample;

/// Configuration for the power estimator.
#[derive(Debug, Clone, PartialEq)]
pub struct EstimatorConfig {
    /// EWMA smoothing factor, `0 < alpha <= 1`.
    pub alpha: f64,
    /// Number of initial buffers whose power is taken unsmoothed.
    /// 0 disables calibration.
    pub calibration_period: u32,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        EstimatorConfig {
            alpha: 0.1,
            calibration_period: 100,
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            return Err(ConfigError::invalid(
                "alpha",
                format!("must be in (0, 1], got {}", self.alpha),
            ));
        }
        Ok(())
    }
}

/// Mean instantaneous power of a buffer, `None` for an empty buffer.
pub fn instantaneous_power(buffer: &[IqSample]) -> Option<f64> {
    if buffer.is_empty() {
        return None;
    }
    let sum: f64 = buffer.iter().map(IqSample::norm_sqr).sum();
    Some(sum / buffer.len() as f64)
}

/// Smoothed received-power estimator.
///
/// State persists for the lifetime of the estimator and is never reset.
#[derive(Debug, Clone)]
pub struct PowerEstimator {
    ewma: Ewma,
    calibration_period: u32,
    /// Non-empty buffers consumed so far.
    buffers_seen: u64,
}

impl PowerEstimator {
    pub fn new(config: &EstimatorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(PowerEstimator {
            ewma: Ewma::new(config.alpha),
            calibration_period: config.calibration_period,
            buffers_seen: 0,
        })
    }

    /// Consumes one buffer and returns the updated power metric.
    ///
    /// An empty buffer leaves the state untouched and re-emits the last
    /// metric. A buffer whose power is not finite (corrupt samples) is
    /// treated the same way.
    pub fn update(&mut self, buffer: &[IqSample]) -> f64 {
        let Some(inst_power) = instantaneous_power(buffer) else {
            return self.ewma.value();
        };
        if !inst_power.is_finite() {
            return self.ewma.value();
        }

        if self.is_calibrating() {
            self.ewma.reset_to(inst_power);
        } else {
            self.ewma.update(inst_power);
        }
        self.buffers_seen += 1;
        self.ewma.value()
    }

    /// Current smoothed power.
    pub fn power(&self) -> f64 {
        self.ewma.value()
    }

    /// True while the next buffer will still be taken unsmoothed.
    pub fn is_calibrating(&self) -> bool {
        self.buffers_seen < self.calibration_period as u64
    }

    pub fn buffers_seen(&self) -> u64 {
        self.buffers_seen
    }

    pub fn alpha(&self) -> f64 {
        self.ewma.alpha()
    }
}
