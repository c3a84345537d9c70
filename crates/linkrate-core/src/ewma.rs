/// Exponentially Weighted Moving Average filter.
///
/// Smooths the per-buffer power measurement so a single noisy buffer does
/// not move the rate estimate.
///
/// The smoothing factor `alpha` controls responsiveness:
/// - `alpha` near 1.0: tracks input closely (low smoothing)
/// - `alpha` near 0.0: retains history (high smoothing)
///
/// The value starts at zero and the recurrence applies from the very first
/// measurement; use [`Ewma::reset_to`] to seed it directly.
#[derive(Debug, Clone)]
pub struct Ewma {
    value: f64,
    alpha: f64,
}

impl Ewma {
    /// Creates a new EWMA filter with the given smoothing factor (`0.0 < alpha <= 1.0`).
    ///
    /// The caller validates `alpha`; see [`crate::estimator::EstimatorConfig`].
    pub fn new(alpha: f64) -> Self {
        Self { value: 0.0, alpha }
    }

    /// Feeds a new measurement into the filter, updating the smoothed value.
    ///
    /// NaN or infinite measurements are silently ignored to prevent
    /// poisoning the smoothed value.
    pub fn update(&mut self, measurement: f64) -> f64 {
        if measurement.is_finite() {
            self.value = self.alpha * measurement + (1.0 - self.alpha) * self.value;
        }
        self.value
    }

    /// Overwrites the smoothed value, bypassing the recurrence.
    pub fn reset_to(&mut self, value: f64) {
        if value.is_finite() {
            self.value = value;
        }
    }

    /// Returns the current smoothed value.
    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }
}
