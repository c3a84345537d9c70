//! # Rate Mapping
//!
//! Converts the smoothed power metric into a target bit rate. Two policies
//! share the [`RateMapper`] interface and are picked by configuration:
//!
//! - [`ContinuousMapper`]: proportional. Power is normalised into
//!   `[0, 1]`, square-rooted so the perceived control granularity is linear
//!   in power, and scaled between `rate_max` (clean channel) and `rate_min`
//!   (saturated channel). The result is quantised to reduce telemetry churn.
//! - [`HysteresisMapper`]: two discrete levels separated by a dead zone.
//!   Inside the dead zone the previous level is kept, so the rate cannot
//!   flap around a single decision boundary.
//!
//! Higher received power means more noise on the channel, so power and rate
//! move in opposite directions.

use serde::Deserialize;

use crate::config::ConfigError;

/// Target bit rate in bits per second.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct RateEstimate(f64);

impl RateEstimate {
    pub const fn from_bps(bps: f64) -> Self {
        RateEstimate(bps)
    }

    pub fn bps(self) -> f64 {
        self.0
    }

    pub fn mbps(self) -> f64 {
        self.0 / 1e6
    }
}

impl std::fmt::Display for RateEstimate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.1} Mbps", self.mbps())
    }
}

/// Which mapping policy to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapperPolicy {
    #[default]
    Continuous,
    Hysteresis,
}

impl MapperPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MapperPolicy::Continuous => "continuous",
            MapperPolicy::Hysteresis => "hysteresis",
        }
    }
}

impl std::str::FromStr for MapperPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continuous" => Ok(MapperPolicy::Continuous),
            "hysteresis" => Ok(MapperPolicy::Hysteresis),
            other => Err(ConfigError::invalid(
                "policy",
                format!("unknown mapper policy '{other}'"),
            )),
        }
    }
}

/// Power → rate conversion. Emits exactly one estimate per call.
pub trait RateMapper: Send {
    fn map(&mut self, avg_power: f64) -> RateEstimate;

    fn policy(&self) -> MapperPolicy;
}

// ─── Continuous ─────────────────────────────────────────────────────────────

/// Configuration for [`ContinuousMapper`].
#[derive(Debug, Clone, PartialEq)]
pub struct ContinuousConfig {
    /// Power at which the full `rate_max` is allowed.
    pub pwr_min: f64,
    /// Power at which the rate bottoms out at `rate_min`.
    pub pwr_max: f64,
    /// Lower output bound (bits/s).
    pub rate_min: f64,
    /// Upper output bound (bits/s).
    pub rate_max: f64,
    /// Output is rounded to the nearest multiple of this (bits/s). 0 disables.
    pub granularity: f64,
}

impl Default for ContinuousConfig {
    fn default() -> Self {
        ContinuousConfig {
            pwr_min: 0.3,
            pwr_max: 1.3,
            rate_min: 1_000_000.0,
            rate_max: 10_000_000.0,
            granularity: 100_000.0,
        }
    }
}

impl ContinuousConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("pwr_min", self.pwr_min),
            ("pwr_max", self.pwr_max),
            ("rate_min", self.rate_min),
            ("rate_max", self.rate_max),
            ("granularity", self.granularity),
        ] {
            if !value.is_finite() {
                return Err(ConfigError::invalid(field, "must be finite"));
            }
        }
        if self.pwr_min >= self.pwr_max {
            return Err(ConfigError::invalid(
                "pwr_min",
                format!(
                    "must be below pwr_max ({} >= {})",
                    self.pwr_min, self.pwr_max
                ),
            ));
        }
        if self.rate_min < 0.0 {
            return Err(ConfigError::invalid("rate_min", "must not be negative"));
        }
        if self.rate_min > self.rate_max {
            return Err(ConfigError::invalid(
                "rate_min",
                format!(
                    "must not exceed rate_max ({} > {})",
                    self.rate_min, self.rate_max
                ),
            ));
        }
        if self.granularity < 0.0 {
            return Err(ConfigError::invalid("granularity", "must not be negative"));
        }
        Ok(())
    }
}

/// Proportional power → rate mapping with square-root linearisation.
#[derive(Debug, Clone)]
pub struct ContinuousMapper {
    config: ContinuousConfig,
}

impl ContinuousMapper {
    pub fn new(config: ContinuousConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(ContinuousMapper { config })
    }

    /// Position of `avg_power` within `[pwr_min, pwr_max]`, clipped to `[0, 1]`.
    ///
    /// A NaN power maps to 1.0 (worst channel).
    pub fn raw_factor(&self, avg_power: f64) -> f64 {
        let c = &self.config;
        let raw = (avg_power - c.pwr_min) / (c.pwr_max - c.pwr_min);
        if raw.is_nan() {
            1.0
        } else {
            raw.clamp(0.0, 1.0)
        }
    }

    /// `sqrt(raw_factor)`: capacity degrades faster than linearly near
    /// saturation, the square root makes the control feel linear in power.
    pub fn linear_factor(&self, avg_power: f64) -> f64 {
        self.raw_factor(avg_power).sqrt()
    }

    /// Unquantised rate for `avg_power`.
    pub fn raw_rate(&self, avg_power: f64) -> f64 {
        let c = &self.config;
        c.rate_max - self.linear_factor(avg_power) * (c.rate_max - c.rate_min)
    }
}

impl RateMapper for ContinuousMapper {
    fn map(&mut self, avg_power: f64) -> RateEstimate {
        let c = &self.config;
        let mut rate = self.raw_rate(avg_power);
        if c.granularity > 0.0 {
            rate = (rate / c.granularity).round() * c.granularity;
        }
        // Rounding may step past a bound that is not a multiple of the granularity.
        RateEstimate(rate.clamp(c.rate_min, c.rate_max))
    }

    fn policy(&self) -> MapperPolicy {
        MapperPolicy::Continuous
    }
}

// ─── Hysteresis ─────────────────────────────────────────────────────────────

/// Configuration for [`HysteresisMapper`].
#[derive(Debug, Clone, PartialEq)]
pub struct HysteresisConfig {
    /// Below this power the channel is considered clean → `rate_high`.
    pub low_thresh: f64,
    /// Above this power the channel is considered degraded → `rate_low`.
    pub high_thresh: f64,
    /// Rate for a clean channel (bits/s). Also the initial rate.
    pub rate_high: f64,
    /// Rate for a degraded channel (bits/s).
    pub rate_low: f64,
}

impl Default for HysteresisConfig {
    fn default() -> Self {
        HysteresisConfig {
            low_thresh: 1.2,
            high_thresh: 1.5,
            rate_high: 5_000_000.0,
            rate_low: 1_000_000.0,
        }
    }
}

impl HysteresisConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("low_thresh", self.low_thresh),
            ("high_thresh", self.high_thresh),
            ("rate_high", self.rate_high),
            ("rate_low", self.rate_low),
        ] {
            if !value.is_finite() {
                return Err(ConfigError::invalid(field, "must be finite"));
            }
        }
        if self.low_thresh >= self.high_thresh {
            return Err(ConfigError::invalid(
                "low_thresh",
                format!(
                    "must be below high_thresh ({} >= {})",
                    self.low_thresh, self.high_thresh
                ),
            ));
        }
        if self.rate_low < 0.0 {
            return Err(ConfigError::invalid("rate_low", "must not be negative"));
        }
        if self.rate_low > self.rate_high {
            return Err(ConfigError::invalid(
                "rate_low",
                format!(
                    "must not exceed rate_high ({} > {})",
                    self.rate_low, self.rate_high
                ),
            ));
        }
        Ok(())
    }
}

/// Two-level mapping with a hysteresis band between the thresholds.
#[derive(Debug, Clone)]
pub struct HysteresisMapper {
    config: HysteresisConfig,
    current_rate: f64,
}

impl HysteresisMapper {
    pub fn new(config: HysteresisConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let current_rate = config.rate_high;
        Ok(HysteresisMapper {
            config,
            current_rate,
        })
    }

    pub fn current_rate(&self) -> RateEstimate {
        RateEstimate(self.current_rate)
    }
}

impl RateMapper for HysteresisMapper {
    fn map(&mut self, avg_power: f64) -> RateEstimate {
        if avg_power > self.config.high_thresh {
            self.current_rate = self.config.rate_low;
        } else if avg_power < self.config.low_thresh {
            self.current_rate = self.config.rate_high;
        }
        // Between the thresholds (or NaN): keep the current level.
        RateEstimate(self.current_rate)
    }

    fn policy(&self) -> MapperPolicy {
        MapperPolicy::Hysteresis
    }
}

// ─── Selection ──────────────────────────────────────────────────────────────

/// A resolved mapper choice with its parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum MapperConfig {
    Continuous(ContinuousConfig),
    Hysteresis(HysteresisConfig),
}

impl Default for MapperConfig {
    fn default() -> Self {
        MapperConfig::Continuous(ContinuousConfig::default())
    }
}

impl MapperConfig {
    pub fn policy(&self) -> MapperPolicy {
        match self {
            MapperConfig::Continuous(_) => MapperPolicy::Continuous,
            MapperConfig::Hysteresis(_) => MapperPolicy::Hysteresis,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            MapperConfig::Continuous(c) => c.validate(),
            MapperConfig::Hysteresis(h) => h.validate(),
        }
    }

    /// Builds the configured mapper behind the common interface.
    pub fn build(&self) -> Result<Box<dyn RateMapper>, ConfigError> {
        Ok(match self {
            MapperConfig::Continuous(c) => Box::new(ContinuousMapper::new(c.clone())?),
            MapperConfig::Hysteresis(h) => Box::new(HysteresisMapper::new(h.clone())?),
        })
    }
}
