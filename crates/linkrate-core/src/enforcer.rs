//! Rate enforcement with anti-thrash debounce.
//!
//! One [`QosEnforcer`] owns the enforcement state for one interface. Every
//! received estimate is converted to policing parameters and compared with
//! what was last programmed; the shaper is only invoked when the rate moved
//! out of the debounce deadband around that value.

use tracing::{debug, info, warn};

use crate::config::ConfigError;
use crate::mapper::RateEstimate;
use crate::shaper::TrafficShaper;
use crate::telemetry::{validate_topic, DEFAULT_TOPIC};

pub const DEFAULT_INTERFACE: &str = "s1-eth1";

/// How the policing burst is derived from the rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BurstPolicy {
    /// burst = rate_kbps
    MatchRate { floor_kb: u64 },
    /// burst = rate_kbps × fraction
    Fraction { fraction: f64, floor_kb: u64 },
}

impl Default for BurstPolicy {
    fn default() -> Self {
        BurstPolicy::MatchRate { floor_kb: 2000 }
    }
}

impl BurstPolicy {
    pub fn burst_kb(&self, rate_kbps: u64) -> u64 {
        match *self {
            BurstPolicy::MatchRate { floor_kb } => rate_kbps.max(floor_kb),
            BurstPolicy::Fraction { fraction, floor_kb } => {
                ((rate_kbps as f64 * fraction) as u64).max(floor_kb)
            }
        }
    }

    pub fn floor_kb(&self) -> u64 {
        match *self {
            BurstPolicy::MatchRate { floor_kb } | BurstPolicy::Fraction { floor_kb, .. } => {
                floor_kb
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let BurstPolicy::Fraction { fraction, .. } = *self {
            if !fraction.is_finite() || fraction <= 0.0 {
                return Err(ConfigError::invalid(
                    "burst_fraction",
                    format!("{fraction} must be a positive finite number"),
                ));
            }
        }
        Ok(())
    }
}

/// One enforcement target: an interface driven by one telemetry topic.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetConfig {
    pub interface: String,
    pub topic: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            interface: DEFAULT_INTERFACE.to_string(),
            topic: DEFAULT_TOPIC.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnforcerConfig {
    /// Deadband in kbps. 1 compares exact kbps values.
    pub debounce_granularity_kbps: u64,
    pub burst: BurstPolicy,
    pub shaper_program: String,
    pub targets: Vec<TargetConfig>,
}

impl Default for EnforcerConfig {
    fn default() -> Self {
        Self {
            debounce_granularity_kbps: 1,
            burst: BurstPolicy::default(),
            shaper_program: "ovs-vsctl".to_string(),
            targets: vec![TargetConfig::default()],
        }
    }
}

impl EnforcerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.debounce_granularity_kbps == 0 {
            return Err(ConfigError::invalid(
                "debounce_granularity_kbps",
                "must be at least 1",
            ));
        }
        self.burst.validate()?;
        if self.targets.is_empty() {
            return Err(ConfigError::invalid("targets", "at least one target required"));
        }
        for target in &self.targets {
            if target.interface.trim().is_empty() {
                return Err(ConfigError::invalid("interface", "must not be empty"));
            }
            validate_topic(&target.topic)?;
        }
        if self.shaper_program.trim().is_empty() {
            return Err(ConfigError::invalid("shaper_program", "must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnforcerStats {
    pub received: u64,
    pub applied: u64,
    /// Estimates that matched the last applied rate.
    pub suppressed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { rate_kbps: u64, burst_kb: u64 },
    Suppressed,
    Failed,
}

pub struct QosEnforcer<S> {
    interface: String,
    granularity_kbps: u64,
    burst: BurstPolicy,
    shaper: S,
    last_applied_kbps: Option<u64>,
    stats: EnforcerStats,
}

impl<S: TrafficShaper> QosEnforcer<S> {
    pub fn new(
        interface: impl Into<String>,
        config: &EnforcerConfig,
        shaper: S,
    ) -> Result<Self, ConfigError> {
        let interface = interface.into();
        if interface.trim().is_empty() {
            return Err(ConfigError::invalid("interface", "must not be empty"));
        }
        if config.debounce_granularity_kbps == 0 {
            return Err(ConfigError::invalid(
                "debounce_granularity_kbps",
                "must be at least 1",
            ));
        }
        config.burst.validate()?;
        Ok(Self {
            interface,
            granularity_kbps: config.debounce_granularity_kbps,
            burst: config.burst,
            shaper,
            last_applied_kbps: None,
            stats: EnforcerStats::default(),
        })
    }

    /// kbps value programmed for `rate`: floored to whole kbps, never below 1.
    pub fn rate_kbps(&self, rate: RateEstimate) -> u64 {
        (rate.bps() / 1000.0).floor().max(1.0) as u64
    }

    /// `rate` lies within the deadband around the last applied value:
    /// closer than `debounce_granularity_kbps`, measured on the unfloored kbps.
    pub fn within_deadband(&self, rate: RateEstimate) -> bool {
        let Some(last) = self.last_applied_kbps else {
            return false;
        };
        let kbps = (rate.bps() / 1000.0).max(1.0);
        (kbps - last as f64).abs() < self.granularity_kbps as f64
    }

    /// Applies one estimate. Shaper failures are logged, counted and leave
    /// the last applied rate untouched so the next estimate retries.
    pub fn apply(&mut self, rate: RateEstimate) -> ApplyOutcome {
        self.stats.received += 1;
        let rate_kbps = self.rate_kbps(rate);

        if self.within_deadband(rate) {
            self.stats.suppressed += 1;
            debug!(interface = %self.interface, rate_kbps, "rate unchanged, skipping");
            return ApplyOutcome::Suppressed;
        }

        let burst_kb = self.burst.burst_kb(rate_kbps);
        match self.shaper.shape(&self.interface, rate_kbps, burst_kb) {
            Ok(()) => {
                info!(
                    interface = %self.interface,
                    rate_kbps,
                    burst_kb,
                    previous_kbps = ?self.last_applied_kbps,
                    "ingress policing updated"
                );
                self.last_applied_kbps = Some(rate_kbps);
                self.stats.applied += 1;
                ApplyOutcome::Applied {
                    rate_kbps,
                    burst_kb,
                }
            }
            Err(e) => {
                warn!(interface = %self.interface, rate_kbps, error = %e, "shaping failed");
                self.stats.failed += 1;
                ApplyOutcome::Failed
            }
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn last_applied_kbps(&self) -> Option<u64> {
        self.last_applied_kbps
    }

    pub fn stats(&self) -> EnforcerStats {
        self.stats
    }

    pub fn shaper(&self) -> &S {
        &self.shaper
    }
}
