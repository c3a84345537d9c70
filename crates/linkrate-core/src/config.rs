//! TOML configuration.
//!
//! The file is parsed into `*Input` structs where every field is optional,
//! then [`LinkrateConfigInput::resolve`] fills defaults and validates. Any
//! inconsistency is a [`ConfigError`] and the process refuses to start.
//!
//! ```toml
//! version = 1
//!
//! [estimator]
//! alpha = 0.1
//! calibration_period = 100
//!
//! [mapper]
//! policy = "continuous"   # or "hysteresis"
//! pwr_min = 0.3
//! pwr_max = 1.3
//! rate_min = 1000000
//! rate_max = 10000000
//! granularity = 100000
//!
//! [telemetry]
//! endpoint = "127.0.0.1:5555"
//! topic = "BITRATE"
//!
//! [enforcer]
//! burst_policy = "match_rate"
//! burst_floor_kb = 2000
//!
//! [[enforcer.targets]]
//! interface = "s1-eth1"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::enforcer::{BurstPolicy, EnforcerConfig, TargetConfig};
use crate::estimator::EstimatorConfig;
use crate::mapper::{ContinuousConfig, HysteresisConfig, MapperConfig, MapperPolicy};
use crate::telemetry::TelemetryConfig;

pub const CONFIG_VERSION: u32 = 1;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported config version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

// ── Raw input ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LinkrateConfigInput {
    pub version: u32,
    pub estimator: EstimatorConfigInput,
    pub mapper: MapperConfigInput,
    pub telemetry: TelemetryConfigInput,
    pub enforcer: EnforcerConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EstimatorConfigInput {
    pub alpha: Option<f64>,
    pub calibration_period: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MapperConfigInput {
    pub policy: Option<MapperPolicy>,
    pub pwr_min: Option<f64>,
    pub pwr_max: Option<f64>,
    pub rate_min: Option<f64>,
    pub rate_max: Option<f64>,
    pub granularity: Option<f64>,
    pub low_thresh: Option<f64>,
    pub high_thresh: Option<f64>,
    pub rate_high: Option<f64>,
    pub rate_low: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TelemetryConfigInput {
    pub endpoint: Option<String>,
    pub topic: Option<String>,
    pub send_high_water_mark: Option<usize>,
    pub recv_timeout_ms: Option<u64>,
    pub reconnect_interval_ms: Option<u64>,
    pub publish_every: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BurstPolicyInput {
    #[default]
    MatchRate,
    Fraction,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EnforcerConfigInput {
    pub debounce_granularity_kbps: Option<u64>,
    pub burst_policy: Option<BurstPolicyInput>,
    pub burst_fraction: Option<f64>,
    pub burst_floor_kb: Option<u64>,
    pub shaper_program: Option<String>,
    pub targets: Vec<TargetConfigInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TargetConfigInput {
    pub interface: String,
    pub topic: Option<String>,
}

// ── Resolved ────────────────────────────────────────────────────────

/// Fully resolved, validated configuration for both sides of the loop.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkrateConfig {
    pub version: u32,
    pub estimator: EstimatorConfig,
    pub mapper: MapperConfig,
    pub telemetry: TelemetryConfig,
    pub enforcer: EnforcerConfig,
}

impl Default for LinkrateConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            estimator: EstimatorConfig::default(),
            mapper: MapperConfig::default(),
            telemetry: TelemetryConfig::default(),
            enforcer: EnforcerConfig::default(),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

impl LinkrateConfigInput {
    pub fn resolve(self) -> Result<LinkrateConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(version));
        }

        let estimator = {
            let d = EstimatorConfig::default();
            EstimatorConfig {
                alpha: self.estimator.alpha.unwrap_or(d.alpha),
                calibration_period: self
                    .estimator
                    .calibration_period
                    .unwrap_or(d.calibration_period),
            }
        };
        estimator.validate()?;

        let m = self.mapper;
        let mapper = match m.policy.unwrap_or_default() {
            MapperPolicy::Continuous => {
                let d = ContinuousConfig::default();
                MapperConfig::Continuous(ContinuousConfig {
                    pwr_min: m.pwr_min.unwrap_or(d.pwr_min),
                    pwr_max: m.pwr_max.unwrap_or(d.pwr_max),
                    rate_min: m.rate_min.unwrap_or(d.rate_min),
                    rate_max: m.rate_max.unwrap_or(d.rate_max),
                    granularity: m.granularity.unwrap_or(d.granularity),
                })
            }
            MapperPolicy::Hysteresis => {
                let d = HysteresisConfig::default();
                MapperConfig::Hysteresis(HysteresisConfig {
                    low_thresh: m.low_thresh.unwrap_or(d.low_thresh),
                    high_thresh: m.high_thresh.unwrap_or(d.high_thresh),
                    rate_high: m.rate_high.unwrap_or(d.rate_high),
                    rate_low: m.rate_low.unwrap_or(d.rate_low),
                })
            }
        };
        mapper.validate()?;

        let telemetry = {
            let d = TelemetryConfig::default();
            let t = self.telemetry;
            TelemetryConfig {
                endpoint: non_empty(t.endpoint).unwrap_or(d.endpoint),
                topic: non_empty(t.topic).unwrap_or(d.topic),
                send_high_water_mark: t
                    .send_high_water_mark
                    .unwrap_or(d.send_high_water_mark)
                    .max(1),
                publish_every: t.publish_every.unwrap_or(d.publish_every),
                recv_timeout: t.recv_timeout_ms.map(Duration::from_millis),
                reconnect_interval: t
                    .reconnect_interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(d.reconnect_interval),
            }
        };
        telemetry.validate()?;

        let enforcer = {
            let d = EnforcerConfig::default();
            let e = self.enforcer;
            let floor_kb = e.burst_floor_kb.unwrap_or(d.burst.floor_kb());
            let burst = match e.burst_policy.unwrap_or_default() {
                BurstPolicyInput::MatchRate => BurstPolicy::MatchRate { floor_kb },
                BurstPolicyInput::Fraction => BurstPolicy::Fraction {
                    fraction: e.burst_fraction.unwrap_or(0.1),
                    floor_kb,
                },
            };

            let mut targets = Vec::new();
            for target in e.targets {
                let interface = target.interface.trim().to_string();
                if interface.is_empty() {
                    return Err(ConfigError::invalid("interface", "must not be empty"));
                }
                if targets.iter().any(|t: &TargetConfig| t.interface == interface) {
                    return Err(ConfigError::invalid(
                        "interface",
                        format!("'{interface}' listed more than once"),
                    ));
                }
                targets.push(TargetConfig {
                    interface,
                    topic: non_empty(target.topic).unwrap_or_else(|| telemetry.topic.clone()),
                });
            }
            if targets.is_empty() {
                targets = vec![TargetConfig {
                    topic: telemetry.topic.clone(),
                    ..TargetConfig::default()
                }];
            }

            EnforcerConfig {
                debounce_granularity_kbps: e
                    .debounce_granularity_kbps
                    .unwrap_or(d.debounce_granularity_kbps),
                burst,
                shaper_program: non_empty(e.shaper_program).unwrap_or(d.shaper_program),
                targets,
            }
        };
        enforcer.validate()?;

        Ok(LinkrateConfig {
            version,
            estimator,
            mapper,
            telemetry,
            enforcer,
        })
    }
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub endpoint: Option<String>,
    pub topic: Option<String>,
    pub policy: Option<MapperPolicy>,
    /// Replaces the configured target list with this single interface.
    pub interface: Option<String>,
    pub publish_every: Option<u64>,
}

impl LinkrateConfigInput {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(toml::from_str(input)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(endpoint) = &overrides.endpoint {
            self.telemetry.endpoint = Some(endpoint.clone());
        }
        if let Some(topic) = &overrides.topic {
            self.telemetry.topic = Some(topic.clone());
            for target in &mut self.enforcer.targets {
                target.topic = None;
            }
        }
        if let Some(policy) = overrides.policy {
            self.mapper.policy = Some(policy);
        }
        if let Some(n) = overrides.publish_every {
            self.telemetry.publish_every = Some(n);
        }
        if let Some(interface) = &overrides.interface {
            self.enforcer.targets = vec![TargetConfigInput {
                interface: interface.clone(),
                topic: None,
            }];
        }
    }
}

impl LinkrateConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        LinkrateConfigInput::from_toml_str(input)?.resolve()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        LinkrateConfigInput::from_file(path.as_ref())?.resolve()
    }

    /// Loads `path` if given, otherwise the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_overrides(path, &ConfigOverrides::default())
    }

    /// Loads `path` (or the defaults), applies `overrides`, then validates.
    pub fn load_with_overrides(
        path: Option<&Path>,
        overrides: &ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let mut input = match path {
            Some(p) => LinkrateConfigInput::from_file(p)?,
            None => LinkrateConfigInput::default(),
        };
        input.apply_overrides(overrides);
        input.resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_defaults() {
        let cfg = LinkrateConfig::from_toml_str("  \n").unwrap();
        assert_eq!(cfg, LinkrateConfig::default());
        assert_eq!(cfg.telemetry.endpoint, "127.0.0.1:5555");
        assert_eq!(cfg.telemetry.topic, "BITRATE");
        assert_eq!(cfg.enforcer.targets.len(), 1);
        assert_eq!(cfg.enforcer.targets[0].interface, "s1-eth1");
        assert_eq!(cfg.enforcer.burst, BurstPolicy::MatchRate { floor_kb: 2000 });
    }

    #[test]
    fn parse_toml_config_basic() {
        let toml = r#"
            version = 1

            [estimator]
            alpha = 0.05
            calibration_period = 10

            [mapper]
            policy = "hysteresis"
            low_thresh = 1.1
            high_thresh = 1.6

            [telemetry]
            endpoint = "10.0.0.5:6000"
            topic = "RATE"
            recv_timeout_ms = 2500

            [enforcer]
            debounce_granularity_kbps = 50
            burst_policy = "fraction"
            burst_fraction = 0.2
            burst_floor_kb = 100

            [[enforcer.targets]]
            interface = "s1-eth2"

            [[enforcer.targets]]
            interface = "s2-eth1"
            topic = "RATE2"
        "#;

        let cfg = LinkrateConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.estimator.alpha, 0.05);
        assert_eq!(cfg.estimator.calibration_period, 10);
        match &cfg.mapper {
            MapperConfig::Hysteresis(h) => {
                assert_eq!(h.low_thresh, 1.1);
                assert_eq!(h.high_thresh, 1.6);
                assert_eq!(h.rate_high, 5_000_000.0);
                assert_eq!(h.rate_low, 1_000_000.0);
            }
            other => panic!("expected hysteresis, got {other:?}"),
        }
        assert_eq!(cfg.telemetry.endpoint, "10.0.0.5:6000");
        assert_eq!(cfg.telemetry.recv_timeout, Some(Duration::from_millis(2500)));
        assert_eq!(cfg.enforcer.debounce_granularity_kbps, 50);
        assert_eq!(
            cfg.enforcer.burst,
            BurstPolicy::Fraction {
                fraction: 0.2,
                floor_kb: 100
            }
        );
        assert_eq!(cfg.enforcer.targets.len(), 2);
        assert_eq!(cfg.enforcer.targets[0].topic, "RATE");
        assert_eq!(cfg.enforcer.targets[1].topic, "RATE2");
    }

    #[test]
    fn rejects_unsupported_version() {
        let err = LinkrateConfig::from_toml_str("version = 7").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedVersion(7)));
    }

    #[test]
    fn rejects_inverted_rate_bounds() {
        let toml = r#"
            [mapper]
            rate_min = 20000000
            rate_max = 1000000
        "#;
        let err = LinkrateConfig::from_toml_str(toml).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "rate_min",
                ..
            }
        ));
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let toml = r#"
            [mapper]
            policy = "hysteresis"
            low_thresh = 1.5
            high_thresh = 1.2
        "#;
        assert!(LinkrateConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn rejects_bad_alpha() {
        assert!(LinkrateConfig::from_toml_str("[estimator]\nalpha = 0.0").is_err());
        assert!(LinkrateConfig::from_toml_str("[estimator]\nalpha = 1.01").is_err());
    }

    #[test]
    fn rejects_duplicate_interfaces() {
        let toml = r#"
            [[enforcer.targets]]
            interface = "s1-eth1"
            [[enforcer.targets]]
            interface = " s1-eth1 "
        "#;
        assert!(LinkrateConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn rejects_unknown_policy() {
        let err = LinkrateConfig::from_toml_str("[mapper]\npolicy = \"pid\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = LinkrateConfig::from_file("/nonexistent/linkrate.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn overrides_take_precedence() {
        let mut input = LinkrateConfigInput::from_toml_str(
            r#"
            [telemetry]
            endpoint = "10.0.0.5:6000"

            [[enforcer.targets]]
            interface = "s1-eth2"
            topic = "OLD"
        "#,
        )
        .unwrap();
        input.apply_overrides(&ConfigOverrides {
            endpoint: Some("tcp://127.0.0.1:7000".into()),
            topic: Some("RATE".into()),
            policy: Some(MapperPolicy::Hysteresis),
            interface: Some("eth9".into()),
            publish_every: Some(8),
        });
        let cfg = input.resolve().unwrap();
        assert_eq!(cfg.telemetry.endpoint, "tcp://127.0.0.1:7000");
        assert_eq!(cfg.mapper.policy(), MapperPolicy::Hysteresis);
        assert_eq!(cfg.telemetry.publish_every, 8);
        assert_eq!(
            cfg.enforcer.targets,
            vec![TargetConfig {
                interface: "eth9".into(),
                topic: "RATE".into(),
            }]
        );
    }

    #[test]
    fn topic_override_reaches_all_targets() {
        let mut input = LinkrateConfigInput::from_toml_str(
            r#"
            [[enforcer.targets]]
            interface = "a"
            topic = "X"
            [[enforcer.targets]]
            interface = "b"
        "#,
        )
        .unwrap();
        input.apply_overrides(&ConfigOverrides {
            topic: Some("Y".into()),
            ..ConfigOverrides::default()
        });
        let cfg = input.resolve().unwrap();
        assert!(cfg.enforcer.targets.iter().all(|t| t.topic == "Y"));
    }

    #[test]
    fn rejects_zero_receive_timeout() {
        let err = LinkrateConfig::from_toml_str("[telemetry]\nrecv_timeout_ms = 0").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "recv_timeout_ms",
                ..
            }
        ));
    }

    #[test]
    fn publish_every_defaults_to_each_buffer() {
        let cfg = LinkrateConfig::default();
        assert_eq!(cfg.telemetry.publish_every, 1);
        assert_eq!(cfg.telemetry.send_high_water_mark, 100);

        let cfg = LinkrateConfig::from_toml_str("[telemetry]\npublish_every = 32").unwrap();
        assert_eq!(cfg.telemetry.publish_every, 32);
        assert!(LinkrateConfig::from_toml_str("[telemetry]\npublish_every = 0").is_err());
    }

    #[test]
    fn rejects_invalid_target_topic() {
        let toml = r#"
            [[enforcer.targets]]
            interface = "s1-eth1"
            [[enforcer.targets]]
            interface = "s1-eth2"
            topic = "BAD TOPIC"
        "#;
        let err = LinkrateConfig::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "topic", .. }));
    }
}
