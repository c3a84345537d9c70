//! # linkrate-core
//!
//! Cross-layer rate control: a radio link's received power is turned into a
//! target bit rate, published as telemetry, and enforced as ingress policing
//! on the wired side so the wired link never outruns the radio channel.
//!
//! ## Crate structure
//!
//! - [`sample`]: Complex baseband samples
//! - [`ewma`]: Exponentially weighted moving average
//! - [`estimator`]: Smoothed power metric from sample buffers
//! - [`mapper`]: Power → bit rate policies (continuous, hysteresis)
//! - [`telemetry`]: Wire framing and the TCP publish/subscribe transport
//! - [`shaper`]: External traffic-shaping primitive (`ovs-vsctl`)
//! - [`enforcer`]: Debounced application of rate estimates
//! - [`pipeline`]: Estimation side wiring (estimator → mapper → publish)
//! - [`runtime`]: Enforcement worker thread (subscribe → enforce)
//! - [`config`]: TOML configuration and validation

pub mod config;
pub mod enforcer;
pub mod estimator;
pub mod ewma;
pub mod mapper;
pub mod pipeline;
pub mod runtime;
pub mod sample;
pub mod shaper;
pub mod telemetry;

pub use config::{ConfigError, ConfigOverrides, LinkrateConfig};
pub use enforcer::{ApplyOutcome, BurstPolicy, EnforcerConfig, EnforcerStats, QosEnforcer};
pub use estimator::{EstimatorConfig, PowerEstimator};
pub use mapper::{ContinuousMapper, HysteresisMapper, MapperConfig, RateEstimate, RateMapper};
pub use pipeline::{RateLoop, Tick};
pub use runtime::{EnforcerWorker, ShutdownSignal};
pub use sample::IqSample;
pub use shaper::{DryRunShaper, OvsShaper, ShapeError, TrafficShaper};
