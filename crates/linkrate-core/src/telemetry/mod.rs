//! # Telemetry Channel
//!
//! Best-effort publish/subscribe transport carrying rate estimates from the
//! estimating side to the enforcing side.
//!
//! - [`wire`]: Stream framing and the canonical `[topic, f32 LE]` message
//! - [`publisher`]: Binds, fans out to subscribers, never blocks
//! - [`subscriber`]: Connects, filters by topic, blocks until a valid estimate
//! - [`tap`]: Unvalidated raw messages for inspection
//!
//! Delivery is fire-and-forget: a slow or absent subscriber misses
//! messages. Each received estimate is the whole truth about the current
//! rate, never a delta.

pub mod publisher;
pub mod subscriber;
pub mod tap;
pub mod wire;

use std::time::Duration;

use crate::config::ConfigError;

pub use publisher::{PublishReport, PublisherStats, TelemetryPublisher};
pub use subscriber::{RecvError, SubscriberOptions, SubscriberStats, TelemetrySubscriber};
pub use tap::TelemetryTap;
pub use wire::{DecodeError, TelemetryMessage};

pub const DEFAULT_TOPIC: &str = "BITRATE";
pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:5555";

/// Transport settings shared by both ends.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryConfig {
    /// `host:port`, optionally prefixed with `tcp://`. `*` as host binds all
    /// interfaces on the publisher side.
    pub endpoint: String,
    /// Default topic for publishing and subscribing.
    pub topic: String,
    /// Per-subscriber queue depth on the publisher before messages are dropped.
    pub send_high_water_mark: usize,
    /// Publish one estimate out of every `publish_every` buffers.
    pub publish_every: u64,
    /// Upper bound on a single blocking receive. `None` waits forever.
    pub recv_timeout: Option<Duration>,
    /// Delay between connection attempts while the publisher is absent.
    pub reconnect_interval: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            topic: DEFAULT_TOPIC.to_string(),
            send_high_water_mark: 100,
            publish_every: 1,
            recv_timeout: None,
            reconnect_interval: Duration::from_millis(500),
        }
    }
}

impl TelemetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        normalize_endpoint(&self.endpoint)?;
        validate_topic(&self.topic)?;
        if self.reconnect_interval.is_zero() {
            return Err(ConfigError::invalid(
                "reconnect_interval_ms",
                "must be greater than zero",
            ));
        }
        if self.recv_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::invalid(
                "recv_timeout_ms",
                "must be greater than zero",
            ));
        }
        if self.publish_every == 0 {
            return Err(ConfigError::invalid("publish_every", "must be at least 1"));
        }
        Ok(())
    }

    pub fn subscriber_options(&self) -> SubscriberOptions {
        SubscriberOptions {
            recv_timeout: self.recv_timeout,
            reconnect_interval: self.reconnect_interval,
        }
    }
}

/// Topics are short printable ASCII identifiers.
pub fn validate_topic(topic: &str) -> Result<(), ConfigError> {
    if topic.is_empty() {
        return Err(ConfigError::invalid("topic", "must not be empty"));
    }
    if topic.len() > 255 {
        return Err(ConfigError::invalid("topic", "longer than 255 bytes"));
    }
    if !topic.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(ConfigError::invalid(
            "topic",
            format!("'{topic}' must be printable ASCII without spaces"),
        ));
    }
    Ok(())
}

/// Strips an optional `tcp://` scheme and maps a `*` host to `0.0.0.0`.
///
/// Returns the `host:port` string accepted by `std::net`.
pub fn normalize_endpoint(endpoint: &str) -> Result<String, ConfigError> {
    let stripped = endpoint.trim().trim_start_matches("tcp://");
    let Some((host, port)) = stripped.rsplit_once(':') else {
        return Err(ConfigError::invalid(
            "endpoint",
            format!("'{endpoint}' has no port"),
        ));
    };
    if host.is_empty() {
        return Err(ConfigError::invalid(
            "endpoint",
            format!("'{endpoint}' has no host"),
        ));
    }
    port.parse::<u16>().map_err(|e| {
        ConfigError::invalid("endpoint", format!("invalid port in '{endpoint}': {e}"))
    })?;
    let host = if host == "*" { "0.0.0.0" } else { host };
    Ok(format!("{host}:{port}"))
}
