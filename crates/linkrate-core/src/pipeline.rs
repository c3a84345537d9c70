//! Estimation side of the loop: one buffer in, one published estimate out.

use bytes::Bytes;
use tracing::{debug, info};

use crate::config::ConfigError;
use crate::estimator::{EstimatorConfig, PowerEstimator};
use crate::mapper::{MapperConfig, MapperPolicy, RateEstimate, RateMapper};
use crate::sample::IqSample;
use crate::telemetry::{validate_topic, PublishReport, TelemetryMessage, TelemetryPublisher};

/// Result of processing one buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    pub power: f64,
    pub rate: RateEstimate,
    /// The rate differs from the previous tick's.
    pub changed: bool,
    /// `None` when no publisher is attached or this tick was thinned out.
    pub published: Option<PublishReport>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub buffers: u64,
    pub rate_changes: u64,
    pub published: u64,
    pub dropped: u64,
}

pub struct RateLoop {
    estimator: PowerEstimator,
    mapper: Box<dyn RateMapper>,
    publisher: Option<(TelemetryPublisher, Bytes)>,
    publish_every: u64,
    /// Replaces the mapped rate while set.
    manual_rate: Option<RateEstimate>,
    last_rate: Option<RateEstimate>,
    stats: LoopStats,
}

impl RateLoop {
    pub fn new(estimator: &EstimatorConfig, mapper: &MapperConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            estimator: PowerEstimator::new(estimator)?,
            mapper: mapper.build()?,
            publisher: None,
            publish_every: 1,
            manual_rate: None,
            last_rate: None,
            stats: LoopStats::default(),
        })
    }

    /// Publishes every estimate on `topic` through `publisher`.
    pub fn with_publisher(
        mut self,
        publisher: TelemetryPublisher,
        topic: &str,
    ) -> Result<Self, ConfigError> {
        validate_topic(topic)?;
        self.publisher = Some((publisher, Bytes::copy_from_slice(topic.as_bytes())));
        Ok(self)
    }

    /// Publishes on the first buffer and then once every `n` buffers.
    /// Estimation still runs on every buffer.
    pub fn with_publish_every(mut self, n: u64) -> Self {
        self.publish_every = n.max(1);
        self
    }

    /// Pins the emitted rate to `rate`, or returns to the mapped rate with
    /// `None`. The estimator and mapper keep tracking the input either way.
    pub fn set_manual_rate(&mut self, rate: Option<RateEstimate>) {
        if rate != self.manual_rate {
            info!(rate = ?rate.map(|r| r.bps()), "manual rate override");
        }
        self.manual_rate = rate;
    }

    pub fn manual_rate(&self) -> Option<RateEstimate> {
        self.manual_rate
    }

    pub fn process(&mut self, buffer: &[IqSample]) -> Tick {
        let power = self.estimator.update(buffer);
        let mapped = self.mapper.map(power);
        let rate = self.manual_rate.unwrap_or(mapped);
        let due = self.stats.buffers % self.publish_every == 0;
        self.stats.buffers += 1;

        let changed = self.last_rate != Some(rate);
        if changed {
            self.stats.rate_changes += 1;
            match self.last_rate {
                Some(prev) => info!(
                    from = %prev,
                    to = %rate,
                    direction = if rate > prev { "up" } else { "down" },
                    power,
                    "rate changed"
                ),
                None => info!(rate = %rate, power, "initial rate"),
            }
            self.last_rate = Some(rate);
        }
        debug!(
            power,
            rate_bps = rate.bps(),
            calibrating = self.estimator.is_calibrating(),
            "tick"
        );

        let published = self
            .publisher
            .as_ref()
            .filter(|_| due)
            .map(|(publisher, topic)| {
                publisher.publish(&TelemetryMessage::new(topic.clone(), rate))
            });
        if let Some(report) = published {
            self.stats.published += report.delivered as u64;
            self.stats.dropped += report.dropped as u64;
        }

        Tick {
            power,
            rate,
            changed,
            published,
        }
    }

    pub fn policy(&self) -> MapperPolicy {
        self.mapper.policy()
    }

    pub fn estimator(&self) -> &PowerEstimator {
        &self.estimator
    }

    pub fn publisher(&self) -> Option<&TelemetryPublisher> {
        self.publisher.as_ref().map(|(p, _)| p)
    }

    pub fn last_rate(&self) -> Option<RateEstimate> {
        self.last_rate
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::{ContinuousConfig, HysteresisConfig};

    fn constant(power: f32, len: usize) -> Vec<IqSample> {
        vec![IqSample::new(power.sqrt(), 0.0); len]
    }

    fn no_smoothing() -> EstimatorConfig {
        EstimatorConfig {
            alpha: 1.0,
            calibration_period: 0,
        }
    }

    #[test]
    fn continuous_loop_emits_quantised_rate() {
        let mut rl = RateLoop::new(
            &no_smoothing(),
            &MapperConfig::Continuous(ContinuousConfig::default()),
        )
        .unwrap();
        let tick = rl.process(&constant(1.0, 64));
        assert!((tick.power - 1.0).abs() < 1e-6);
        assert_eq!(tick.rate.bps(), 2_500_000.0);
        assert!(tick.changed);
        assert_eq!(tick.published, None);

        let again = rl.process(&constant(1.0, 64));
        assert!(!again.changed);
        assert_eq!(rl.stats().rate_changes, 1);
        assert_eq!(rl.stats().buffers, 2);
    }

    #[test]
    fn hysteresis_loop_follows_bands() {
        let mut rl = RateLoop::new(
            &no_smoothing(),
            &MapperConfig::Hysteresis(HysteresisConfig::default()),
        )
        .unwrap();
        assert_eq!(rl.policy(), MapperPolicy::Hysteresis);
        let rates: Vec<f64> = [1.0f32, 1.6, 1.3, 1.1]
            .iter()
            .map(|&p| rl.process(&constant(p, 32)).rate.bps())
            .collect();
        assert_eq!(rates, vec![5e6, 1e6, 1e6, 5e6]);
    }

    #[test]
    fn empty_buffer_still_emits_last_rate() {
        let mut rl = RateLoop::new(
            &no_smoothing(),
            &MapperConfig::Continuous(ContinuousConfig::default()),
        )
        .unwrap();
        let first = rl.process(&constant(1.0, 16));
        let empty = rl.process(&[]);
        assert_eq!(empty.power, first.power);
        assert_eq!(empty.rate, first.rate);
        assert_eq!(rl.estimator().buffers_seen(), 1);
    }

    #[test]
    fn publishes_each_tick() {
        let publisher = TelemetryPublisher::bind("127.0.0.1:0", 8).unwrap();
        let mut rl = RateLoop::new(&EstimatorConfig::default(), &MapperConfig::default())
            .unwrap()
            .with_publisher(publisher, "BITRATE")
            .unwrap();
        let tick = rl.process(&constant(1.0, 16));
        assert_eq!(tick.published, Some(PublishReport::default()));
        assert_eq!(rl.publisher().map(|p| p.stats().published), Some(1));
    }

    #[test]
    fn rejects_bad_topic() {
        let publisher = TelemetryPublisher::bind("127.0.0.1:0", 8).unwrap();
        let rl = RateLoop::new(&EstimatorConfig::default(), &MapperConfig::default()).unwrap();
        assert!(rl.with_publisher(publisher, "").is_err());
    }

    #[test]
    fn thinned_publishing_keeps_estimating() {
        let publisher = TelemetryPublisher::bind("127.0.0.1:0", 8).unwrap();
        let mut rl = RateLoop::new(&no_smoothing(), &MapperConfig::default())
            .unwrap()
            .with_publisher(publisher, "BITRATE")
            .unwrap()
            .with_publish_every(4);
        let published: Vec<bool> = (0..9)
            .map(|_| rl.process(&constant(1.0, 16)).published.is_some())
            .collect();
        assert_eq!(
            published,
            vec![true, false, false, false, true, false, false, false, true]
        );
        assert_eq!(rl.estimator().buffers_seen(), 9);
        assert_eq!(rl.publisher().map(|p| p.stats().published), Some(3));
    }

    #[test]
    fn manual_rate_overrides_mapping() {
        let mut rl = RateLoop::new(&no_smoothing(), &MapperConfig::default()).unwrap();
        rl.set_manual_rate(Some(RateEstimate::from_bps(7e6)));
        let tick = rl.process(&constant(1.0, 16));
        assert_eq!(tick.rate.bps(), 7e6);
        assert!((tick.power - 1.0).abs() < 1e-6);

        rl.set_manual_rate(None);
        let tick = rl.process(&constant(1.0, 16));
        assert_eq!(tick.rate.bps(), 2_500_000.0);
        assert!(tick.changed);
        assert_eq!(rl.manual_rate(), None);
    }
}
