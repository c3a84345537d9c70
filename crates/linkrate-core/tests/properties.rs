//! Property-based tests for the control loop invariants.

use bytes::BytesMut;
use proptest::prelude::*;

use linkrate_core::enforcer::{EnforcerConfig, QosEnforcer};
use linkrate_core::estimator::{EstimatorConfig, PowerEstimator};
use linkrate_core::mapper::{
    ContinuousConfig, ContinuousMapper, HysteresisConfig, HysteresisMapper, RateEstimate,
    RateMapper,
};
use linkrate_core::sample::IqSample;
use linkrate_core::shaper::{ShapeError, TrafficShaper};
use linkrate_core::telemetry::wire::{encode_frames, FrameDecoder};
use linkrate_core::telemetry::TelemetryMessage;

#[derive(Default)]
struct Counting {
    calls: usize,
}

impl TrafficShaper for Counting {
    fn shape(&mut self, _: &str, _: u64, _: u64) -> Result<(), ShapeError> {
        self.calls += 1;
        Ok(())
    }
}

fn buffer_with_power(power: f64, len: usize) -> Vec<IqSample> {
    let amp = power.sqrt() as f32;
    vec![IqSample::new(amp, 0.0); len]
}

fn any_power() -> impl Strategy<Value = f64> {
    prop_oneof![
        -10.0f64..10.0,
        Just(f64::NAN),
        Just(f64::INFINITY),
        Just(f64::NEG_INFINITY),
        Just(0.3),
        Just(1.3),
    ]
}

proptest! {
    #[test]
    fn ewma_stays_between_previous_and_instantaneous(
        alpha in 0.001f64..=1.0,
        powers in prop::collection::vec(0.0f64..100.0, 1..50),
    ) {
        let mut est = PowerEstimator::new(&EstimatorConfig { alpha, calibration_period: 0 }).unwrap();
        for p in powers {
            let buf = buffer_with_power(p, 8);
            let inst = buf.iter().map(IqSample::norm_sqr).sum::<f64>() / buf.len() as f64;
            let prev = est.power();
            let next = est.update(&buf);
            let (lo, hi) = if prev <= inst { (prev, inst) } else { (inst, prev) };
            let eps = 1e-9 * hi.abs().max(1.0);
            prop_assert!(next >= lo - eps && next <= hi + eps,
                "prev={prev} inst={inst} next={next}");
        }
    }

    #[test]
    fn calibration_tracks_instantaneous_power(
        period in 1u32..20,
        powers in prop::collection::vec(0.0f64..10.0, 1..20),
    ) {
        let mut est = PowerEstimator::new(&EstimatorConfig { alpha: 0.1, calibration_period: period }).unwrap();
        for (i, p) in powers.iter().enumerate() {
            let buf = buffer_with_power(*p, 4);
            let inst = buf[0].norm_sqr();
            let out = est.update(&buf);
            if (i as u32) < period {
                prop_assert!((out - inst).abs() <= 1e-12 * inst.max(1.0));
            }
        }
    }

    #[test]
    fn continuous_rate_always_within_bounds(power in any_power()) {
        let cfg = ContinuousConfig::default();
        let mut mapper = ContinuousMapper::new(cfg.clone()).unwrap();
        let rate = mapper.map(power).bps();
        prop_assert!(rate >= cfg.rate_min && rate <= cfg.rate_max, "rate {rate} for power {power}");
    }

    #[test]
    fn continuous_rate_within_bounds_for_any_granularity(
        power in any_power(),
        granularity in prop_oneof![Just(0.0), 1.0f64..5e6],
    ) {
        let cfg = ContinuousConfig { granularity, ..ContinuousConfig::default() };
        let mut mapper = ContinuousMapper::new(cfg.clone()).unwrap();
        let rate = mapper.map(power).bps();
        prop_assert!(rate >= cfg.rate_min && rate <= cfg.rate_max);
    }

    #[test]
    fn hysteresis_holds_inside_band(
        prefix in prop::collection::vec(0.0f64..3.0, 0..10),
        inside in prop::collection::vec(1.2f64..1.5, 1..50),
    ) {
        let mut mapper = HysteresisMapper::new(HysteresisConfig::default()).unwrap();
        for p in prefix {
            mapper.map(p);
        }
        let held = mapper.current_rate();
        for p in inside.into_iter().filter(|p| *p > 1.2 && *p < 1.5) {
            prop_assert_eq!(mapper.map(p), held);
        }
    }

    #[test]
    fn repeated_rate_shapes_once(bps in 0.0f64..1e10, repeats in 2usize..10) {
        let mut enforcer = QosEnforcer::new("s1-eth1", &EnforcerConfig::default(), Counting::default()).unwrap();
        for _ in 0..repeats {
            enforcer.apply(RateEstimate::from_bps(bps));
        }
        prop_assert_eq!(enforcer.shaper().calls, 1);
    }

    #[test]
    fn telemetry_rate_is_bit_exact(rate in 0.0f32..f32::MAX) {
        let msg = TelemetryMessage::new(&b"BITRATE"[..], RateEstimate::from_bps(rate as f64));
        let mut dec = FrameDecoder::new();
        dec.extend(&msg.encode());
        let parts = dec.next_message().unwrap().unwrap();
        let decoded = TelemetryMessage::decode(&parts, b"BITRATE").unwrap();
        prop_assert_eq!((decoded.bps() as f32).to_bits(), rate.to_bits());
    }

    #[test]
    fn decoder_is_insensitive_to_chunking(
        rates in prop::collection::vec(0.0f32..1e9, 1..8),
        chunk in 1usize..40,
    ) {
        let mut wire = BytesMut::new();
        for r in &rates {
            let payload = r.to_le_bytes();
            encode_frames(&[b"BITRATE".as_slice(), &payload[..]], &mut wire);
        }
        let mut dec = FrameDecoder::new();
        let mut got = Vec::new();
        for piece in wire.chunks(chunk) {
            dec.extend(piece);
            while let Some(parts) = dec.next_message().unwrap() {
                got.push(TelemetryMessage::decode(&parts, b"BITRATE").unwrap().bps() as f32);
            }
        }
        prop_assert_eq!(got, rates);
    }
}
