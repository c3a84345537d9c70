//! # linkrate-estimator
//!
//! Estimation side of the rate control loop. Reads complex baseband samples
//! (simulated or from a `complex64` file), smooths their power, maps it to a
//! target bit rate and publishes one estimate per buffer.
//!
//! ## Usage
//!
//! ```bash
//! # Simulated channel, noise sweeping between 0.2 and 1.0 every 30 s
//! linkrate-estimator --noise 0.2 --sweep-to 1.0 --sweep-period-secs 30
//!
//! # Recorded samples, hysteresis policy, custom endpoint
//! linkrate-estimator --input capture.cf32 --policy hysteresis --endpoint tcp://*:5555
//!
//! # Samples piped from another process
//! gr_capture | linkrate-estimator --input - --no-pace
//!
//! # Pin the published rate to 3 Mbit/s, one message per 32 buffers
//! linkrate-estimator --fixed-rate 3000000 --publish-every 32
//! ```

mod source;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use linkrate_core::config::ConfigOverrides;
use linkrate_core::mapper::{MapperPolicy, RateEstimate};
use linkrate_core::telemetry::{normalize_endpoint, TelemetryPublisher};
use linkrate_core::{IqSample, LinkrateConfig, RateLoop, ShutdownSignal};

use source::{FileSource, SampleSource, SimulatedChannel, Sweep};

#[derive(Parser, Debug)]
#[command(name = "linkrate-estimator", about = "Publish link rate estimates from received power")]
struct Cli {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Publisher bind address, overrides `[telemetry] endpoint`.
    #[arg(long)]
    endpoint: Option<String>,

    /// Telemetry topic, overrides `[telemetry] topic`.
    #[arg(long)]
    topic: Option<String>,

    /// Mapping policy: `continuous` or `hysteresis`.
    #[arg(long)]
    policy: Option<MapperPolicy>,

    /// Read `complex64` samples from this file (`-` for stdin) instead of simulating.
    #[arg(long)]
    input: Option<PathBuf>,

    /// Sample rate in samples/s, used for pacing and the simulated carrier.
    #[arg(long, default_value_t = 32_000.0)]
    sample_rate: f64,

    /// Samples per buffer.
    #[arg(long, default_value_t = 1024)]
    buffer_len: usize,

    /// Simulated noise amplitude.
    #[arg(long, default_value_t = 0.5)]
    noise: f64,

    /// Sweep the simulated noise amplitude towards this level and back.
    #[arg(long)]
    sweep_to: Option<f64>,

    /// Duration of one full sweep cycle in seconds.
    #[arg(long, default_value_t = 30.0)]
    sweep_period_secs: f64,

    /// Seed for the simulated channel.
    #[arg(long)]
    seed: Option<u64>,

    /// Process input as fast as possible instead of at the sample rate.
    #[arg(long, default_value_t = false)]
    no_pace: bool,

    /// Publish this rate (bits/s) instead of the mapped estimate.
    #[arg(long)]
    fixed_rate: Option<f64>,

    /// Publish one estimate every N buffers, overrides `[telemetry] publish_every`.
    #[arg(long)]
    publish_every: Option<u64>,

    /// Stop after this many buffers.
    #[arg(long)]
    max_buffers: Option<u64>,

    /// Seconds between stats lines, 0 disables them.
    #[arg(long, default_value_t = 5)]
    stats_interval: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if cli.buffer_len == 0 {
        anyhow::bail!("--buffer-len must be at least 1");
    }
    if !(cli.sample_rate.is_finite() && cli.sample_rate > 0.0) {
        anyhow::bail!("--sample-rate must be positive");
    }
    if cli.fixed_rate.is_some_and(|r| !(r.is_finite() && r >= 0.0)) {
        anyhow::bail!("--fixed-rate must be a non-negative number of bits/s");
    }

    let overrides = ConfigOverrides {
        endpoint: cli.endpoint.clone(),
        topic: cli.topic.clone(),
        policy: cli.policy,
        publish_every: cli.publish_every,
        ..ConfigOverrides::default()
    };
    let config = LinkrateConfig::load_with_overrides(cli.config.as_deref(), &overrides)
        .context("invalid configuration")?;

    let bind = normalize_endpoint(&config.telemetry.endpoint)?;
    let publisher = TelemetryPublisher::bind(bind.as_str(), config.telemetry.send_high_water_mark)
        .with_context(|| format!("failed to bind telemetry publisher on {bind}"))?;

    let mut rate_loop = RateLoop::new(&config.estimator, &config.mapper)?
        .with_publisher(publisher, &config.telemetry.topic)?
        .with_publish_every(config.telemetry.publish_every);
    rate_loop.set_manual_rate(cli.fixed_rate.map(RateEstimate::from_bps));

    let mut source: Box<dyn SampleSource> = match &cli.input {
        Some(path) => Box::new(
            FileSource::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?,
        ),
        None => {
            let mut channel = SimulatedChannel::new(cli.noise, 1000.0, cli.sample_rate, cli.seed);
            if let Some(to) = cli.sweep_to {
                channel = channel.with_sweep(Sweep {
                    to,
                    period_samples: (cli.sweep_period_secs * cli.sample_rate) as u64,
                });
            }
            Box::new(channel)
        }
    };

    tracing::info!(
        endpoint = %bind,
        topic = %config.telemetry.topic,
        policy = rate_loop.policy().as_str(),
        fixed_rate = ?cli.fixed_rate,
        publish_every = config.telemetry.publish_every,
        alpha = config.estimator.alpha,
        calibration_period = config.estimator.calibration_period,
        input = ?cli.input,
        buffer_len = cli.buffer_len,
        sample_rate = cli.sample_rate,
        "linkrate-estimator starting"
    );

    let shutdown = ShutdownSignal::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutting down...");
            shutdown.trigger();
        })
        .context("failed to install signal handler")?;
    }

    let period = Duration::from_secs_f64(cli.buffer_len as f64 / cli.sample_rate);
    let stats_interval = Duration::from_secs(cli.stats_interval);
    let mut buf = vec![IqSample::default(); cli.buffer_len];
    let mut next_deadline = Instant::now();
    let mut last_stats_log = Instant::now();

    while !shutdown.is_triggered() {
        let n = source.fill(&mut buf).context("sample source failed")?;
        if n == 0 {
            tracing::info!("end of input");
            break;
        }
        rate_loop.process(&buf[..n]);

        if !stats_interval.is_zero() && last_stats_log.elapsed() >= stats_interval {
            let stats = rate_loop.stats();
            let publisher = rate_loop.publisher().map(|p| p.stats()).unwrap_or_default();
            tracing::info!(
                buffers = stats.buffers,
                power = rate_loop.estimator().power(),
                rate = %rate_loop.last_rate().unwrap_or_default(),
                calibrating = rate_loop.estimator().is_calibrating(),
                rate_changes = stats.rate_changes,
                subscribers = publisher.subscribers,
                delivered = publisher.delivered,
                dropped = publisher.dropped,
                "estimator stats"
            );
            last_stats_log = Instant::now();
        }

        if cli.max_buffers.is_some_and(|max| rate_loop.stats().buffers >= max) {
            break;
        }

        if !cli.no_pace {
            next_deadline += period;
            let now = Instant::now();
            if next_deadline > now {
                std::thread::sleep(next_deadline - now);
            } else {
                // Fell behind; don't try to catch up with a burst.
                next_deadline = now;
            }
        }
    }

    let stats = rate_loop.stats();
    tracing::info!(
        buffers = stats.buffers,
        rate_changes = stats.rate_changes,
        "linkrate-estimator stopped"
    );
    Ok(())
}
