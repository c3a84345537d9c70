//! # linkrate-enforcer
//!
//! Enforcement side of the rate control loop. Subscribes to rate telemetry
//! and programs ingress policing on one or more interfaces, each driven by
//! its own worker thread.
//!
//! ## Usage
//!
//! ```bash
//! # Single interface from the command line
//! sudo linkrate-enforcer --endpoint tcp://10.0.0.1:5555 --interface s1-eth1
//!
//! # Targets from a config file, log only
//! linkrate-enforcer --config linkrate.toml --dry-run
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use linkrate_core::config::ConfigOverrides;
use linkrate_core::shaper::{DryRunShaper, OvsShaper, TrafficShaper};
use linkrate_core::telemetry::TelemetrySubscriber;
use linkrate_core::{EnforcerWorker, LinkrateConfig, QosEnforcer, ShutdownSignal};

#[derive(Parser, Debug)]
#[command(name = "linkrate-enforcer", about = "Apply link rate estimates as ingress policing")]
struct Cli {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Publisher address, overrides `[telemetry] endpoint`.
    #[arg(long)]
    endpoint: Option<String>,

    /// Single interface to police, replaces `[[enforcer.targets]]`.
    #[arg(long)]
    interface: Option<String>,

    /// Telemetry topic for every target.
    #[arg(long)]
    topic: Option<String>,

    /// Log policing changes without running the shaper.
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Seconds between stats lines, 0 disables them.
    #[arg(long, default_value_t = 30)]
    stats_interval: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let overrides = ConfigOverrides {
        endpoint: cli.endpoint.clone(),
        topic: cli.topic.clone(),
        interface: cli.interface.clone(),
        ..ConfigOverrides::default()
    };
    let config = LinkrateConfig::load_with_overrides(cli.config.as_deref(), &overrides)
        .context("invalid configuration")?;

    tracing::info!(
        endpoint = %config.telemetry.endpoint,
        targets = config.enforcer.targets.len(),
        shaper = %config.enforcer.shaper_program,
        dry_run = cli.dry_run,
        "linkrate-enforcer starting"
    );

    let shutdown = ShutdownSignal::new();
    let stats_interval = (cli.stats_interval > 0).then(|| Duration::from_secs(cli.stats_interval));
    let options = config.telemetry.subscriber_options();

    let mut workers = Vec::with_capacity(config.enforcer.targets.len());
    for target in &config.enforcer.targets {
        let subscriber = TelemetrySubscriber::new(&config.telemetry.endpoint, &target.topic, options)
            .with_context(|| format!("invalid telemetry settings for {}", target.interface))?
            .with_shutdown(shutdown.clone());

        let shaper: Box<dyn TrafficShaper> = if cli.dry_run {
            Box::new(DryRunShaper::new())
        } else {
            Box::new(OvsShaper::new(config.enforcer.shaper_program.clone()))
        };
        let enforcer = QosEnforcer::new(target.interface.clone(), &config.enforcer, shaper)?;

        let worker = EnforcerWorker::spawn(subscriber, enforcer, stats_interval)
            .with_context(|| format!("failed to start worker for {}", target.interface))?;
        tracing::info!(interface = %target.interface, topic = %target.topic, "target started");
        workers.push(worker);
    }

    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutting down...");
            shutdown.trigger();
        })
        .context("failed to install signal handler")?;
    }

    while !shutdown.is_triggered() {
        if workers.iter().all(EnforcerWorker::is_finished) {
            tracing::warn!("all enforcer workers exited");
            break;
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    for mut worker in workers {
        let stats = worker.stop();
        tracing::info!(
            interface = %worker.interface(),
            received = stats.received,
            applied = stats.applied,
            suppressed = stats.suppressed,
            failed = stats.failed,
            "target stopped"
        );
    }
    tracing::info!("linkrate-enforcer stopped");
    Ok(())
}
