//! # linkrate-monitor
//!
//! Telemetry sniffer. Subscribes to a topic prefix (everything by default)
//! and prints each message with its frames in hex and the rate it decodes
//! to, including messages the enforcer would reject.
//!
//! ## Usage
//!
//! ```bash
//! linkrate-monitor --endpoint tcp://127.0.0.1:5555
//! linkrate-monitor --prefix BITRATE --count 10
//! ```

mod dump;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use linkrate_core::config::ConfigOverrides;
use linkrate_core::telemetry::TelemetryTap;
use linkrate_core::{LinkrateConfig, ShutdownSignal};

const WAIT: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(name = "linkrate-monitor", about = "Dump raw rate telemetry")]
struct Cli {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Publisher address, overrides `[telemetry] endpoint`.
    #[arg(long)]
    endpoint: Option<String>,

    /// Topic prefix to subscribe to; empty subscribes to everything.
    #[arg(long, default_value = "")]
    prefix: String,

    /// Exit after printing this many messages.
    #[arg(long)]
    count: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let overrides = ConfigOverrides {
        endpoint: cli.endpoint.clone(),
        ..ConfigOverrides::default()
    };
    let config = LinkrateConfig::load_with_overrides(cli.config.as_deref(), &overrides)
        .context("invalid configuration")?;
    let endpoint = config.telemetry.endpoint;
    let reconnect = config.telemetry.reconnect_interval;

    let shutdown = ShutdownSignal::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.trigger())
            .context("failed to install signal handler")?;
    }

    tracing::info!(%endpoint, prefix = %cli.prefix, "linkrate-monitor starting");

    let mut printed = 0u64;
    let mut tap: Option<TelemetryTap> = None;
    while !shutdown.is_triggered() && cli.count.is_none_or(|max| printed < max) {
        if tap.is_none() {
            match TelemetryTap::connect(&endpoint, cli.prefix.as_bytes()) {
                Ok(t) => {
                    tracing::info!(%endpoint, "connected");
                    tap = Some(t);
                }
                Err(e) => {
                    tracing::debug!(%endpoint, error = %e, "publisher unavailable");
                    std::thread::sleep(reconnect);
                }
            }
            continue;
        }
        let Some(conn) = tap.as_mut() else {
            continue;
        };

        match conn.next_message(WAIT) {
            Ok(Some(parts)) => {
                println!("{}", dump::describe(&parts));
                printed += 1;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(%endpoint, error = %e, "telemetry connection lost");
                tap = None;
            }
        }
    }

    tracing::info!(messages = printed, "linkrate-monitor stopped");
    Ok(())
}
