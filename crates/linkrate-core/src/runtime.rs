//! Enforcement workers.
//!
//! Each [`EnforcerWorker`] runs one subscriber and one enforcer on a
//! dedicated thread. Workers share nothing but an optional
//! [`ShutdownSignal`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::enforcer::{EnforcerStats, QosEnforcer};
use crate::shaper::TrafficShaper;
use crate::telemetry::{RecvError, TelemetrySubscriber};

/// Cooperative stop flag shared between a controller and its workers.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Handle to a thread that feeds one subscriber into one enforcer.
///
/// The thread owns both halves; nothing is shared with other workers except
/// the shutdown flag. Dropping the handle stops and joins the thread.
pub struct EnforcerWorker {
    interface: String,
    shutdown: ShutdownSignal,
    stats: Arc<Mutex<EnforcerStats>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl EnforcerWorker {
    /// Starts the loop. The subscriber's shutdown signal doubles as the
    /// worker's stop flag.
    pub fn spawn<S>(
        subscriber: TelemetrySubscriber,
        enforcer: QosEnforcer<S>,
        stats_interval: Option<Duration>,
    ) -> std::io::Result<Self>
    where
        S: TrafficShaper + 'static,
    {
        let interface = enforcer.interface().to_string();
        let shutdown = subscriber.shutdown_signal();
        let stats = Arc::new(Mutex::new(EnforcerStats::default()));
        let stats_clone = stats.clone();

        let handle = thread::Builder::new()
            .name(format!("enforcer-{interface}"))
            .spawn(move || worker_loop(subscriber, enforcer, stats_clone, stats_interval))?;

        Ok(Self {
            interface,
            shutdown,
            stats,
            handle: Some(handle),
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Latest counters published by the worker thread.
    pub fn stats(&self) -> EnforcerStats {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Stops the worker and returns its final counters. Idempotent.
    pub fn stop(&mut self) -> EnforcerStats {
        self.shutdown.trigger();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(interface = %self.interface, "enforcer worker panicked");
            }
        }
        self.stats()
    }
}

impl Drop for EnforcerWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop<S: TrafficShaper>(
    mut subscriber: TelemetrySubscriber,
    mut enforcer: QosEnforcer<S>,
    stats: Arc<Mutex<EnforcerStats>>,
    stats_interval: Option<Duration>,
) {
    info!(
        interface = %enforcer.interface(),
        endpoint = %subscriber.endpoint(),
        topic = %String::from_utf8_lossy(subscriber.topic()),
        "enforcer started"
    );
    let mut last_report = Instant::now();

    loop {
        match subscriber.recv() {
            Ok(rate) => {
                enforcer.apply(rate);
                if let Ok(mut s) = stats.lock() {
                    *s = enforcer.stats();
                }
            }
            Err(RecvError::Timeout) => {
                warn!(interface = %enforcer.interface(), "no rate estimate within timeout");
            }
            Err(RecvError::Shutdown) => break,
        }

        if let Some(interval) = stats_interval {
            if last_report.elapsed() >= interval {
                let s = enforcer.stats();
                let sub = subscriber.stats();
                info!(
                    interface = %enforcer.interface(),
                    received = s.received,
                    applied = s.applied,
                    suppressed = s.suppressed,
                    failed = s.failed,
                    discarded = sub.discarded,
                    reconnects = sub.reconnects,
                    "enforcer stats"
                );
                last_report = Instant::now();
            }
        }
    }

    if let Ok(mut s) = stats.lock() {
        *s = enforcer.stats();
    }
    info!(interface = %enforcer.interface(), "enforcer stopped");
}
