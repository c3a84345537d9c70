//! Subscribing end of the telemetry channel.
//!
//! Connection is lazy: creating a subscriber never fails because the
//! publisher is absent. [`TelemetrySubscriber::recv`] (re)connects as
//! needed, registers the topic and blocks until a well-formed estimate for
//! exactly that topic arrives.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use super::wire::{encode_subscription, FrameDecoder, TelemetryMessage};
use super::{normalize_endpoint, validate_topic};
use crate::config::ConfigError;
use crate::mapper::RateEstimate;
use crate::runtime::ShutdownSignal;

/// Longest single blocking read; bounds shutdown latency.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const CONNECT_TIMEOUT: Duration = Duration::from_millis(250);
/// Socket timeouts of zero are rejected by the OS layer.
const MIN_SLICE: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberOptions {
    /// `None` blocks until a message or shutdown.
    pub recv_timeout: Option<Duration>,
    pub reconnect_interval: Duration,
}

impl Default for SubscriberOptions {
    fn default() -> Self {
        Self {
            recv_timeout: None,
            reconnect_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecvError {
    #[error("no rate estimate within the receive timeout")]
    Timeout,
    #[error("shutdown requested")]
    Shutdown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriberStats {
    pub received: u64,
    /// Messages dropped for wrong topic, framing or value.
    pub discarded: u64,
    pub reconnects: u64,
}

pub struct TelemetrySubscriber {
    endpoint: String,
    topic: Bytes,
    options: SubscriberOptions,
    stream: Option<TcpStream>,
    decoder: FrameDecoder,
    shutdown: ShutdownSignal,
    stats: SubscriberStats,
    next_attempt: Option<Instant>,
    ever_connected: bool,
}

impl TelemetrySubscriber {
    pub fn new(
        endpoint: &str,
        topic: &str,
        options: SubscriberOptions,
    ) -> Result<Self, ConfigError> {
        let endpoint = normalize_endpoint(endpoint)?;
        validate_topic(topic)?;
        if options.reconnect_interval.is_zero() {
            return Err(ConfigError::invalid(
                "reconnect_interval_ms",
                "must be greater than zero",
            ));
        }
        if options.recv_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::invalid(
                "recv_timeout_ms",
                "must be greater than zero",
            ));
        }
        Ok(Self {
            endpoint,
            topic: Bytes::copy_from_slice(topic.as_bytes()),
            options,
            stream: None,
            decoder: FrameDecoder::new(),
            shutdown: ShutdownSignal::new(),
            stats: SubscriberStats::default(),
            next_attempt: None,
            ever_connected: false,
        })
    }

    /// Shares an externally owned shutdown signal.
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn topic(&self) -> &[u8] {
        &self.topic
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn stats(&self) -> SubscriberStats {
        self.stats
    }

    /// Blocks until the next valid estimate for this subscriber's topic.
    ///
    /// Malformed or foreign messages are skipped silently. Returns
    /// [`RecvError::Timeout`] after the configured timeout and
    /// [`RecvError::Shutdown`] once the shutdown signal fires. At least one
    /// connect or read attempt is made before timing out.
    pub fn recv(&mut self) -> Result<RateEstimate, RecvError> {
        let deadline = self.options.recv_timeout.map(|t| Instant::now() + t);
        let mut attempted = false;
        loop {
            if self.shutdown.is_triggered() {
                return Err(RecvError::Shutdown);
            }

            match self.decoder.next_message() {
                Ok(Some(parts)) => {
                    match TelemetryMessage::decode(&parts, &self.topic) {
                        Ok(rate) => {
                            self.stats.received += 1;
                            return Ok(rate);
                        }
                        Err(e) => {
                            self.stats.discarded += 1;
                            trace!(error = %e, "discarding telemetry message");
                        }
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(endpoint = %self.endpoint, error = %e, "corrupt telemetry stream, reconnecting");
                    self.disconnect();
                }
            }

            let slice = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d && attempted {
                        return Err(RecvError::Timeout);
                    }
                    d.saturating_duration_since(now)
                        .clamp(MIN_SLICE, POLL_INTERVAL)
                }
                None => POLL_INTERVAL,
            };
            attempted = true;

            if self.stream.is_none() {
                self.try_connect(slice);
            } else {
                self.read_some(slice);
            }
        }
    }

    fn try_connect(&mut self, slice: Duration) {
        if let Some(at) = self.next_attempt {
            let now = Instant::now();
            if now < at {
                std::thread::sleep((at - now).min(slice));
                return;
            }
        }

        match self.connect(CONNECT_TIMEOUT.min(slice)) {
            Ok(stream) => {
                self.stream = Some(stream);
                self.decoder = FrameDecoder::new();
                self.next_attempt = None;
                if self.ever_connected {
                    self.stats.reconnects += 1;
                    info!(endpoint = %self.endpoint, "telemetry publisher reconnected");
                } else {
                    info!(endpoint = %self.endpoint, "connected to telemetry publisher");
                }
                self.ever_connected = true;
            }
            Err(e) => {
                debug!(endpoint = %self.endpoint, error = %e, "telemetry publisher unavailable");
                self.next_attempt = Some(Instant::now() + self.options.reconnect_interval);
            }
        }
    }

    fn connect(&self, timeout: Duration) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in self.endpoint.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(mut stream) => {
                    stream.set_nodelay(true)?;
                    stream.write_all(&encode_subscription(&self.topic, true))?;
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "endpoint resolved to no address")
        }))
    }

    fn read_some(&mut self, slice: Duration) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        if let Err(e) = stream.set_read_timeout(Some(slice.max(MIN_SLICE))) {
            debug!(error = %e, "failed to set read timeout");
            self.disconnect();
            return;
        }

        let mut buf = [0u8; 4096];
        match stream.read(&mut buf) {
            Ok(0) => {
                info!(endpoint = %self.endpoint, "telemetry publisher closed the connection");
                self.disconnect();
            }
            Ok(n) => self.decoder.extend(&buf[..n]),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "telemetry read failed");
                self.disconnect();
            }
        }
    }

    fn disconnect(&mut self) {
        self.stream = None;
        self.decoder = FrameDecoder::new();
        self.next_attempt = Some(Instant::now() + self.options.reconnect_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::wire::encode_frames;
    use bytes::BytesMut;
    use std::net::TcpListener;
    use std::thread;

    fn fast_options() -> SubscriberOptions {
        SubscriberOptions {
            recv_timeout: Some(Duration::from_millis(300)),
            reconnect_interval: Duration::from_millis(20),
        }
    }

    fn rate_msg(topic: &[u8], rate: f32) -> Vec<u8> {
        let payload = rate.to_le_bytes();
        let mut buf = BytesMut::new();
        encode_frames(&[topic, &payload[..]], &mut buf);
        buf.to_vec()
    }

    #[test]
    fn rejects_bad_configuration() {
        assert!(TelemetrySubscriber::new("nope", "BITRATE", fast_options()).is_err());
        assert!(TelemetrySubscriber::new("127.0.0.1:1", "", fast_options()).is_err());
    }

    #[test]
    fn times_out_without_publisher() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut sub =
            TelemetrySubscriber::new(&addr.to_string(), "BITRATE", fast_options()).unwrap();
        let started = Instant::now();
        assert_eq!(sub.recv(), Err(RecvError::Timeout));
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(!sub.is_connected());
    }

    #[test]
    fn shutdown_interrupts_blocking_recv() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut sub = TelemetrySubscriber::new(
            &addr.to_string(),
            "BITRATE",
            SubscriberOptions::default(),
        )
        .unwrap();
        let signal = sub.shutdown_signal();
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            signal.trigger();
        });
        assert_eq!(sub.recv(), Err(RecvError::Shutdown));
        trigger.join().unwrap();
    }

    #[test]
    fn skips_malformed_and_foreign_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut wire = Vec::new();
            wire.extend(rate_msg(b"OTHER", 1e6));
            wire.extend(rate_msg(b"BITRATE2", 1e6));
            wire.extend(rate_msg(b"BITRATE", f32::NAN));
            wire.extend(rate_msg(b"BITRATE", -5.0));
            let mut single = BytesMut::new();
            encode_frames(&[&b"BITRATE 500000000"[..]], &mut single);
            wire.extend_from_slice(&single);
            wire.extend(rate_msg(b"BITRATE", 2.5e6));
            conn.write_all(&wire).unwrap();
            thread::sleep(Duration::from_millis(200));
        });

        let mut sub =
            TelemetrySubscriber::new(&addr.to_string(), "BITRATE", fast_options()).unwrap();
        assert_eq!(sub.recv().unwrap().bps(), 2.5e6);
        assert_eq!(sub.stats().discarded, 5);
        assert_eq!(sub.stats().received, 1);
        server.join().unwrap();
    }

    #[test]
    fn sends_subscription_on_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut dec = FrameDecoder::new();
            let mut buf = [0u8; 64];
            loop {
                let n = conn.read(&mut buf).unwrap();
                dec.extend(&buf[..n]);
                if let Some(parts) = dec.next_message().unwrap() {
                    return parts;
                }
            }
        });

        let mut sub =
            TelemetrySubscriber::new(&addr.to_string(), "BITRATE", fast_options()).unwrap();
        let _ = sub.recv();
        let parts = server.join().unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(&parts[0][..], b"\x01BITRATE");
    }

    #[test]
    fn reconnects_after_publisher_restart() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut first, _) = listener.accept().unwrap();
            first.write_all(&rate_msg(b"BITRATE", 1e6)).unwrap();
            drop(first);
            let (mut second, _) = listener.accept().unwrap();
            second.write_all(&rate_msg(b"BITRATE", 3e6)).unwrap();
            thread::sleep(Duration::from_millis(200));
        });

        let mut sub = TelemetrySubscriber::new(
            &addr.to_string(),
            "BITRATE",
            SubscriberOptions {
                recv_timeout: Some(Duration::from_secs(5)),
                reconnect_interval: Duration::from_millis(20),
            },
        )
        .unwrap();
        assert_eq!(sub.recv().unwrap().bps(), 1e6);
        assert_eq!(sub.recv().unwrap().bps(), 3e6);
        assert_eq!(sub.stats().reconnects, 1);
        server.join().unwrap();
    }

    #[test]
    fn rejects_zero_receive_timeout() {
        let options = SubscriberOptions {
            recv_timeout: Some(Duration::ZERO),
            ..fast_options()
        };
        assert!(TelemetrySubscriber::new("127.0.0.1:1", "BITRATE", options).is_err());
    }

    #[test]
    fn short_timeout_still_connects_and_stays_bounded() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(100));
            conn.write_all(&rate_msg(b"BITRATE", 4e6)).unwrap();
            thread::sleep(Duration::from_millis(200));
        });

        let mut sub = TelemetrySubscriber::new(
            &addr.to_string(),
            "BITRATE",
            SubscriberOptions {
                recv_timeout: Some(Duration::from_millis(1)),
                reconnect_interval: Duration::from_millis(20),
            },
        )
        .unwrap();
        let started = Instant::now();
        assert_eq!(sub.recv(), Err(RecvError::Timeout));
        assert!(started.elapsed() < CONNECT_TIMEOUT);
        assert!(sub.is_connected());

        let deadline = Instant::now() + Duration::from_secs(5);
        let rate = loop {
            match sub.recv() {
                Ok(rate) => break rate,
                Err(RecvError::Timeout) => assert!(Instant::now() < deadline),
                Err(RecvError::Shutdown) => unreachable!(),
            }
        };
        assert_eq!(rate.bps(), 4e6);
        server.join().unwrap();
    }
}
