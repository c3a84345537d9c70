//! Publishing end of the telemetry channel.
//!
//! The publisher binds a TCP listener and fans every message out to the
//! connected subscribers whose subscription prefixes match its topic. Each
//! subscriber gets a bounded queue drained by its own writer thread;
//! [`TelemetryPublisher::publish`] only does `try_send`, so it never waits
//! on the network. A full queue drops the message for that subscriber.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, info, trace, warn};

use super::wire::{parse_subscription, FrameDecoder, TelemetryMessage};

/// How often idle threads re-check the shutdown flag.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of a single [`TelemetryPublisher::publish`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscribers the message was queued for.
    pub delivered: usize,
    /// Matching subscribers whose queue was full.
    pub dropped: usize,
}

/// Cumulative publisher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub subscribers: usize,
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
}

struct Peer {
    id: u64,
    addr: SocketAddr,
    subscriptions: Arc<Mutex<Vec<Bytes>>>,
    closed: Arc<AtomicBool>,
    tx: Sender<Bytes>,
}

impl Peer {
    fn matches(&self, topic: &[u8]) -> bool {
        lock(&self.subscriptions)
            .iter()
            .any(|prefix| topic.starts_with(prefix))
    }

    fn is_subscribed(&self) -> bool {
        !self.is_closed() && !lock(&self.subscriptions).is_empty()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

struct Shared {
    peers: Mutex<Vec<Peer>>,
    shutdown: AtomicBool,
    high_water_mark: usize,
    next_peer_id: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Locks, ignoring poisoning.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Bound publishing socket.
pub struct TelemetryPublisher {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    acceptor: Option<thread::JoinHandle<()>>,
}

impl TelemetryPublisher {
    /// Binds `addr` and starts accepting subscribers.
    ///
    /// `high_water_mark` is the per-subscriber queue depth.
    pub fn bind(addr: impl ToSocketAddrs, high_water_mark: usize) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            peers: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            high_water_mark: high_water_mark.max(1),
            next_peer_id: AtomicU64::new(0),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        let acceptor_shared = shared.clone();
        let acceptor = thread::Builder::new()
            .name("telemetry-accept".into())
            .spawn(move || accept_loop(listener, acceptor_shared))?;

        info!(%local_addr, "telemetry publisher bound");
        Ok(Self {
            local_addr,
            shared,
            acceptor: Some(acceptor),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Queues `message` for every matching subscriber. Never blocks.
    pub fn publish(&self, message: &TelemetryMessage) -> PublishReport {
        let encoded = message.encode();
        let topic = message.topic();
        let mut report = PublishReport::default();

        let mut peers = lock(&self.shared.peers);
        peers.retain(|peer| {
            if peer.is_closed() {
                debug!(peer = peer.id, addr = %peer.addr, "subscriber gone");
                return false;
            }
            if !peer.matches(topic) {
                return true;
            }
            match peer.tx.try_send(encoded.clone()) {
                Ok(()) => {
                    report.delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    report.dropped += 1;
                    trace!(peer = peer.id, "subscriber queue full, dropping message");
                    true
                }
                Err(TrySendError::Disconnected(_)) => {
                    debug!(peer = peer.id, addr = %peer.addr, "subscriber gone");
                    false
                }
            }
        });
        drop(peers);

        self.shared.published.fetch_add(1, Ordering::Relaxed);
        self.shared
            .delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.shared
            .dropped
            .fetch_add(report.dropped as u64, Ordering::Relaxed);
        report
    }

    /// Connected subscribers that have registered at least one topic.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.shared.peers)
            .iter()
            .filter(|p| p.is_subscribed())
            .count()
    }

    /// Blocks until `count` subscribers have registered or `timeout` passes.
    pub fn wait_for_subscribers(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.subscriber_count() >= count {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            subscribers: self.subscriber_count(),
            published: self.shared.published.load(Ordering::Relaxed),
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
        }
    }

    /// Stops accepting and disconnects every subscriber.
    pub fn shutdown(&mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        // Dropping the senders ends each writer thread, which closes its socket.
        lock(&self.shared.peers).clear();
        if let Some(handle) = self.acceptor.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TelemetryPublisher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    while !shared.shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, addr)) => {
                if let Err(e) = spawn_peer(stream, addr, &shared) {
                    warn!(%addr, error = %e, "failed to set up subscriber");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                prune_closed(&shared);
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
    debug!("telemetry acceptor stopped");
}

/// Drops peers whose connection has ended, subscribed or not.
fn prune_closed(shared: &Shared) {
    lock(&shared.peers).retain(|peer| {
        if peer.is_closed() {
            debug!(peer = peer.id, addr = %peer.addr, "subscriber gone");
        }
        !peer.is_closed()
    });
}

fn spawn_peer(stream: TcpStream, addr: SocketAddr, shared: &Arc<Shared>) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(POLL_INTERVAL))?;
    let reader_stream = stream.try_clone()?;

    let id = shared.next_peer_id.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = bounded(shared.high_water_mark);
    let subscriptions = Arc::new(Mutex::new(Vec::new()));
    let closed = Arc::new(AtomicBool::new(false));

    {
        let subscriptions = subscriptions.clone();
        let closed = closed.clone();
        let shared = shared.clone();
        thread::Builder::new()
            .name(format!("telemetry-sub-rx-{id}"))
            .spawn(move || peer_reader(id, reader_stream, subscriptions, closed, shared))?;
    }
    {
        let closed = closed.clone();
        let shared = shared.clone();
        thread::Builder::new()
            .name(format!("telemetry-sub-tx-{id}"))
            .spawn(move || peer_writer(id, stream, rx, closed, shared))?;
    }

    lock(&shared.peers).push(Peer {
        id,
        addr,
        subscriptions,
        closed,
        tx,
    });
    debug!(peer = id, %addr, "subscriber connected");
    Ok(())
}

/// Reads subscription requests until the connection closes.
fn peer_reader(
    id: u64,
    mut stream: TcpStream,
    subscriptions: Arc<Mutex<Vec<Bytes>>>,
    closed: Arc<AtomicBool>,
    shared: Arc<Shared>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 512];

    'conn: while !shared.shutdown.load(Ordering::Relaxed) && !closed.load(Ordering::Relaxed) {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => decoder.extend(&buf[..n]),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(_) => break,
        }

        loop {
            match decoder.next_message() {
                Ok(Some(parts)) => match parse_subscription(&parts) {
                    Some((true, topic)) => {
                        debug!(peer = id, topic = %String::from_utf8_lossy(&topic), "subscribe");
                        let mut subs = lock(&subscriptions);
                        if !subs.contains(&topic) {
                            subs.push(topic);
                        }
                    }
                    Some((false, topic)) => {
                        debug!(peer = id, topic = %String::from_utf8_lossy(&topic), "unsubscribe");
                        lock(&subscriptions).retain(|t| *t != topic);
                    }
                    None => trace!(peer = id, "ignoring non-subscription message"),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(peer = id, error = %e, "corrupt subscriber stream");
                    break 'conn;
                }
            }
        }
    }

    closed.store(true, Ordering::Relaxed);
    let _ = stream.shutdown(Shutdown::Both);
}

/// Drains the peer's queue onto the socket.
fn peer_writer(
    id: u64,
    mut stream: TcpStream,
    rx: Receiver<Bytes>,
    closed: Arc<AtomicBool>,
    shared: Arc<Shared>,
) {
    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(frame) => {
                if let Err(e) = stream.write_all(&frame) {
                    debug!(peer = id, error = %e, "subscriber write failed");
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if closed.load(Ordering::Relaxed) || shared.shutdown.load(Ordering::Relaxed) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    closed.store(true, Ordering::Relaxed);
    let _ = stream.shutdown(Shutdown::Both);
    debug!(peer = id, "subscriber writer stopped");
}
