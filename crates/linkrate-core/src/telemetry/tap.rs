//! Raw telemetry tap.
//!
//! Subscribes to a topic prefix (empty for everything) and hands back whole
//! messages without validating them, for inspecting what a publisher
//! actually puts on the wire.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use bytes::Bytes;

use super::normalize_endpoint;
use super::wire::{encode_subscription, FrameDecoder};

pub struct TelemetryTap {
    stream: TcpStream,
    decoder: FrameDecoder,
}

impl TelemetryTap {
    /// Connects to `endpoint` and subscribes to every topic starting with `prefix`.
    pub fn connect(endpoint: &str, prefix: &[u8]) -> io::Result<Self> {
        let addr = normalize_endpoint(endpoint)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "endpoint resolved to no address"))?;
        let mut stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.write_all(&encode_subscription(prefix, true))?;
        Ok(Self {
            stream,
            decoder: FrameDecoder::new(),
        })
    }

    /// Next complete message, or `Ok(None)` if nothing arrived within `wait`.
    ///
    /// A closed connection is `UnexpectedEof`; a corrupt stream is `InvalidData`.
    pub fn next_message(&mut self, wait: Duration) -> io::Result<Option<Vec<Bytes>>> {
        if let Some(parts) = self.decode()? {
            return Ok(Some(parts));
        }
        self.stream
            .set_read_timeout(Some(wait.max(Duration::from_millis(1))))?;
        let mut buf = [0u8; 4096];
        match self.stream.read(&mut buf) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "publisher closed the connection",
            )),
            Ok(n) => {
                self.decoder.extend(&buf[..n]);
                self.decode()
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn decode(&mut self) -> io::Result<Option<Vec<Bytes>>> {
        self.decoder
            .next_message()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}
