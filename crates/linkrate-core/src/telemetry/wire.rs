//! Telemetry wire format.
//!
//! ## Stream framing
//!
//! The TCP byte stream is a sequence of frames:
//!
//! ```text
//! +-------+-----------------+----------------+
//! | flags | length (u32 BE) | body (length)  |
//! +-------+-----------------+----------------+
//!   1 B        4 B
//! ```
//!
//! Bit 0 of `flags` (`MORE`) marks that another frame of the same message
//! follows. A message ends with the first frame without `MORE`.
//!
//! ## Rate message
//!
//! Exactly two frames:
//!
//! ```text
//! [ topic (ASCII) ] [ rate: f32 little-endian, bits/s ]
//! ```
//!
//! Bytes beyond the first four of the payload frame are ignored. Textual
//! `"TOPIC value"` strings and bare 4-byte broadcasts are not accepted: they
//! arrive as single-frame messages and fail validation.
//!
//! ## Subscription message (subscriber → publisher)
//!
//! One frame: `0x01 ++ topic` to subscribe, `0x00 ++ topic` to unsubscribe.
//! The publisher forwards messages whose topic starts with a subscribed
//! prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::mapper::RateEstimate;

pub const FLAG_MORE: u8 = 0x01;
pub const FRAME_HEADER_LEN: usize = 5;
/// Larger frames are treated as a corrupt stream.
pub const MAX_FRAME_LEN: usize = 64 * 1024;
pub const RATE_PAYLOAD_LEN: usize = 4;

pub const SUBSCRIBE: u8 = 0x01;
pub const UNSUBSCRIBE: u8 = 0x00;

/// Why a received message was rejected. Never escalated past the subscriber.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("expected 2 frames, got {0}")]
    FrameCount(usize),
    #[error("topic mismatch")]
    TopicMismatch,
    #[error("payload too short: {0} bytes")]
    PayloadTooShort(usize),
    #[error("invalid rate value {0}")]
    InvalidRate(f32),
}

/// The byte stream cannot be resynchronised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds the 64 KiB limit")]
    TooLarge(usize),
    #[error("message exceeds {0} frames")]
    TooManyFrames(usize),
}

/// Upper bound on frames per message.
const MAX_FRAMES: usize = 16;

/// Appends one multi-frame message to `dst`.
pub fn encode_frames(frames: &[&[u8]], dst: &mut BytesMut) {
    let total: usize = frames.iter().map(|f| FRAME_HEADER_LEN + f.len()).sum();
    dst.reserve(total);
    for (i, frame) in frames.iter().enumerate() {
        let more = i + 1 < frames.len();
        dst.put_u8(if more { FLAG_MORE } else { 0 });
        dst.put_u32(frame.len() as u32);
        dst.put_slice(frame);
    }
}

/// Incremental frame parser over a partially-filled stream buffer.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    pending: Vec<Bytes>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next complete message, `Ok(None)` if more bytes are needed.
    pub fn next_message(&mut self) -> Result<Option<Vec<Bytes>>, FrameError> {
        loop {
            if self.buf.len() < FRAME_HEADER_LEN {
                return Ok(None);
            }
            let flags = self.buf[0];
            let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]])
                as usize;
            if len > MAX_FRAME_LEN {
                return Err(FrameError::TooLarge(len));
            }
            if self.buf.len() < FRAME_HEADER_LEN + len {
                return Ok(None);
            }
            self.buf.advance(FRAME_HEADER_LEN);
            let body = self.buf.split_to(len).freeze();
            self.pending.push(body);

            if flags & FLAG_MORE == 0 {
                return Ok(Some(std::mem::take(&mut self.pending)));
            }
            if self.pending.len() >= MAX_FRAMES {
                return Err(FrameError::TooManyFrames(MAX_FRAMES));
            }
        }
    }
}

/// One rate estimate tagged with its topic. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryMessage {
    topic: Bytes,
    rate_bps: f32,
}

impl TelemetryMessage {
    pub fn new(topic: impl Into<Bytes>, rate: RateEstimate) -> Self {
        Self {
            topic: topic.into(),
            rate_bps: rate.bps() as f32,
        }
    }

    pub fn topic(&self) -> &[u8] {
        &self.topic
    }

    /// The rate as carried on the wire (single precision).
    pub fn rate(&self) -> RateEstimate {
        RateEstimate::from_bps(self.rate_bps as f64)
    }

    pub fn payload(&self) -> [u8; RATE_PAYLOAD_LEN] {
        self.rate_bps.to_le_bytes()
    }

    /// Stream encoding: topic frame followed by the payload frame.
    pub fn encode(&self) -> Bytes {
        let payload = self.payload();
        let mut buf = BytesMut::new();
        encode_frames(&[self.topic.as_ref(), &payload[..]], &mut buf);
        buf.freeze()
    }

    /// Validates a received message and extracts the rate.
    pub fn decode(parts: &[Bytes], expected_topic: &[u8]) -> Result<RateEstimate, DecodeError> {
        let [topic, payload] = parts else {
            return Err(DecodeError::FrameCount(parts.len()));
        };
        if topic.as_ref() != expected_topic {
            return Err(DecodeError::TopicMismatch);
        }
        if payload.len() < RATE_PAYLOAD_LEN {
            return Err(DecodeError::PayloadTooShort(payload.len()));
        }
        let rate = f32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        if !rate.is_finite() || rate < 0.0 {
            return Err(DecodeError::InvalidRate(rate));
        }
        Ok(RateEstimate::from_bps(rate as f64))
    }
}

/// Encodes a subscribe (`true`) or unsubscribe request for `topic`.
pub fn encode_subscription(topic: &[u8], subscribe: bool) -> Bytes {
    let mut body = Vec::with_capacity(topic.len() + 1);
    body.push(if subscribe { SUBSCRIBE } else { UNSUBSCRIBE });
    body.extend_from_slice(topic);
    let mut buf = BytesMut::new();
    encode_frames(&[body.as_slice()], &mut buf);
    buf.freeze()
}

/// Parses a subscription request. Anything else is `None`.
pub fn parse_subscription(parts: &[Bytes]) -> Option<(bool, Bytes)> {
    let [frame] = parts else {
        return None;
    };
    match frame.first() {
        Some(&SUBSCRIBE) => Some((true, frame.slice(1..))),
        Some(&UNSUBSCRIBE) => Some((false, frame.slice(1..))),
        _ => None,
    }
}
