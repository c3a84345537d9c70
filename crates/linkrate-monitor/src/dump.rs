//! One-line rendering of raw telemetry messages.

use bytes::Bytes;
use linkrate_core::telemetry::wire::RATE_PAYLOAD_LEN;

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

fn topic_text(topic: &[u8]) -> String {
    if !topic.is_empty() && topic.iter().all(u8::is_ascii_graphic) {
        String::from_utf8_lossy(topic).into_owned()
    } else {
        format!("0x{}", hex(topic))
    }
}

fn leading_f32(data: &[u8]) -> Option<f32> {
    let bytes: [u8; RATE_PAYLOAD_LEN] = data.get(..RATE_PAYLOAD_LEN)?.try_into().ok()?;
    Some(f32::from_le_bytes(bytes))
}

/// How a message would be read, with every frame in hex.
///
/// Two-frame messages are `[topic, f32 LE]`; a single 4-byte frame is shown
/// as a bare float, which subscribers reject.
pub fn describe(parts: &[Bytes]) -> String {
    let frames = parts.iter().map(|p| hex(p)).collect::<Vec<_>>().join(" | ");
    let reading = match parts {
        [topic, payload] => match leading_f32(payload) {
            Some(rate) => format!("{} {rate} bps", topic_text(topic)),
            None => format!("{} <{}-byte payload>", topic_text(topic), payload.len()),
        },
        [single] if single.len() == RATE_PAYLOAD_LEN => match leading_f32(single) {
            Some(rate) => format!("<no topic> {rate} bps"),
            None => "<no topic>".to_string(),
        },
        [single] => format!("<single frame> {}", String::from_utf8_lossy(single)),
        _ => format!("<{} frames>", parts.len()),
    };
    format!("{reading}  [{frames}]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_message() {
        let parts = vec![
            Bytes::from_static(b"BITRATE"),
            Bytes::copy_from_slice(&2.5e6f32.to_le_bytes()),
        ];
        assert_eq!(
            describe(&parts),
            "BITRATE 2500000 bps  [42495452415445 | 8096184a]"
        );
    }

    #[test]
    fn short_payload_and_binary_topic() {
        let parts = vec![Bytes::from_static(&[0x00, 0xff]), Bytes::from_static(b"ab")];
        assert_eq!(describe(&parts), "0x00ff <2-byte payload>  [00ff | 6162]");
    }

    #[test]
    fn bare_float_and_text_variants() {
        let bare = vec![Bytes::copy_from_slice(&1e6f32.to_le_bytes())];
        assert!(describe(&bare).starts_with("<no topic> 1000000 bps"));

        let text = vec![Bytes::from_static(b"BITRATE 500000000")];
        assert!(describe(&text).starts_with("<single frame> BITRATE 500000000"));
    }

    #[test]
    fn many_frames() {
        let parts = vec![Bytes::from_static(b"a"); 3];
        assert_eq!(describe(&parts), "<3 frames>  [61 | 61 | 61]");
    }
}
