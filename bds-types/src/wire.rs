//! Wire protocol spoken to the command server.
//!
//! Every message is a UTF-8 JSON object preceded by a 4-byte big-endian
//! unsigned length. This module provides the message types and a
//! [`tokio_util::codec`] implementation of the framing.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::RiskLevel;

/// Name of the risk-level-change event on the wire.
pub const EVENT_BR_CHANGED: &str = "BR_CHANGED";

/// Refuse to decode frames larger than this; the peer is not speaking our
/// protocol.
const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// A message sent to the command server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WireMessage {
    Event {
        event: String,
        result: RiskLevel,
        timestamp: f64,
    },
    Heartbeat {
        timestamp: f64,
        status: String,
    },
    Connection {
        status: String,
        timestamp: f64,
    },
}

impl WireMessage {
    pub fn level_change(level: RiskLevel, timestamp: f64) -> Self {
        WireMessage::Event {
            event: EVENT_BR_CHANGED.to_string(),
            result: level,
            timestamp,
        }
    }

    pub fn heartbeat(timestamp: f64) -> Self {
        WireMessage::Heartbeat {
            timestamp,
            status: "alive".to_string(),
        }
    }

    pub fn connected(timestamp: f64) -> Self {
        WireMessage::Connection {
            status: "connected".to_string(),
            timestamp,
        }
    }

    /// Whether this is an event-type message. Events are the only messages
    /// worth re-queueing after a failed send.
    pub fn is_event(&self) -> bool {
        matches!(self, WireMessage::Event { .. })
    }

    /// The risk level carried by an event message, if any.
    pub fn level(&self) -> Option<RiskLevel> {
        match self {
            WireMessage::Event { result, .. } => Some(*result),
            _ => None,
        }
    }
}

/// Length-prefixed JSON codec for [`WireMessage`].
#[derive(Debug, Default)]
pub struct EventCodec {}

impl Encoder<WireMessage> for EventCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: WireMessage, dst: &mut BytesMut) -> std::io::Result<()> {
        let payload = serde_json::to_vec(&item)?;
        let len: u32 = payload
            .len()
            .try_into()
            .map_err(|_| std::io::Error::other("wire message too large"))?;
        dst.reserve(4 + payload.len());
        dst.put_u32(len); // big-endian
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

impl Decoder for EventCodec {
    type Item = WireMessage;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::io::Result<Option<WireMessage>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[0..4]);
        let len = u32::from_be_bytes(len_bytes);
        if len > MAX_FRAME_LEN {
            return Err(std::io::Error::other(format!(
                "wire frame length {len} exceeds maximum"
            )));
        }
        let len = len as usize;
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let payload = src.split_to(len);
        let msg = serde_json::from_slice(&payload)?;
        Ok(Some(msg))
    }
}

// tests below here ---------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_json_shape() {
        let msg = WireMessage::level_change(RiskLevel::High, 1_700_000_000.0);
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["event"], "BR_CHANGED");
        assert_eq!(json["result"], "BR_HIGH");
        assert_eq!(json["timestamp"], 1_700_000_000.0);
    }

    #[test]
    fn heartbeat_json_shape() {
        let msg = WireMessage::heartbeat(12.5);
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "heartbeat");
        assert_eq!(json["status"], "alive");
    }

    #[test]
    fn connection_json_shape() {
        let msg = WireMessage::connected(12.5);
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "connection");
        assert_eq!(json["status"], "connected");
    }

    #[test]
    fn framing_is_big_endian_length_plus_utf8_json() {
        let msg = WireMessage::level_change(RiskLevel::Low, 1.0);
        let mut codec = EventCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).unwrap();

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len() - 4);
        let payload = std::str::from_utf8(&buf[4..]).unwrap();
        let value: serde_json::Value = serde_json::from_str(payload).unwrap();
        assert_eq!(value["result"], "BR_LOW");
    }

    #[test]
    fn codec_roundtrip() {
        let msgs = vec![
            WireMessage::connected(1.0),
            WireMessage::level_change(RiskLevel::Medium, 2.0),
            WireMessage::heartbeat(3.0),
        ];

        let mut codec = EventCodec::default();
        let mut buf = BytesMut::new();
        for msg in &msgs {
            codec.encode(msg.clone(), &mut buf).unwrap();
        }

        for expected in &msgs {
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(&decoded, expected);
        }
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn decode_partial_frame_waits_for_more() {
        let msg = WireMessage::heartbeat(4.0);
        let mut codec = EventCodec::default();
        let mut full = BytesMut::new();
        codec.encode(msg.clone(), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..5]);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);
        partial.extend_from_slice(&full[5..]);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(msg));
    }
}
