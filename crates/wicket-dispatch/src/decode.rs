//! Turning raw inbound frames into dispatch messages

use crate::message::{Conn, Message};
use crate::{DispatchError, Result};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

/// Converts an inbound frame into a [`Message`]
pub trait MessageDecoder: Send + Sync {
    fn decode(&self, conn: Arc<dyn Conn>, data: &[u8]) -> Result<Message>;
}

#[derive(Deserialize)]
struct Envelope {
    name: String,
    #[serde(default)]
    key: Option<u64>,
    #[serde(default)]
    payload: Value,
}

/// Decodes `{"name": "...", "key": 1, "payload": ...}` frames.
///
/// `key` defaults to the connection ID so a client's messages stay ordered.
/// `payload` is re-encoded as JSON bytes; a missing or null payload becomes
/// an empty one.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonEnvelopeDecoder;

impl MessageDecoder for JsonEnvelopeDecoder {
    fn decode(&self, conn: Arc<dyn Conn>, data: &[u8]) -> Result<Message> {
        let envelope: Envelope = serde_json::from_slice(data)?;
        if envelope.name.is_empty() {
            return Err(DispatchError::InvalidMessage(
                "message name is empty".to_string(),
            ));
        }

        let key = envelope.key.unwrap_or_else(|| conn.id());
        let payload = match envelope.payload {
            Value::Null => Vec::new(),
            value => serde_json::to_vec(&value)?,
        };

        Ok(Message::new(envelope.name, key, payload).with_conn(conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SendError;
    use std::net::SocketAddr;

    struct StubConn(u64);

    impl Conn for StubConn {
        fn id(&self) -> u64 {
            self.0
        }

        fn remote_addr(&self) -> SocketAddr {
            SocketAddr::from(([127, 0, 0, 1], 4000))
        }

        fn write_text(&self, _text: String) -> std::result::Result<(), SendError> {
            Ok(())
        }

        fn write_binary(&self, _data: Vec<u8>) -> std::result::Result<(), SendError> {
            Ok(())
        }

        fn close(&self) -> bool {
            false
        }
    }

    fn conn(id: u64) -> Arc<dyn Conn> {
        Arc::new(StubConn(id))
    }

    #[test]
    fn test_decode_full_envelope() {
        let msg = JsonEnvelopeDecoder
            .decode(conn(3), br#"{"name":"chat","key":99,"payload":{"text":"hi"}}"#)
            .unwrap();

        assert_eq!(msg.name(), "chat");
        assert_eq!(msg.key(), 99);
        assert_eq!(msg.conn().map(|c| c.id()), Some(3));

        let payload: Value = msg.payload_json().unwrap();
        assert_eq!(payload["text"], "hi");
    }

    #[test]
    fn test_key_defaults_to_connection_id() {
        let msg = JsonEnvelopeDecoder
            .decode(conn(12), br#"{"name":"ping"}"#)
            .unwrap();
        assert_eq!(msg.key(), 12);
        assert!(msg.payload().is_empty());
    }

    #[test]
    fn test_rejects_malformed_frames() {
        let err = JsonEnvelopeDecoder.decode(conn(1), b"not json").unwrap_err();
        assert!(matches!(err, DispatchError::Decode(_)));

        let err = JsonEnvelopeDecoder
            .decode(conn(1), br#"{"name":""}"#)
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidMessage(_)));

        assert!(JsonEnvelopeDecoder.decode(conn(1), br#"{"key":1}"#).is_err());
    }
}
