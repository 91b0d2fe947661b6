//! Wire protocol for one document connection.
//!
//! A connection carries two frame classes:
//!
//! ```text
//! binary frame ──► SyncMessage (bincode)
//!                  ┌──────────┬──────────┬──────────┬──────────┐
//!                  │ msg_type │ peer_id  │ doc_id   │ payload  │
//!                  │ 1 byte   │ 16 bytes │ string   │ variable │
//!                  └──────────┴──────────┴──────────┴──────────┘
//!
//! text frame   ──► ControlMessage (JSON, tagged by "type")
//!                  {"type": "error", "code": "rate_limited", "message": "..."}
//! ```
//!
//! Replica payloads are yrs v1 encodings and are passed through untouched.
//! Text frames that are not JSON, or carry an unknown `type`, are ignored.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::presence::AwarenessMessage;

/// Custom close code: the caller may not access this document.
pub const CLOSE_ACCESS_DENIED: u16 = 4003;
/// Custom close code: access was withdrawn while connected.
pub const CLOSE_ACCESS_REVOKED: u16 = 4004;
/// Standard WebSocket "policy violation".
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Standard WebSocket "normal closure", used for local graceful shutdown.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close codes that end the session without a reconnect attempt.
pub const NO_RETRY_CLOSE_CODES: [u16; 3] =
    [CLOSE_ACCESS_DENIED, CLOSE_ACCESS_REVOKED, CLOSE_POLICY_VIOLATION];

/// Binary message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Yrs state vector, asks the other side for what we lack
    SyncStep1 = 1,
    /// Yrs state diff answering a SyncStep1; the first one is the full sync
    SyncStep2 = 2,
    /// Incremental yrs update
    Update = 3,
    /// Presence announcement or departure
    Awareness = 4,
}

/// Binary replica-sync frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub doc_id: String,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    pub fn sync_step1(peer_id: Uuid, doc_id: &str, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, peer_id, doc_id, state_vector)
    }

    pub fn sync_step2(peer_id: Uuid, doc_id: &str, state_diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, peer_id, doc_id, state_diff)
    }

    pub fn update(peer_id: Uuid, doc_id: &str, yrs_update: Vec<u8>) -> Self {
        Self::new(MessageType::Update, peer_id, doc_id, yrs_update)
    }

    pub fn awareness(
        peer_id: Uuid,
        doc_id: &str,
        message: &AwarenessMessage,
    ) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(message, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::new(MessageType::Awareness, peer_id, doc_id, payload))
    }

    fn new(msg_type: MessageType, peer_id: Uuid, doc_id: &str, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            doc_id: doc_id.to_string(),
            payload,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the presence payload of an `Awareness` frame.
    pub fn awareness_message(&self) -> Result<AwarenessMessage, ProtocolError> {
        if self.msg_type != MessageType::Awareness {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (msg, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }
}

/// Error codes carried by `{"type": "error"}` control messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    AccessDenied,
    RateLimited,
    Other(String),
}

impl ErrorCode {
    pub fn parse(code: &str) -> Self {
        match code {
            "access_denied" => ErrorCode::AccessDenied,
            "rate_limited" => ErrorCode::RateLimited,
            other => ErrorCode::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::AccessDenied => "access_denied",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::Other(code) => code,
        }
    }

    /// Codes that end the session and mark the document denied.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorCode::AccessDenied | ErrorCode::RateLimited)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured control message sent by the server as a text frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Error {
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    AccessRevoked {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        page_id: Option<String>,
    },
    LinksUpdated {
        #[serde(default)]
        page_id: Option<String>,
    },
}

impl ControlMessage {
    /// Parse a text frame. Returns `None` for non-JSON text or an unknown
    /// `type`.
    pub fn parse(text: &str) -> Option<Self> {
        match serde_json::from_str(text) {
            Ok(msg) => Some(msg),
            Err(e) => {
                log::debug!("Ignoring unrecognized control frame: {e}");
                None
            }
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::PresenceAttributes;

    #[test]
    fn test_sync_message_roundtrip() {
        let peer = Uuid::new_v4();
        let msg = SyncMessage::update(peer, "page-1", vec![1, 2, 3, 4, 5]);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Update);
        assert_eq!(decoded.peer_id, peer);
        assert_eq!(decoded.doc_id, "page-1");
        assert_eq!(decoded.payload, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_awareness_payload() {
        let peer = Uuid::new_v4();
        let announce = AwarenessMessage::Announce {
            peer_id: peer,
            attributes: PresenceAttributes::new("Alice", "#ff0000"),
        };
        let msg = SyncMessage::awareness(peer, "page-1", &announce).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.awareness_message().unwrap(), announce);
    }

    #[test]
    fn test_awareness_on_wrong_type() {
        let msg = SyncMessage::sync_step1(Uuid::new_v4(), "page-1", vec![0]);
        assert_eq!(msg.awareness_message(), Err(ProtocolError::InvalidMessageType));
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(SyncMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_parse_error_control() {
        let msg = ControlMessage::parse(
            r#"{"type":"error","code":"rate_limited","message":"slow down"}"#,
        );
        assert_eq!(
            msg,
            Some(ControlMessage::Error {
                code: Some("rate_limited".into()),
                message: Some("slow down".into()),
            })
        );
    }

    #[test]
    fn test_parse_access_revoked_and_links() {
        assert_eq!(
            ControlMessage::parse(r#"{"type":"access_revoked","page_id":"p1"}"#),
            Some(ControlMessage::AccessRevoked {
                message: None,
                page_id: Some("p1".into()),
            })
        );
        assert_eq!(
            ControlMessage::parse(r#"{"type":"links_updated","page_id":"p1"}"#),
            Some(ControlMessage::LinksUpdated {
                page_id: Some("p1".into()),
            })
        );
    }

    #[test]
    fn test_parse_ignores_unknown_and_garbage() {
        assert_eq!(ControlMessage::parse(r#"{"type":"party"}"#), None);
        assert_eq!(ControlMessage::parse("not json"), None);
        assert_eq!(ControlMessage::parse(r#"{"code":"access_denied"}"#), None);
    }

    #[test]
    fn test_error_codes() {
        assert!(ErrorCode::parse("access_denied").is_fatal());
        assert!(ErrorCode::parse("rate_limited").is_fatal());
        let other = ErrorCode::parse("internal");
        assert!(!other.is_fatal());
        assert_eq!(other.to_string(), "internal");
    }

    #[test]
    fn test_no_retry_codes() {
        assert!(NO_RETRY_CLOSE_CODES.contains(&4003));
        assert!(NO_RETRY_CLOSE_CODES.contains(&1008));
        assert!(!NO_RETRY_CLOSE_CODES.contains(&CLOSE_NORMAL));
    }
}
