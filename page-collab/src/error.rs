//! Error types for the collaboration client.
//!
//! Only configuration and caller-misuse errors ever reach the caller as
//! `Err`. Network and protocol faults are absorbed by the session driver and
//! logged; authorization faults surface as [`SessionEvent`]s instead.
//!
//! [`SessionEvent`]: crate::session::SessionEvent

use thiserror::Error;

/// Wire-level encode/decode failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("invalid message type")]
    InvalidMessageType,
}

/// Failures reported by a [`Connector`](crate::transport::Connector) or an
/// open link.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Could not establish the connection. Retried under the backoff policy.
    #[error("connect failed: {0}")]
    Connect(String),
    /// The connection can never succeed (bad URL, unsupported scheme).
    #[error("unrecoverable transport fault: {0}")]
    Fatal(String),
}

impl TransportError {
    /// Whether retrying the same connection could ever succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Fatal(_))
    }
}

/// Top-level error for the crate.
#[derive(Debug, Error)]
pub enum CollabError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("replica error: {0}")]
    Replica(String),
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
    #[error("session already closed")]
    SessionClosed,
}

pub type CollabResult<T> = Result<T, CollabError>;
