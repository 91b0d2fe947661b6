//! Connection state machine for one document session.
//!
//! ```text
//!                 ┌────────────── error / offline (from any non-terminal) ─┐
//!                 ▼                                                        │
//!  ┌────────────┐ open ┌───────────┐ drop ┌──────────────┐                 │
//!  │ connecting │─────►│ connected │─────►│ disconnected │                 │
//!  └─────┬──────┘      └───────────┘      └──┬────────┬──┘                 │
//!        │  ▲                retry           │        │ policy             │
//!        │  └────────────────────────────────┘        ▼                    │
//!        │             policy / denial            ┌────────┐               │
//!        └───────────────────────────────────────►│ denied │ (terminal)    │
//!                                                 └────────┘               │
//! ```
//!
//! Callers only *request* transitions; [`ConnectionStateMachine::request`]
//! checks every request against [`is_allowed`] and publishes accepted ones to
//! subscribers. The reconnect and close-code policies live here too so they
//! can be tested without a transport.

use std::fmt;

use crate::listeners::{emit, ListenerId, Listeners};
use crate::protocol::NO_RETRY_CLOSE_CODES;

/// Externally observable connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Denied,
    Error,
    Offline,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Denied => "denied",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Offline => "offline",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionStatus::Denied)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed transition table.
pub fn is_allowed(from: ConnectionStatus, to: ConnectionStatus) -> bool {
    use ConnectionStatus::*;
    match (from, to) {
        (Denied, _) => false,
        (_, Error) | (_, Offline) => true,
        (Connecting, Connected) | (Connecting, Denied) => true,
        (Connected, Disconnected) => true,
        (Disconnected, Connecting) | (Disconnected, Denied) => true,
        (Offline, Connecting) | (Offline, Connected) | (Offline, Disconnected) | (Offline, Denied) => {
            true
        }
        (Error, Connecting) | (Error, Denied) => true,
        _ => false,
    }
}

/// Published on every accepted transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub doc_id: String,
    pub from: ConnectionStatus,
    pub status: ConnectionStatus,
}

/// Result of a transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Moved to the requested state; subscribers were notified.
    Applied,
    /// Already in the requested state; nothing published.
    Unchanged,
    /// Not in the table.
    Rejected,
}

/// What the transport should do after a failed or dropped connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after backoff; `attempt` is the consecutive failure count.
    Retry { attempt: u32 },
    /// Stop; the session was moved to `denied`.
    Deny,
}

/// State machine plus the reconnect and close-code policies.
pub struct ConnectionStateMachine {
    doc_id: String,
    status: ConnectionStatus,
    failures: u32,
    denial_threshold: u32,
    ever_synced: bool,
    listeners: Listeners<StatusChange>,
}

impl ConnectionStateMachine {
    /// New machine in `connecting`.
    pub fn new(doc_id: impl Into<String>, denial_threshold: u32) -> Self {
        Self {
            doc_id: doc_id.into(),
            status: ConnectionStatus::Connecting,
            failures: 0,
            denial_threshold: denial_threshold.max(1),
            ever_synced: false,
            listeners: Listeners::new(),
        }
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Consecutive failed attempts since the last successful connection.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Whether a full sync has ever completed on this machine.
    pub fn ever_synced(&self) -> bool {
        self.ever_synced
    }

    /// Subscribe to accepted transitions.
    pub fn subscribe<F>(&mut self, listener: F) -> ListenerId
    where
        F: Fn(&StatusChange) + Send + Sync + 'static,
    {
        self.listeners.add(listener)
    }

    /// Remove a listener. Returns false for unknown ids.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Drop every listener (session teardown).
    pub fn clear_listeners(&mut self) {
        self.listeners.clear();
    }

    /// Request a transition. The only way the state changes.
    pub fn request(&mut self, to: ConnectionStatus) -> Transition {
        if self.status == to {
            return Transition::Unchanged;
        }
        if !is_allowed(self.status, to) {
            log::debug!(
                "Rejected transition {} -> {} for doc {}",
                self.status,
                to,
                self.doc_id
            );
            return Transition::Rejected;
        }
        let change = StatusChange {
            doc_id: self.doc_id.clone(),
            from: self.status,
            status: to,
        };
        log::debug!("Doc {}: {} -> {}", self.doc_id, change.from, to);
        self.status = to;
        emit(&self.listeners.snapshot(), &change);
        Transition::Applied
    }

    /// The transport connected. Resets the failure counter.
    pub fn on_connected(&mut self) -> Transition {
        self.failures = 0;
        self.request(ConnectionStatus::Connected)
    }

    /// The first full sync completed (now or after a timeout).
    pub fn on_synced(&mut self) -> Transition {
        self.ever_synced = true;
        self.failures = 0;
        if self.status == ConnectionStatus::Offline {
            self.request(ConnectionStatus::Connected)
        } else {
            Transition::Unchanged
        }
    }

    /// The sync fallback timer fired without a denial.
    pub fn on_sync_timeout(&mut self) -> Transition {
        self.request(ConnectionStatus::Offline)
    }

    /// A connection attempt failed, or an established connection dropped
    /// with a retryable close code.
    ///
    /// Reaching the threshold before any sync ever completed is treated as
    /// a denial. The counter resets on every successful connection, so the
    /// threshold only catches attempts that never connect: a server that
    /// accepts and then drops the link with a retryable code is retried
    /// indefinitely.
    pub fn on_failure(&mut self) -> RetryDecision {
        if self.status == ConnectionStatus::Connected {
            self.request(ConnectionStatus::Disconnected);
        }
        self.failures = self.failures.saturating_add(1);
        if !self.ever_synced && self.failures >= self.denial_threshold {
            log::warn!(
                "Doc {}: {} consecutive failures before first sync, treating as denied",
                self.doc_id,
                self.failures
            );
            self.force_denied();
            return RetryDecision::Deny;
        }
        RetryDecision::Retry {
            attempt: self.failures,
        }
    }

    /// The transport closed with `code`. Codes in the no-retry set force
    /// `denied`; anything else falls through to [`on_failure`](Self::on_failure).
    pub fn on_closed(&mut self, code: Option<u16>) -> RetryDecision {
        if code.is_some_and(is_no_retry_close_code) {
            log::warn!(
                "Doc {}: closed with no-retry code {:?}",
                self.doc_id,
                code
            );
            self.force_denied();
            return RetryDecision::Deny;
        }
        self.on_failure()
    }

    /// About to start a new connection attempt.
    pub fn on_retry(&mut self) -> Transition {
        self.request(ConnectionStatus::Connecting)
    }

    pub fn on_fatal(&mut self) -> Transition {
        self.request(ConnectionStatus::Error)
    }

    /// Move to `denied` through the table: a connected session passes
    /// through `disconnected` first.
    pub fn force_denied(&mut self) -> Transition {
        if self.status == ConnectionStatus::Connected {
            self.request(ConnectionStatus::Disconnected);
        }
        self.request(ConnectionStatus::Denied)
    }
}

/// Whether a close code suppresses reconnection.
pub fn is_no_retry_close_code(code: u16) -> bool {
    NO_RETRY_CLOSE_CODES.contains(&code)
}

impl fmt::Debug for ConnectionStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStateMachine")
            .field("doc_id", &self.doc_id)
            .field("status", &self.status)
            .field("failures", &self.failures)
            .field("ever_synced", &self.ever_synced)
            .finish()
    }
}
