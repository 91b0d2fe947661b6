//! # page-collab: Real-time collaboration client for pages
//!
//! Opens a CRDT replica per document, syncs it over WebSocket, tracks who
//! else is on the page, and decides once per open whether the caller should
//! show the replica or a REST snapshot.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   open()   ┌──────────────┐  WebSocket  ┌─────────────┐
//! │CollabContext│ ─────────► │ Session      │ ◄─────────► │ Sync server │
//! │ + denials   │            │  + driver    │  bincode /  └─────────────┘
//! └─────────────┘            └──────┬───────┘  JSON ctrl
//!                                   │
//!           ┌──────────────┬────────┴──────┬─────────────────┐
//!           ▼              ▼               ▼                 ▼
//!    ┌────────────┐ ┌─────────────┐ ┌──────────────┐ ┌───────────────┐
//!    │ Replica    │ │ Presence    │ │ Connection   │ │ Sync          │
//!    │ (yrs doc)  │ │ table       │ │ state machine│ │ coordinator   │
//!    └────────────┘ └─────────────┘ └──────────────┘ └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`session`]: Open/destroy lifecycle and the per-session driver task
//! - [`transport`]: WebSocket link and inbound demultiplexing
//! - [`state`]: Connection status and the closed transition table
//! - [`sync`]: One-shot sync outcome and REST/replica reconciliation
//! - [`replica`]: Shared-text CRDT replica
//! - [`presence`]: Peer presence table and awareness messages
//! - [`denial`]: Process-wide access-denial cache
//! - [`protocol`]: Wire frames, control messages and close codes
//! - [`config`]: Client configuration

pub mod config;
pub mod denial;
pub mod error;
mod listeners;
pub mod presence;
pub mod protocol;
pub mod replica;
pub mod session;
pub mod state;
pub mod sync;
pub mod transport;

// Re-exports for convenience
pub use config::CollabConfig;
pub use denial::AccessDenialCache;
pub use error::{CollabError, CollabResult, ProtocolError, TransportError};
pub use listeners::ListenerId;
pub use presence::{
    AwarenessMessage, PeerPresence, PresenceAttributes, PresenceSnapshot, PresenceTable,
};
pub use protocol::{ControlMessage, ErrorCode, MessageType, SyncMessage};
pub use replica::{ChangeOrigin, ReplicaChange, ReplicaHandle};
pub use session::{CollabContext, OpenOptions, Session, SessionEvent, TeardownStep};
pub use state::{ConnectionStateMachine, ConnectionStatus, StatusChange};
pub use sync::{RestSnapshot, SyncCoordinator, SyncOutcome};
pub use transport::{Connector, Link, LinkPeer, TransportSession, WsConnector};
