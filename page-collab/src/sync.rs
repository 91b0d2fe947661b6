//! One-shot sync resolution and REST/replica reconciliation.
//!
//! Two sources of truth race when a page opens: the REST snapshot (fast,
//! possibly stale) and the replica (authoritative once synced, slow to
//! arrive). The coordinator settles which one the caller shows, exactly once
//! per session:
//!
//! ```text
//!            ┌─ first SyncStep2 ─► replica non-empty  ─► {synced, has_content}
//!  open ─────┤                    replica empty       ─► insert snapshot once,
//!            │                                           {synced, !has_content}
//!            ├─ timer fires ─────► {!synced}  (replica untouched)
//!            └─ denial ──────────► {access_denied}
//! ```
//!
//! Whatever fires second is a no-op. A sync that arrives after the timer is
//! reported separately as a late sync so the caller can switch from the REST
//! content to the replica.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::replica::ReplicaHandle;

/// Document snapshot fetched from the REST storage API.
///
/// Only `content` is used here; the rest is carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestSnapshot {
    pub content: String,
    #[serde(flatten)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl RestSnapshot {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: serde_json::Map::new(),
        }
    }
}

/// The once-per-session answer to "what should the caller show?".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// The replica completed its first full sync before the timer.
    pub synced: bool,
    /// The replica already held content at first sync, so the REST
    /// snapshot was discarded.
    pub replica_has_content: bool,
    /// A denial arrived first; the session will not sync.
    pub access_denied: bool,
}

impl SyncOutcome {
    pub fn synced(replica_has_content: bool) -> Self {
        Self {
            synced: true,
            replica_has_content,
            access_denied: false,
        }
    }

    pub fn timed_out() -> Self {
        Self::default()
    }

    pub fn denied() -> Self {
        Self {
            access_denied: true,
            ..Self::default()
        }
    }
}

/// What a first-sync event amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstSync {
    /// Resolved the pending outcome.
    Resolved(SyncOutcome),
    /// The timer had already resolved `{synced: false}`; this is the sync
    /// the caller was told to wait for.
    Late,
    /// A sync was already seen, or the session was denied.
    Ignored,
}

/// Resolves the sync outcome exactly once and performs the reconciliation
/// insert.
#[derive(Debug)]
pub struct SyncCoordinator {
    snapshot: Option<RestSnapshot>,
    deadline: Instant,
    outcome: Option<SyncOutcome>,
    replica_synced: bool,
}

impl SyncCoordinator {
    /// Start the fallback timer now.
    pub fn new(snapshot: Option<RestSnapshot>, timeout: Duration) -> Self {
        Self {
            snapshot,
            deadline: Instant::now() + timeout,
            outcome: None,
            replica_synced: false,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_pending(&self) -> bool {
        self.outcome.is_none()
    }

    pub fn outcome(&self) -> Option<SyncOutcome> {
        self.outcome
    }

    /// Whether the replica has completed a full sync at any point.
    pub fn replica_synced(&self) -> bool {
        self.replica_synced
    }

    /// The first full sync acknowledgment arrived and has already been
    /// applied to `replica`.
    pub fn on_first_sync(&mut self, replica: &ReplicaHandle) -> FirstSync {
        if self.replica_synced {
            return FirstSync::Ignored;
        }
        match self.outcome {
            None => {
                self.replica_synced = true;
                let outcome = self.reconcile(replica);
                self.outcome = Some(outcome);
                FirstSync::Resolved(outcome)
            }
            Some(outcome) if outcome.access_denied => FirstSync::Ignored,
            Some(_) => {
                self.replica_synced = true;
                // REST content was shown instead; never merged into the replica.
                self.snapshot = None;
                FirstSync::Late
            }
        }
    }

    /// The fallback timer fired.
    pub fn on_timeout(&mut self) -> Option<SyncOutcome> {
        if self.outcome.is_some() {
            return None;
        }
        let outcome = SyncOutcome::timed_out();
        self.outcome = Some(outcome);
        Some(outcome)
    }

    /// A denial signal arrived.
    pub fn on_denied(&mut self) -> Option<SyncOutcome> {
        if self.outcome.is_some() {
            return None;
        }
        self.snapshot = None;
        let outcome = SyncOutcome::denied();
        self.outcome = Some(outcome);
        Some(outcome)
    }

    /// Decide between replica and snapshot. Only called from the first
    /// sync, so the snapshot is inserted at most once.
    fn reconcile(&mut self, replica: &ReplicaHandle) -> SyncOutcome {
        let snapshot = self.snapshot.take();
        if !replica.is_empty() {
            log::debug!("Replica has content at first sync; discarding REST snapshot");
            return SyncOutcome::synced(true);
        }
        if let Some(snapshot) = snapshot.filter(|s| !s.content.is_empty()) {
            match replica.insert(0, &snapshot.content) {
                Ok(()) => log::info!(
                    "Seeded empty replica with {} bytes of REST content",
                    snapshot.content.len()
                ),
                Err(e) => log::error!("Failed to seed replica from REST snapshot: {e}"),
            }
        }
        SyncOutcome::synced(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator(content: &str) -> SyncCoordinator {
        SyncCoordinator::new(Some(RestSnapshot::new(content)), Duration::from_secs(2))
    }

    #[test]
    fn test_empty_replica_seeded_once() {
        let replica = ReplicaHandle::new();
        let mut sync = coordinator("hello");

        assert_eq!(
            sync.on_first_sync(&replica),
            FirstSync::Resolved(SyncOutcome::synced(false))
        );
        assert_eq!(replica.text(), "hello");

        // Repeat events are no-ops
        assert_eq!(sync.on_first_sync(&replica), FirstSync::Ignored);
        assert_eq!(sync.on_timeout(), None);
        assert_eq!(sync.on_denied(), None);
        assert_eq!(replica.text(), "hello");
        assert_eq!(sync.outcome(), Some(SyncOutcome::synced(false)));
    }

    #[test]
    fn test_non_empty_replica_keeps_content() {
        let replica = ReplicaHandle::new();
        replica.insert(0, "from peers").unwrap();
        let mut sync = coordinator("stale rest copy");

        assert_eq!(
            sync.on_first_sync(&replica),
            FirstSync::Resolved(SyncOutcome::synced(true))
        );
        assert_eq!(replica.text(), "from peers");
    }

    #[test]
    fn test_empty_snapshot_leaves_replica_empty() {
        let replica = ReplicaHandle::new();
        let mut sync = coordinator("");
        sync.on_first_sync(&replica);
        assert!(replica.is_empty());

        let mut sync = SyncCoordinator::new(None, Duration::from_secs(2));
        assert_eq!(
            sync.on_first_sync(&replica),
            FirstSync::Resolved(SyncOutcome::synced(false))
        );
        assert!(replica.is_empty());
    }

    #[test]
    fn test_timeout_first_never_touches_replica() {
        let replica = ReplicaHandle::new();
        let mut sync = coordinator("hello");

        assert_eq!(sync.on_timeout(), Some(SyncOutcome::timed_out()));
        assert_eq!(sync.on_timeout(), None);
        assert!(replica.is_empty());

        // The delayed sync is reported as late and does not seed
        assert_eq!(sync.on_first_sync(&replica), FirstSync::Late);
        assert!(replica.is_empty());
        assert!(sync.replica_synced());
        assert_eq!(sync.outcome(), Some(SyncOutcome::timed_out()));

        assert_eq!(sync.on_first_sync(&replica), FirstSync::Ignored);
    }

    #[test]
    fn test_denial_short_circuits() {
        let replica = ReplicaHandle::new();
        let mut sync = coordinator("hello");

        assert_eq!(sync.on_denied(), Some(SyncOutcome::denied()));
        assert_eq!(sync.on_timeout(), None);
        assert_eq!(sync.on_first_sync(&replica), FirstSync::Ignored);
        assert!(replica.is_empty());
    }

    #[test]
    fn test_rest_snapshot_keeps_metadata() {
        let snapshot: RestSnapshot =
            serde_json::from_str(r#"{"content":"X","title":"Notes","version":4}"#).unwrap();
        assert_eq!(snapshot.content, "X");
        assert_eq!(snapshot.metadata["title"], "Notes");
        assert_eq!(snapshot.metadata["version"], 4);
    }
}
