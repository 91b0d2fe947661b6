//! Presence table: who else is looking at this page.
//!
//! ## Data flow
//!
//! ```text
//! PresenceTable::set_local()  ──► AwarenessMessage::Announce ──► server
//!                                                                  │
//! remote Announce / Leave  ◄──────────────────────────────────────┘
//!       │
//!       ▼
//! PresenceTable::apply()  ──► on_change listeners ──► SessionEvent::PresenceChanged
//! ```
//!
//! Entries are ephemeral: nothing here is persisted and the remote half of
//! the table is cleared whenever the transport drops.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::listeners::{emit, ListenerId, Listeners};

/// Presence attributes a peer announces about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceAttributes {
    pub name: String,
    /// CSS color, `#rrggbb`.
    pub color: String,
}

impl PresenceAttributes {
    pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: color.into(),
        }
    }

    /// Attributes with a color derived from the peer id.
    pub fn for_peer(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self::new(name, color_for_peer(peer_id))
    }
}

/// Stable, vivid `#rrggbb` color for a peer id.
///
/// Hue comes from the id hash; saturation and lightness are fixed so every
/// cursor stays readable.
pub fn color_for_peer(peer_id: Uuid) -> String {
    let hue = ((peer_id.as_u128() % 360) as f32) / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Presence messages carried inside `Awareness` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AwarenessMessage {
    /// A peer joined or changed its attributes.
    Announce {
        peer_id: Uuid,
        attributes: PresenceAttributes,
    },
    /// A peer left; sent by the peer itself or by the server when the
    /// peer's connection drops.
    Leave { peer_id: Uuid },
}

impl AwarenessMessage {
    pub fn peer_id(&self) -> Uuid {
        match self {
            AwarenessMessage::Announce { peer_id, .. } => *peer_id,
            AwarenessMessage::Leave { peer_id } => *peer_id,
        }
    }
}

/// One row of a presence snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerPresence {
    pub peer_id: Uuid,
    pub attributes: PresenceAttributes,
    pub is_local: bool,
}

/// Point-in-time view of the table, local peer included.
pub type PresenceSnapshot = BTreeMap<Uuid, PresenceAttributes>;

struct Inner {
    local: Option<PresenceAttributes>,
    remote: BTreeMap<Uuid, PresenceAttributes>,
    listeners: Listeners<[PeerPresence]>,
}

/// Peer id → presence attributes, with change notification.
///
/// Clones share the same table.
#[derive(Clone)]
pub struct PresenceTable {
    local_peer_id: Uuid,
    inner: Arc<Mutex<Inner>>,
}

impl PresenceTable {
    pub fn new(local_peer_id: Uuid) -> Self {
        Self {
            local_peer_id,
            inner: Arc::new(Mutex::new(Inner {
                local: None,
                remote: BTreeMap::new(),
                listeners: Listeners::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn local(&self) -> Option<PresenceAttributes> {
        self.lock().local.clone()
    }

    /// Set our own attributes. Returns the announcement to broadcast.
    pub fn set_local(&self, attributes: PresenceAttributes) -> AwarenessMessage {
        let changed = {
            let mut inner = self.lock();
            let changed = inner.local.as_ref() != Some(&attributes);
            inner.local = Some(attributes.clone());
            changed
        };
        if changed {
            self.notify();
        }
        AwarenessMessage::Announce {
            peer_id: self.local_peer_id,
            attributes,
        }
    }

    /// Announcement for the current local attributes, if any are set.
    pub fn local_announcement(&self) -> Option<AwarenessMessage> {
        self.local().map(|attributes| AwarenessMessage::Announce {
            peer_id: self.local_peer_id,
            attributes,
        })
    }

    pub fn leave_message(&self) -> AwarenessMessage {
        AwarenessMessage::Leave {
            peer_id: self.local_peer_id,
        }
    }

    /// Apply a remote presence message. Echoes of our own id are ignored.
    /// Returns whether the table changed.
    pub fn apply(&self, msg: &AwarenessMessage) -> bool {
        if msg.peer_id() == self.local_peer_id {
            return false;
        }
        let changed = {
            let mut inner = self.lock();
            match msg {
                AwarenessMessage::Announce {
                    peer_id,
                    attributes,
                } => inner.remote.insert(*peer_id, attributes.clone()).as_ref() != Some(attributes),
                AwarenessMessage::Leave { peer_id } => inner.remote.remove(peer_id).is_some(),
            }
        };
        if changed {
            self.notify();
        }
        changed
    }

    /// Drop every remote entry, e.g. after the transport disconnected.
    pub fn clear_remote(&self) -> bool {
        let changed = {
            let mut inner = self.lock();
            let had_peers = !inner.remote.is_empty();
            inner.remote.clear();
            had_peers
        };
        if changed {
            self.notify();
        }
        changed
    }

    /// Register a change listener; it receives the full peer list.
    pub fn on_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&[PeerPresence]) + Send + Sync + 'static,
    {
        self.lock().listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.lock().listeners.remove(id)
    }

    /// Remove every listener and remote entry without notifying anyone.
    pub fn dispose(&self) {
        let mut inner = self.lock();
        inner.listeners.clear();
        inner.remote.clear();
    }

    /// Map of peer id to attributes, local peer included once it is set.
    pub fn snapshot(&self) -> PresenceSnapshot {
        let inner = self.lock();
        let mut map = inner.remote.clone();
        if let Some(local) = &inner.local {
            map.insert(self.local_peer_id, local.clone());
        }
        map
    }

    pub fn remote_count(&self) -> usize {
        self.lock().remote.len()
    }

    fn peers_locked(&self, inner: &Inner) -> Vec<PeerPresence> {
        let mut peers: Vec<PeerPresence> = inner
            .remote
            .iter()
            .map(|(peer_id, attributes)| PeerPresence {
                peer_id: *peer_id,
                attributes: attributes.clone(),
                is_local: false,
            })
            .collect();
        if let Some(local) = &inner.local {
            peers.push(PeerPresence {
                peer_id: self.local_peer_id,
                attributes: local.clone(),
                is_local: true,
            });
        }
        peers
    }

    fn notify(&self) {
        let (callbacks, peers) = {
            let inner = self.lock();
            (inner.listeners.snapshot(), self.peers_locked(&inner))
        };
        emit(&callbacks, peers.as_slice());
    }
}

impl std::fmt::Debug for PresenceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceTable")
            .field("local_peer_id", &self.local_peer_id)
            .field("peers", &self.snapshot())
            .finish()
    }
}
