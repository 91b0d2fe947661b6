//! Collaboration sessions.
//!
//! ```text
//!   Session (caller handle)        mpsc / watch         driver task
//!   ┌───────────────────────┐   ─────────────────►   ┌──────────────────────────┐
//!   │ .wait_for_sync()      │      Command           │ ConnectionStateMachine   │
//!   │ .replica()            │                        │ SyncCoordinator          │
//!   │ .set_local_presence() │   ◄─────────────────   │ TransportSession         │
//!   │ .destroy()            │   SessionEvent,        │ OfflineQueue             │
//!   └───────────────────────┘   status, outcome      └──────────────────────────┘
//! ```
//!
//! Each session runs one driver task that owns every piece of mutable
//! session state and handles one input at a time: transport frames, caller
//! commands, the sync fallback timer, the reconnect timer and local replica
//! updates. Nothing else mutates that state, so no transition can be
//! observed half-applied.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Sleep;
use uuid::Uuid;

use crate::config::CollabConfig;
use crate::denial::AccessDenialCache;
use crate::error::{CollabError, CollabResult, TransportError};
use crate::listeners::ListenerId;
use crate::presence::{PeerPresence, PresenceAttributes, PresenceSnapshot, PresenceTable};
use crate::protocol::{
    ErrorCode, MessageType, SyncMessage, CLOSE_ACCESS_REVOKED, CLOSE_NORMAL,
};
use crate::replica::{ChangeOrigin, ReplicaHandle};
use crate::state::{is_no_retry_close_code, ConnectionStateMachine, ConnectionStatus, RetryDecision};
use crate::sync::{FirstSync, RestSnapshot, SyncCoordinator, SyncOutcome};
use crate::transport::{
    ControlSignal, Connector, Inbound, Link, TransportEvent, TransportSession, WsConnector,
};

/// Notifications for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StatusChanged {
        doc_id: String,
        status: ConnectionStatus,
    },
    PresenceChanged {
        peers: Vec<PeerPresence>,
    },
    /// The one-shot sync outcome was resolved.
    SyncResolved(SyncOutcome),
    /// The replica finished syncing after the fallback timer fired; stop
    /// showing REST content and switch to the replica.
    ReplicaCaughtUp,
    /// Access denied or rate limited. The session will not sync again.
    CollabError { code: ErrorCode, message: String },
    /// Access was withdrawn; the caller should close the page.
    PageAccessRevoked { message: String },
    /// Advisory: links on this page changed.
    LinksUpdated { doc_id: String },
}

/// Teardown steps, in the order [`Session::destroy`] performs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    /// Tell peers we are leaving.
    UnloadHook,
    /// Drop remote presence and every presence/state listener.
    Presence,
    /// Close the transport normally and cancel timers.
    Transport,
    /// Dispose the replica.
    Replica,
}

/// Per-open options.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// REST snapshot used to seed an empty replica.
    pub snapshot: Option<RestSnapshot>,
    /// Local presence announced once connected.
    pub presence: Option<PresenceAttributes>,
    /// Overrides the configured sync fallback timer.
    pub sync_timeout: Option<Duration>,
}

impl OpenOptions {
    pub fn with_snapshot(mut self, snapshot: RestSnapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn with_presence(mut self, presence: PresenceAttributes) -> Self {
        self.presence = Some(presence);
        self
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = Some(timeout);
        self
    }
}

/// Shared state for every session opened by one client: configuration and
/// the access-denial cache.
#[derive(Debug, Clone, Default)]
pub struct CollabContext {
    config: CollabConfig,
    denials: AccessDenialCache,
}

impl CollabContext {
    pub fn new(config: CollabConfig) -> Self {
        Self {
            config,
            denials: AccessDenialCache::new(),
        }
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    pub fn denials(&self) -> &AccessDenialCache {
        &self.denials
    }

    /// Open a session over WebSocket using the configured server URL.
    pub fn open_ws(&self, doc_id: impl Into<String>, options: OpenOptions) -> Session {
        self.open(doc_id, options, WsConnector::new(self.config.clone()))
    }

    /// Open a session for `doc_id`.
    ///
    /// Documents in the denial cache get a session that is `denied` from
    /// the start; `connector` is never called for them. Must be called from
    /// within a tokio runtime.
    pub fn open<C: Connector>(
        &self,
        doc_id: impl Into<String>,
        options: OpenOptions,
        connector: C,
    ) -> Session {
        let doc_id = doc_id.into();
        let peer_id = Uuid::new_v4();

        if self.denials.is_denied(&doc_id) {
            log::info!("Doc {doc_id} is in the denial cache; not connecting");
            return Session::denied(doc_id, peer_id, options.presence);
        }

        let replica = ReplicaHandle::new();
        let presence = PresenceTable::new(peer_id);
        if let Some(attributes) = options.presence.clone() {
            presence.set_local(attributes);
        }

        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (local_tx, local_rx) = mpsc::unbounded_channel();

        let mut machine = ConnectionStateMachine::new(doc_id.clone(), self.config.denial_threshold);
        let events = event_tx.clone();
        machine.subscribe(move |change| {
            status_tx.send_replace(change.status);
            let _ = events.send(SessionEvent::StatusChanged {
                doc_id: change.doc_id.clone(),
                status: change.status,
            });
        });

        let events = event_tx.clone();
        let presence_listener = presence.on_change(move |peers| {
            let _ = events.send(SessionEvent::PresenceChanged {
                peers: peers.to_vec(),
            });
        });

        let replica_listener = replica.subscribe(move |change| {
            if change.origin == ChangeOrigin::Local {
                let _ = local_tx.send(change.update.clone());
            }
        });

        let timeout = options.sync_timeout.unwrap_or_else(|| self.config.sync_timeout());
        let driver = Driver {
            doc_id: doc_id.clone(),
            peer_id,
            config: self.config.clone(),
            denials: self.denials.clone(),
            connector,
            machine,
            coordinator: SyncCoordinator::new(options.snapshot, timeout),
            replica: replica.clone(),
            presence: presence.clone(),
            transport: TransportSession::new(doc_id.clone(), peer_id),
            offline: OfflineQueue::new(self.config.offline_queue_capacity),
            events: event_tx,
            outcome_tx,
            commands: command_rx,
            local_updates: local_rx,
            replica_listener,
            presence_listener,
            phase: Phase::Stopped,
        };
        tokio::spawn(driver.run());

        log::info!("Opened collaboration session for doc {doc_id} as peer {peer_id}");
        Session {
            doc_id,
            peer_id,
            replica,
            presence,
            status: status_rx,
            outcome: outcome_rx,
            events: Some(event_rx),
            commands: Some(command_tx),
            destroyed: false,
        }
    }
}

enum Command {
    SetPresence(PresenceAttributes),
    Destroy {
        reply: oneshot::Sender<Vec<TeardownStep>>,
    },
}

/// Caller handle for one open document.
///
/// Must be ended with [`destroy`](Self::destroy). Dropping the handle
/// without it still tears the session down, but only once the driver
/// notices, and the teardown report is lost.
pub struct Session {
    doc_id: String,
    peer_id: Uuid,
    replica: ReplicaHandle,
    presence: PresenceTable,
    status: watch::Receiver<ConnectionStatus>,
    outcome: watch::Receiver<Option<SyncOutcome>>,
    events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    commands: Option<mpsc::UnboundedSender<Command>>,
    destroyed: bool,
}

impl Session {
    /// Session for a document that is already known to be inaccessible.
    fn denied(doc_id: String, peer_id: Uuid, local: Option<PresenceAttributes>) -> Self {
        let presence = PresenceTable::new(peer_id);
        if let Some(attributes) = local {
            presence.set_local(attributes);
        }
        let (_, status) = watch::channel(ConnectionStatus::Denied);
        let (_, outcome) = watch::channel(Some(SyncOutcome::denied()));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let _ = event_tx.send(SessionEvent::SyncResolved(SyncOutcome::denied()));
        Self {
            doc_id,
            peer_id,
            replica: ReplicaHandle::new(),
            presence,
            status,
            outcome,
            events: Some(event_rx),
            commands: None,
            destroyed: false,
        }
    }

    /// Document this session is bound to.
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Our connection id, the key peers see us under.
    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Watch channel for the connection status.
    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events.take()
    }

    /// The sync outcome, if resolved.
    pub fn sync_outcome(&self) -> Option<SyncOutcome> {
        *self.outcome.borrow()
    }

    /// Wait for the one-shot sync outcome. `None` only if the session was
    /// torn down before it resolved.
    pub async fn wait_for_sync(&self) -> Option<SyncOutcome> {
        let mut rx = self.outcome.clone();
        if let Ok(outcome) = rx.wait_for(Option::is_some).await.map(|value| *value) {
            return outcome;
        }
        // Driver gone; report whatever it last published.
        let last = *rx.borrow();
        last
    }

    /// The replica, once the sync outcome is resolved. Before that the
    /// reconciliation insert may still be pending, so reads are refused.
    pub fn replica(&self) -> Option<&ReplicaHandle> {
        if self.destroyed || self.sync_outcome().is_none() {
            return None;
        }
        Some(&self.replica)
    }

    /// Current presence, local peer included.
    pub fn presence(&self) -> PresenceSnapshot {
        self.presence.snapshot()
    }

    /// Update our presence attributes and broadcast them.
    pub fn set_local_presence(&self, attributes: PresenceAttributes) -> CollabResult<()> {
        if self.destroyed {
            return Err(CollabError::SessionClosed);
        }
        match &self.commands {
            Some(commands) => commands
                .send(Command::SetPresence(attributes))
                .map_err(|_| CollabError::SessionClosed),
            None => {
                self.presence.set_local(attributes);
                Ok(())
            }
        }
    }

    /// Whether [`destroy`](Self::destroy) has been called.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Tear the session down. Safe to call more than once; later calls do
    /// nothing and return an empty list.
    pub async fn destroy(&mut self) -> Vec<TeardownStep> {
        if self.destroyed {
            return Vec::new();
        }
        self.destroyed = true;

        if let Some(commands) = self.commands.take() {
            let (reply, rx) = oneshot::channel();
            if commands.send(Command::Destroy { reply }).is_ok() {
                if let Ok(steps) = rx.await {
                    return steps;
                }
            }
        }

        // No driver: nothing connected, release local state only.
        self.presence.dispose();
        self.replica.dispose();
        log::info!("Destroyed session for doc {}", self.doc_id);
        vec![TeardownStep::Presence, TeardownStep::Replica]
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("doc_id", &self.doc_id)
            .field("peer_id", &self.peer_id)
            .field("status", &self.status())
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

/// Local updates buffered while disconnected, replayed on reconnect.
pub struct OfflineQueue {
    queue: VecDeque<Arc<Vec<u8>>>,
    max_size: usize,
}

impl OfflineQueue {
    /// Create a queue holding at most `max_size` updates.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Returns false (and drops the update) when full.
    pub fn enqueue(&mut self, update: Arc<Vec<u8>>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(update);
        true
    }

    /// Take all queued updates in order, for replay.
    pub fn drain(&mut self) -> Vec<Arc<Vec<u8>>> {
        self.queue.drain(..).collect()
    }

    /// Number of pending updates.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Discard every pending update (after a denial or on teardown).
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

enum Phase {
    Connecting(BoxFuture<'static, Result<Link, TransportError>>),
    Live,
    Backoff(Pin<Box<Sleep>>),
    Stopped,
}

enum Step {
    Connect(Result<Link, TransportError>),
    Transport(Option<TransportEvent>),
    RetryDue,
    SyncTimeout,
    Command(Option<Command>),
    LocalUpdate(Arc<Vec<u8>>),
}

/// Why a session was denied.
enum Denial {
    Control { code: ErrorCode, message: String },
    Revoked { message: String },
    CloseCode(u16),
    RepeatedFailures(u32),
}

struct Driver<C: Connector> {
    doc_id: String,
    peer_id: Uuid,
    config: CollabConfig,
    denials: AccessDenialCache,
    connector: C,
    machine: ConnectionStateMachine,
    coordinator: SyncCoordinator,
    replica: ReplicaHandle,
    presence: PresenceTable,
    transport: TransportSession,
    offline: OfflineQueue,
    events: mpsc::UnboundedSender<SessionEvent>,
    outcome_tx: watch::Sender<Option<SyncOutcome>>,
    commands: mpsc::UnboundedReceiver<Command>,
    local_updates: mpsc::UnboundedReceiver<Arc<Vec<u8>>>,
    replica_listener: ListenerId,
    presence_listener: ListenerId,
    phase: Phase,
}

impl<C: Connector> Driver<C> {
    async fn run(mut self) {
        self.start_connect();
        loop {
            match self.next_step().await {
                Step::Connect(Ok(link)) => self.on_link(link),
                Step::Connect(Err(e)) => self.on_connect_error(e),
                Step::Transport(Some(event)) => self.on_transport_event(event),
                Step::Transport(None) => self.on_closed(None, "link dropped"),
                Step::RetryDue => self.on_retry_due(),
                Step::SyncTimeout => self.on_sync_timeout(),
                Step::LocalUpdate(update) => self.publish_local(update),
                Step::Command(Some(Command::SetPresence(attributes))) => {
                    self.set_local_presence(attributes)
                }
                Step::Command(Some(Command::Destroy { reply })) => {
                    let steps = self.teardown();
                    let _ = reply.send(steps);
                    return;
                }
                Step::Command(None) => {
                    log::warn!("Session for doc {} dropped without destroy()", self.doc_id);
                    self.teardown();
                    return;
                }
            }
        }
    }

    async fn next_step(&mut self) -> Step {
        let deadline = self.coordinator.deadline();
        let timer_armed = self.coordinator.is_pending();
        match &mut self.phase {
            Phase::Connecting(connect) => tokio::select! {
                biased;
                cmd = self.commands.recv() => Step::Command(cmd),
                result = connect => Step::Connect(result),
                Some(update) = self.local_updates.recv() => Step::LocalUpdate(update),
                _ = tokio::time::sleep_until(deadline), if timer_armed => Step::SyncTimeout,
            },
            Phase::Live => tokio::select! {
                biased;
                cmd = self.commands.recv() => Step::Command(cmd),
                event = self.transport.recv() => Step::Transport(event),
                Some(update) = self.local_updates.recv() => Step::LocalUpdate(update),
                _ = tokio::time::sleep_until(deadline), if timer_armed => Step::SyncTimeout,
            },
            Phase::Backoff(sleep) => tokio::select! {
                biased;
                cmd = self.commands.recv() => Step::Command(cmd),
                _ = sleep.as_mut() => Step::RetryDue,
                Some(update) = self.local_updates.recv() => Step::LocalUpdate(update),
                _ = tokio::time::sleep_until(deadline), if timer_armed => Step::SyncTimeout,
            },
            Phase::Stopped => tokio::select! {
                biased;
                cmd = self.commands.recv() => Step::Command(cmd),
                Some(update) = self.local_updates.recv() => Step::LocalUpdate(update),
                _ = tokio::time::sleep_until(deadline), if timer_armed => Step::SyncTimeout,
            },
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn start_connect(&mut self) {
        self.phase = Phase::Connecting(self.connector.connect(&self.doc_id));
    }

    fn on_link(&mut self, link: Link) {
        self.transport.attach(link);
        self.machine.on_connected();
        self.phase = Phase::Live;

        if let Some(announce) = self.presence.local_announcement() {
            self.send_awareness(&announce);
        }
        let step1 = SyncMessage::sync_step1(self.peer_id, &self.doc_id, self.replica.state_vector());
        self.transport.send(&step1);

        let queued = self.offline.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued updates for doc {}", queued.len(), self.doc_id);
            for update in queued {
                let msg = SyncMessage::update(self.peer_id, &self.doc_id, update.to_vec());
                self.transport.send(&msg);
            }
        }
    }

    fn on_connect_error(&mut self, err: TransportError) {
        if err.is_fatal() {
            log::error!("Doc {}: {err}; giving up", self.doc_id);
            self.machine.on_fatal();
            self.phase = Phase::Stopped;
            return;
        }
        log::debug!("Doc {}: {err}", self.doc_id);
        let decision = self.machine.on_failure();
        self.apply_retry_decision(decision, None);
    }

    fn on_closed(&mut self, code: Option<u16>, reason: &str) {
        log::debug!(
            "Doc {}: transport closed ({code:?}: {reason}), dropping {} remote peers",
            self.doc_id,
            self.presence.remote_count()
        );
        self.transport.detach();
        self.presence.clear_remote();
        let decision = self.machine.on_closed(code);
        self.apply_retry_decision(decision, code);
    }

    fn apply_retry_decision(&mut self, decision: RetryDecision, close_code: Option<u16>) {
        match decision {
            RetryDecision::Retry { attempt } => {
                let delay = self.config.reconnect_delay(attempt);
                log::debug!(
                    "Doc {}: reconnect attempt {attempt} in {delay:?}",
                    self.doc_id
                );
                self.phase = Phase::Backoff(Box::pin(tokio::time::sleep(delay)));
            }
            RetryDecision::Deny => {
                let denial = match close_code.filter(|c| is_no_retry_close_code(*c)) {
                    Some(code) => Denial::CloseCode(code),
                    None => Denial::RepeatedFailures(self.machine.failures()),
                };
                self.deny(denial);
            }
        }
    }

    fn on_retry_due(&mut self) {
        self.machine.on_retry();
        self.start_connect();
    }

    fn on_sync_timeout(&mut self) {
        if let Some(outcome) = self.coordinator.on_timeout() {
            log::info!(
                "Doc {}: no sync within timeout, caller shows REST content",
                self.doc_id
            );
            self.machine.on_sync_timeout();
            self.publish_outcome(outcome);
        }
    }

    fn publish_outcome(&self, outcome: SyncOutcome) {
        self.outcome_tx.send_replace(Some(outcome));
        self.emit(SessionEvent::SyncResolved(outcome));
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match self.transport.demux(event) {
            Inbound::Replica(msg) => self.on_sync_message(msg),
            Inbound::Control(signal) => self.on_control(signal),
            Inbound::Closed { code, reason } => self.on_closed(code, &reason),
            Inbound::Ignored => {}
        }
    }

    fn on_sync_message(&mut self, msg: SyncMessage) {
        match msg.msg_type {
            MessageType::SyncStep2 => {
                if let Err(e) = self.replica.apply_remote(&msg.payload) {
                    log::warn!("Doc {}: dropping bad sync payload: {e}", self.doc_id);
                    return;
                }
                match self.coordinator.on_first_sync(&self.replica) {
                    FirstSync::Resolved(outcome) => {
                        self.machine.on_synced();
                        log::info!("Doc {}: first sync complete ({outcome:?})", self.doc_id);
                        self.publish_outcome(outcome);
                    }
                    FirstSync::Late => {
                        self.machine.on_synced();
                        log::info!("Doc {}: replica caught up after timeout", self.doc_id);
                        self.emit(SessionEvent::ReplicaCaughtUp);
                    }
                    FirstSync::Ignored => {
                        self.machine.on_synced();
                    }
                }
            }
            MessageType::SyncStep1 => match self.replica.diff_since(&msg.payload) {
                Ok(diff) => {
                    let reply = SyncMessage::update(self.peer_id, &self.doc_id, diff);
                    self.transport.send(&reply);
                }
                Err(e) => log::debug!("Doc {}: bad state vector: {e}", self.doc_id),
            },
            MessageType::Update => {
                if let Err(e) = self.replica.apply_remote(&msg.payload) {
                    log::warn!("Doc {}: dropping bad update: {e}", self.doc_id);
                }
            }
            MessageType::Awareness => match msg.awareness_message() {
                Ok(awareness) => {
                    self.presence.apply(&awareness);
                }
                Err(e) => log::debug!("Doc {}: bad awareness payload: {e}", self.doc_id),
            },
        }
    }

    fn on_control(&mut self, signal: ControlSignal) {
        match signal {
            ControlSignal::Denied { code, message } => self.deny(Denial::Control { code, message }),
            ControlSignal::Revoked { message } => self.deny(Denial::Revoked { message }),
            ControlSignal::LinksUpdated { doc_id } => {
                self.emit(SessionEvent::LinksUpdated { doc_id });
            }
            ControlSignal::Notice { code, message } => {
                log::warn!("Doc {}: server error {code}: {message}", self.doc_id);
            }
        }
    }

    /// Fatal for the session: cache the denial, resolve a pending sync as
    /// denied, move to `denied`, stop the transport and tell the caller.
    fn deny(&mut self, denial: Denial) {
        self.denials.mark_denied(&self.doc_id);
        if let Some(outcome) = self.coordinator.on_denied() {
            self.publish_outcome(outcome);
        }
        self.machine.force_denied();
        self.transport.close(CLOSE_NORMAL, "access denied");
        self.presence.clear_remote();
        self.offline.clear();
        self.phase = Phase::Stopped;

        match denial {
            Denial::Control { code, message } => {
                log::warn!("Doc {}: server denied access ({code})", self.doc_id);
                self.emit(SessionEvent::CollabError { code, message });
            }
            Denial::Revoked { message } => {
                log::warn!("Doc {}: access revoked", self.doc_id);
                self.emit(SessionEvent::PageAccessRevoked { message });
            }
            Denial::CloseCode(CLOSE_ACCESS_REVOKED) => {
                log::warn!("Doc {}: closed as revoked", self.doc_id);
                self.emit(SessionEvent::PageAccessRevoked {
                    message: "Your access to this page has been revoked".to_string(),
                });
            }
            Denial::CloseCode(code) => {
                log::warn!("Doc {}: closed with code {code}", self.doc_id);
                self.emit(SessionEvent::CollabError {
                    code: ErrorCode::AccessDenied,
                    message: "You do not have access to this page".to_string(),
                });
            }
            Denial::RepeatedFailures(failures) => {
                log::warn!(
                    "Doc {}: denied after {failures} failed connection attempts",
                    self.doc_id
                );
                self.emit(SessionEvent::CollabError {
                    code: ErrorCode::AccessDenied,
                    message: "Unable to connect to this page".to_string(),
                });
            }
        }
    }

    fn publish_local(&mut self, update: Arc<Vec<u8>>) {
        if self.machine.status() == ConnectionStatus::Denied {
            return;
        }
        if self.transport.is_open() {
            let msg = SyncMessage::update(self.peer_id, &self.doc_id, update.to_vec());
            if self.transport.send(&msg) {
                return;
            }
        }
        if !self.offline.enqueue(update) {
            log::warn!(
                "Doc {}: offline queue full, dropping local update",
                self.doc_id
            );
        }
    }

    fn set_local_presence(&mut self, attributes: PresenceAttributes) {
        let announce = self.presence.set_local(attributes);
        if self.transport.is_open() {
            self.send_awareness(&announce);
        }
    }

    fn send_awareness(&self, message: &crate::presence::AwarenessMessage) {
        match SyncMessage::awareness(self.peer_id, &self.doc_id, message) {
            Ok(msg) => {
                self.transport.send(&msg);
            }
            Err(e) => log::error!("Doc {}: failed to encode presence: {e}", self.doc_id),
        }
    }

    /// Release everything in dependency order. The driver exits afterwards,
    /// which also drops the sync and reconnect timers.
    fn teardown(&mut self) -> Vec<TeardownStep> {
        let mut steps = Vec::with_capacity(4);

        if self.transport.is_open() {
            self.send_awareness(&self.presence.leave_message());
        }
        steps.push(TeardownStep::UnloadHook);

        self.presence.remove_listener(self.presence_listener);
        self.presence.dispose();
        self.machine.clear_listeners();
        steps.push(TeardownStep::Presence);

        self.transport.close(CLOSE_NORMAL, "navigation");
        self.phase = Phase::Stopped;
        self.offline.clear();
        steps.push(TeardownStep::Transport);

        self.replica.unsubscribe(self.replica_listener);
        self.replica.dispose();
        steps.push(TeardownStep::Replica);

        log::info!("Destroyed session for doc {}", self.doc_id);
        steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_queue() {
        let mut queue = OfflineQueue::new(100);
        assert!(queue.is_empty());

        queue.enqueue(Arc::new(vec![1, 2, 3]));
        queue.enqueue(Arc::new(vec![4, 5, 6, 7]));
        assert_eq!(queue.len(), 2);

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(*drained[0], vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offline_queue_capacity() {
        let mut queue = OfflineQueue::new(2);
        assert!(queue.enqueue(Arc::new(vec![1])));
        assert!(queue.enqueue(Arc::new(vec![2])));
        assert!(!queue.enqueue(Arc::new(vec![3])));
        assert_eq!(queue.len(), 2);

        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_open_options_builder() {
        let options = OpenOptions::default()
            .with_snapshot(RestSnapshot::new("X"))
            .with_sync_timeout(Duration::from_millis(2000));
        assert_eq!(options.snapshot.unwrap().content, "X");
        assert_eq!(options.sync_timeout, Some(Duration::from_secs(2)));
        assert!(options.presence.is_none());
    }

    #[tokio::test]
    async fn test_denied_from_cache_session() {
        let ctx = CollabContext::new(CollabConfig::default());
        ctx.denials().mark_denied("abc");

        let mut session = ctx.open_ws("abc", OpenOptions::default());
        assert_eq!(session.status(), ConnectionStatus::Denied);
        assert_eq!(session.wait_for_sync().await, Some(SyncOutcome::denied()));

        let mut events = session.take_event_rx().unwrap();
        assert_eq!(
            events.recv().await,
            Some(SessionEvent::SyncResolved(SyncOutcome::denied()))
        );
        assert!(session.set_local_presence(PresenceAttributes::new("Me", "#000000")).is_ok());

        assert_eq!(
            session.destroy().await,
            vec![TeardownStep::Presence, TeardownStep::Replica]
        );
        assert!(session.destroy().await.is_empty());
        assert!(session.replica().is_none());
    }
}
