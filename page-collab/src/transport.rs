//! Network side of a session: one bidirectional link per document.
//!
//! ```text
//!            Connector::connect(doc_id)
//!                      │
//!                      ▼
//!  ┌──────────────── Link ────────────────┐
//!  │ outgoing: Outbound ──► writer task ──┼──► WebSocket
//!  │ incoming: TransportEvent ◄── reader ─┼──◄ WebSocket
//!  └──────────────────────────────────────┘
//!                      │
//!                      ▼
//!  TransportSession::demux()  ──► Inbound::Replica(SyncMessage)
//!                             ──► Inbound::Control(ControlSignal)
//!                             ──► Inbound::Closed { code }
//! ```
//!
//! The [`Connector`] trait is the seam tests use to inject scripted links;
//! [`WsConnector`] is the production implementation over tokio-tungstenite.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

use crate::config::CollabConfig;
use crate::error::TransportError;
use crate::protocol::{ControlMessage, ErrorCode, SyncMessage};

/// Something that happened on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Binary(Vec<u8>),
    Text(String),
    /// The connection ended. `code` is absent when no close frame was seen.
    Closed { code: Option<u16>, reason: String },
}

/// Frames queued for the writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
}

/// An established connection, as seen by the session.
#[derive(Debug)]
pub struct Link {
    outgoing: mpsc::UnboundedSender<Outbound>,
    incoming: mpsc::UnboundedReceiver<TransportEvent>,
}

/// The far end of a [`Link`], held by the code that moves bytes.
#[derive(Debug)]
pub struct LinkPeer {
    /// Feed inbound events to the session.
    pub inbound: mpsc::UnboundedSender<TransportEvent>,
    /// Frames the session wants written.
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
}

impl Link {
    /// A connected link / peer pair.
    pub fn channel() -> (Link, LinkPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Link {
                outgoing: out_tx,
                incoming: in_rx,
            },
            LinkPeer {
                inbound: in_tx,
                outbound: out_rx,
            },
        )
    }
}

/// Opens links for documents.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, doc_id: &str) -> BoxFuture<'static, Result<Link, TransportError>>;
}

/// WebSocket connector: `{server_url}/{doc_id}`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    config: CollabConfig,
}

impl WsConnector {
    pub fn new(config: CollabConfig) -> Self {
        Self { config }
    }
}

impl Connector for WsConnector {
    fn connect(&self, doc_id: &str) -> BoxFuture<'static, Result<Link, TransportError>> {
        let url = self.config.document_url(doc_id);
        Box::pin(async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(classify_connect_error)?;
            log::debug!("WebSocket connected to {url}");

            let (mut ws_writer, mut ws_reader) = ws_stream.split();
            let (link, peer) = Link::channel();
            let LinkPeer {
                inbound,
                mut outbound,
            } = peer;

            // Writer task: forward outgoing frames; ends on Close or when the
            // session drops its link.
            tokio::spawn(async move {
                while let Some(frame) = outbound.recv().await {
                    let result = match frame {
                        Outbound::Binary(data) => ws_writer.send(Message::Binary(data.into())).await,
                        Outbound::Close { code, reason } => {
                            let close = CloseFrame {
                                code: CloseCode::from(code),
                                reason: reason.into(),
                            };
                            let _ = ws_writer.send(Message::Close(Some(close))).await;
                            break;
                        }
                    };
                    if result.is_err() {
                        break;
                    }
                }
                let _ = ws_writer.close().await;
            });

            // Reader task: translate frames into transport events.
            tokio::spawn(async move {
                let mut closed = None;
                while let Some(msg) = ws_reader.next().await {
                    let event = match msg {
                        Ok(Message::Binary(data)) => TransportEvent::Binary(data.into()),
                        Ok(Message::Text(text)) => TransportEvent::Text(text.as_str().to_owned()),
                        Ok(Message::Close(frame)) => {
                            closed = Some(TransportEvent::Closed {
                                code: frame.as_ref().map(|f| u16::from(f.code)),
                                reason: frame.map(|f| f.reason.as_str().to_owned()).unwrap_or_default(),
                            });
                            break;
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            closed = Some(TransportEvent::Closed {
                                code: None,
                                reason: e.to_string(),
                            });
                            break;
                        }
                    };
                    if inbound.send(event).is_err() {
                        return;
                    }
                }
                let _ = inbound.send(closed.unwrap_or(TransportEvent::Closed {
                    code: None,
                    reason: "stream ended".to_string(),
                }));
            });

            Ok(link)
        })
    }
}

fn classify_connect_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Url(e) => TransportError::Fatal(e.to_string()),
        other => TransportError::Connect(other.to_string()),
    }
}

/// A control message reduced to what the session must do about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSignal {
    /// `access_denied` / `rate_limited`: fatal for the session.
    Denied { code: ErrorCode, message: String },
    /// Access withdrawn: fatal, and the caller should close the page.
    Revoked { message: String },
    /// Advisory: the page's links changed.
    LinksUpdated { doc_id: String },
    /// Any other server error; logged only.
    Notice { code: ErrorCode, message: String },
}

/// Demultiplexed inbound traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Replica(SyncMessage),
    Control(ControlSignal),
    Closed { code: Option<u16>, reason: String },
    /// Malformed, foreign or unknown; dropped.
    Ignored,
}

/// Owns the link for one document and classifies its traffic.
#[derive(Debug)]
pub struct TransportSession {
    doc_id: String,
    peer_id: Uuid,
    link: Option<Link>,
}

impl TransportSession {
    pub fn new(doc_id: impl Into<String>, peer_id: Uuid) -> Self {
        Self {
            doc_id: doc_id.into(),
            peer_id,
            link: None,
        }
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn attach(&mut self, link: Link) {
        self.link = Some(link);
    }

    /// Forget the link without sending anything (the remote already closed).
    pub fn detach(&mut self) {
        self.link = None;
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    /// Next inbound event. Pending forever while no link is attached;
    /// `None` means the link's reader went away.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        match self.link.as_mut() {
            Some(link) => link.incoming.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Queue a replica-sync frame. Returns false if there is no usable link.
    pub fn send(&self, msg: &SyncMessage) -> bool {
        let Some(link) = self.link.as_ref() else {
            return false;
        };
        match msg.encode() {
            Ok(bytes) => link.outgoing.send(Outbound::Binary(bytes)).is_ok(),
            Err(e) => {
                log::error!("Failed to encode {:?} frame: {e}", msg.msg_type);
                false
            }
        }
    }

    /// Graceful shutdown with the given close code. Returns false if
    /// already closed.
    pub fn close(&mut self, code: u16, reason: &str) -> bool {
        let Some(link) = self.link.take() else {
            return false;
        };
        log::debug!("Closing transport for doc {} ({code}: {reason})", self.doc_id);
        let _ = link.outgoing.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
        true
    }

    /// Classify one inbound event.
    pub fn demux(&self, event: TransportEvent) -> Inbound {
        match event {
            TransportEvent::Binary(bytes) => match SyncMessage::decode(&bytes) {
                Ok(msg) if msg.doc_id == self.doc_id => Inbound::Replica(msg),
                Ok(msg) => {
                    log::debug!("Dropping frame for foreign doc {}", msg.doc_id);
                    Inbound::Ignored
                }
                Err(e) => {
                    log::debug!("Dropping malformed binary frame: {e}");
                    Inbound::Ignored
                }
            },
            TransportEvent::Text(text) => match ControlMessage::parse(&text) {
                Some(msg) => self.classify_control(msg),
                None => Inbound::Ignored,
            },
            TransportEvent::Closed { code, reason } => Inbound::Closed { code, reason },
        }
    }

    fn classify_control(&self, msg: ControlMessage) -> Inbound {
        let signal = match msg {
            ControlMessage::Error { code, message } => {
                let code = ErrorCode::parse(code.as_deref().unwrap_or("unknown"));
                let message = message.unwrap_or_else(|| default_message(&code).to_string());
                if code.is_fatal() {
                    ControlSignal::Denied { code, message }
                } else {
                    ControlSignal::Notice { code, message }
                }
            }
            ControlMessage::AccessRevoked { message, .. } => ControlSignal::Revoked {
                message: message
                    .unwrap_or_else(|| "Your access to this page has been revoked".to_string()),
            },
            ControlMessage::LinksUpdated { page_id } => ControlSignal::LinksUpdated {
                doc_id: page_id.unwrap_or_else(|| self.doc_id.clone()),
            },
        };
        Inbound::Control(signal)
    }
}

fn default_message(code: &ErrorCode) -> &'static str {
    match code {
        ErrorCode::AccessDenied => "You do not have access to this page",
        ErrorCode::RateLimited => "Too many requests, try again later",
        ErrorCode::Other(_) => "Collaboration server error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageType, CLOSE_NORMAL};

    fn session() -> TransportSession {
        TransportSession::new("abc", Uuid::new_v4())
    }

    #[test]
    fn test_demux_replica_frame() {
        let transport = session();
        let msg = SyncMessage::sync_step2(Uuid::nil(), "abc", vec![1, 2]);
        match transport.demux(TransportEvent::Binary(msg.encode().unwrap())) {
            Inbound::Replica(decoded) => assert_eq!(decoded.msg_type, MessageType::SyncStep2),
            other => panic!("expected replica frame, got {other:?}"),
        }
    }

    #[test]
    fn test_demux_drops_foreign_and_malformed() {
        let transport = session();
        let foreign = SyncMessage::update(Uuid::nil(), "other", vec![1]);
        assert_eq!(
            transport.demux(TransportEvent::Binary(foreign.encode().unwrap())),
            Inbound::Ignored
        );
        assert_eq!(transport.demux(TransportEvent::Binary(vec![0xFF; 3])), Inbound::Ignored);
        assert_eq!(transport.demux(TransportEvent::Text("{{{".into())), Inbound::Ignored);
        assert_eq!(
            transport.demux(TransportEvent::Text(r#"{"type":"cursor"}"#.into())),
            Inbound::Ignored
        );
    }

    #[test]
    fn test_demux_fatal_errors() {
        let transport = session();
        for code in ["access_denied", "rate_limited"] {
            let text = format!(r#"{{"type":"error","code":"{code}","message":"nope"}}"#);
            assert_eq!(
                transport.demux(TransportEvent::Text(text)),
                Inbound::Control(ControlSignal::Denied {
                    code: ErrorCode::parse(code),
                    message: "nope".into(),
                })
            );
        }
    }

    #[test]
    fn test_demux_non_fatal_error_is_notice() {
        let transport = session();
        let inbound =
            transport.demux(TransportEvent::Text(r#"{"type":"error","code":"internal"}"#.into()));
        assert!(matches!(inbound, Inbound::Control(ControlSignal::Notice { .. })));
    }

    #[test]
    fn test_demux_revoked_and_links() {
        let transport = session();
        assert!(matches!(
            transport.demux(TransportEvent::Text(r#"{"type":"access_revoked"}"#.into())),
            Inbound::Control(ControlSignal::Revoked { .. })
        ));
        assert_eq!(
            transport.demux(TransportEvent::Text(r#"{"type":"links_updated"}"#.into())),
            Inbound::Control(ControlSignal::LinksUpdated {
                doc_id: "abc".into()
            })
        );
    }

    #[test]
    fn test_demux_closed() {
        let transport = session();
        assert_eq!(
            transport.demux(TransportEvent::Closed {
                code: Some(4003),
                reason: "denied".into()
            }),
            Inbound::Closed {
                code: Some(4003),
                reason: "denied".into()
            }
        );
    }

    #[test]
    fn test_send_and_close() {
        let mut transport = session();
        let msg = SyncMessage::update(transport.peer_id(), "abc", vec![9]);
        assert!(!transport.send(&msg));

        let (link, mut peer) = Link::channel();
        transport.attach(link);
        assert!(transport.send(&msg));
        assert_eq!(
            peer.outbound.try_recv().unwrap(),
            Outbound::Binary(msg.encode().unwrap())
        );

        assert!(transport.close(CLOSE_NORMAL, "navigation"));
        assert!(!transport.close(CLOSE_NORMAL, "navigation"));
        assert_eq!(
            peer.outbound.try_recv().unwrap(),
            Outbound::Close {
                code: CLOSE_NORMAL,
                reason: "navigation".into()
            }
        );
        assert!(!transport.is_open());
    }
}
