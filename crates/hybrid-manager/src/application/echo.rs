//! A small reference handler: answers pings, logs texts, and optionally
//! reports every callback on a channel.
//!
//! The `hybrid-node` binary uses it to exercise a link end to end, and the
//! integration tests use the event channel to observe the manager.
//!
//! Message fields are packed with `bincode`; the variant itself is carried by
//! the message identifier, so no enum tag appears in the fields.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use hybrid_core::{ConnectionId, MessageVocabulary, ProtocolError};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::application::handler::Handler;
use crate::infrastructure::network::NetworkManager;

// ── Vocabulary ────────────────────────────────────────────────────────────────

/// Round-trip probe carried by `ping` and `pong`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probe {
    pub seq: u64,
    /// Sender's wall-clock time in microseconds since the Unix epoch.
    pub sent_at_us: u64,
}

impl Probe {
    pub fn now(seq: u64) -> Self {
        Self {
            seq,
            sent_at_us: current_timestamp_us(),
        }
    }
}

/// Messages understood by [`EchoHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EchoMessage {
    /// Asks the peer to answer with a `Pong` carrying the same probe.
    Ping(Probe),
    Pong(Probe),
    Text(String),
}

impl MessageVocabulary for EchoMessage {
    fn identifier(&self) -> &'static str {
        match self {
            EchoMessage::Ping(_) => "ping",
            EchoMessage::Pong(_) => "pong",
            EchoMessage::Text(_) => "text",
        }
    }

    fn encode_fields(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let result = match self {
            EchoMessage::Ping(probe) | EchoMessage::Pong(probe) => bincode::serialize_into(&mut *buf, probe),
            EchoMessage::Text(text) => bincode::serialize_into(&mut *buf, text),
        };
        result.map_err(|e| ProtocolError::MalformedPayload(format!("{}: {e}", self.identifier())))
    }

    fn decode_fields(ident: &str, fields: &[u8]) -> Result<Self, ProtocolError> {
        let malformed = |e: bincode::Error| ProtocolError::MalformedPayload(format!("{ident}: {e}"));
        match ident {
            "ping" => Ok(EchoMessage::Ping(bincode::deserialize(fields).map_err(malformed)?)),
            "pong" => Ok(EchoMessage::Pong(bincode::deserialize(fields).map_err(malformed)?)),
            "text" => Ok(EchoMessage::Text(bincode::deserialize(fields).map_err(malformed)?)),
            other => Err(ProtocolError::UnknownIdentifier(other.to_string())),
        }
    }
}

// ── Handler ───────────────────────────────────────────────────────────────────

/// One observed handler callback.
#[derive(Debug, Clone, PartialEq)]
pub enum EchoEvent {
    NewConnection { id: ConnectionId, peer: SocketAddr },
    Complete(ConnectionId),
    Failed(ConnectionId),
    Message { id: ConnectionId, message: EchoMessage },
    BadPayload { id: ConnectionId, len: usize },
    Lost(ConnectionId),
}

/// Handler that answers `Ping` with `Pong` and logs everything else.
pub struct EchoHandler {
    greeting: String,
    events: Option<mpsc::UnboundedSender<EchoEvent>>,
}

impl EchoHandler {
    pub fn new(greeting: impl Into<String>) -> Self {
        Self {
            greeting: greeting.into(),
            events: None,
        }
    }

    /// Creates a handler that also reports each callback on the returned channel.
    pub fn with_events(greeting: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<EchoEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = Self {
            greeting: greeting.into(),
            events: Some(tx),
        };
        (handler, rx)
    }

    fn emit(&self, event: EchoEvent) {
        if let Some(tx) = &self.events {
            // The receiver may be gone; events are best-effort.
            let _ = tx.send(event);
        }
    }
}

impl Handler for EchoHandler {
    type Message = EchoMessage;

    fn greeting(&self) -> &str {
        &self.greeting
    }

    fn new_connection(&self, _net: &NetworkManager, id: ConnectionId, peer: SocketAddr) {
        info!("echo: new connection {id} from {peer}");
        self.emit(EchoEvent::NewConnection { id, peer });
    }

    fn connection_complete(&self, _net: &NetworkManager, id: ConnectionId) {
        info!("echo: connection {id} established");
        self.emit(EchoEvent::Complete(id));
    }

    fn connection_failed(&self, _net: &NetworkManager, id: ConnectionId) {
        warn!("echo: connection {id} failed");
        self.emit(EchoEvent::Failed(id));
    }

    fn receive_message(&self, net: &NetworkManager, id: ConnectionId, message: EchoMessage) {
        match &message {
            EchoMessage::Ping(probe) => {
                if let Err(e) = net.send(id, &EchoMessage::Pong(*probe)) {
                    warn!("echo: could not answer ping {} on {id}: {e}", probe.seq);
                }
            }
            EchoMessage::Pong(probe) => {
                let rtt_us = current_timestamp_us().saturating_sub(probe.sent_at_us);
                debug!(
                    "echo: pong {} on {id}, rtt {:.2} ms, udp verified: {}",
                    probe.seq,
                    rtt_us as f64 / 1000.0,
                    net.get_udp_status(id)
                );
            }
            EchoMessage::Text(text) => info!("echo: {id} says {text:?}"),
        }
        self.emit(EchoEvent::Message { id, message });
    }

    fn receive_bad_string(&self, _net: &NetworkManager, id: ConnectionId, raw: &[u8], error: &ProtocolError) {
        warn!("echo: undecodable payload ({} bytes) on {id}: {error}", raw.len());
        self.emit(EchoEvent::BadPayload { id, len: raw.len() });
    }

    fn connection_lost(&self, _net: &NetworkManager, id: ConnectionId) {
        info!("echo: connection {id} lost");
        self.emit(EchoEvent::Lost(id));
    }
}

/// Returns the current time as microseconds since the Unix epoch.
fn current_timestamp_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
