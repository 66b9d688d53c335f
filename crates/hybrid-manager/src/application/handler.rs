//! The `Handler` contract implemented by collaborators.
//!
//! A handler owns one greeting string and one closed message vocabulary.
//! Every connection is bound to exactly one handler during its handshake;
//! afterwards the manager calls the handler back for lifecycle events and for
//! each decoded application message.
//!
//! Callbacks run on the connection's reader task or the UDP receive task,
//! always after the manager has released its internal lock, so a handler may
//! freely call back into the [`NetworkManager`] (for example to reply with
//! [`NetworkManager::send`]).
//! Messages that arrive over TCP on one connection are delivered in stream
//! order.  Datagrams are dispatched from the UDP receive task, so they may
//! interleave with TCP messages for the same connection and carry no ordering
//! guarantee.  No datagram reaches `receive_message` before `new_connection`
//! or `connection_complete` has returned for that id.  Callbacks for different
//! connections may run concurrently.

use std::any::{Any, TypeId};
use std::net::SocketAddr;
use std::sync::Arc;

use hybrid_core::{decode_payload, ConnectionId, Decoded, MessageVocabulary, ProtocolError};
use tracing::warn;

use crate::infrastructure::network::NetworkManager;

/// Application-side collaborator owning a greeting and a message vocabulary.
///
/// Only [`greeting`](Handler::greeting) and
/// [`receive_message`](Handler::receive_message) are required; every other
/// callback defaults to doing nothing (or, for bad payloads, logging).
pub trait Handler: Send + Sync + 'static {
    /// The closed set of application messages this handler speaks.
    type Message: MessageVocabulary;

    /// Unique first-frame identifier selecting this handler on accept.
    fn greeting(&self) -> &str;

    /// An inbound connection completed its handshake and is bound to this handler.
    fn new_connection(&self, _net: &NetworkManager, _id: ConnectionId, _peer: SocketAddr) {}

    /// An outbound connection started with [`NetworkManager::connect`] is established.
    fn connection_complete(&self, _net: &NetworkManager, _id: ConnectionId) {}

    /// An outbound connection attempt failed or timed out; `id` is free again.
    fn connection_failed(&self, _net: &NetworkManager, _id: ConnectionId) {}

    /// A message from this handler's vocabulary arrived on `id`.
    fn receive_message(&self, net: &NetworkManager, id: ConnectionId, message: Self::Message);

    /// A payload on `id` matched neither a control message nor the vocabulary.
    ///
    /// The connection stays open.
    fn receive_bad_string(
        &self,
        _net: &NetworkManager,
        id: ConnectionId,
        raw: &[u8],
        error: &ProtocolError,
    ) {
        warn!(
            "dropping undecodable payload ({} bytes) on connection {id}: {error}",
            raw.len()
        );
    }

    /// The transport for `id` closed, locally or remotely.
    fn connection_lost(&self, _net: &NetworkManager, _id: ConnectionId) {}
}

// ── Type erasure ──────────────────────────────────────────────────────────────

/// Object-safe view of a [`Handler`] so handlers with different vocabularies
/// can share one registry.
pub(crate) trait ErasedHandler: Send + Sync {
    fn greeting(&self) -> &str;
    fn message_type(&self) -> TypeId;
    fn message_type_name(&self) -> &'static str;
    /// `true` if this wraps the handler whose `Arc` data pointer is `ptr`.
    fn wraps(&self, ptr: *const ()) -> bool;
    fn decode(&self, payload: &[u8]) -> Decoded<Box<dyn Any + Send>>;

    fn new_connection(&self, net: &NetworkManager, id: ConnectionId, peer: SocketAddr);
    fn connection_complete(&self, net: &NetworkManager, id: ConnectionId);
    fn connection_failed(&self, net: &NetworkManager, id: ConnectionId);
    fn receive_message(&self, net: &NetworkManager, id: ConnectionId, message: Box<dyn Any + Send>);
    fn receive_bad_string(
        &self,
        net: &NetworkManager,
        id: ConnectionId,
        raw: &[u8],
        error: &ProtocolError,
    );
    fn connection_lost(&self, net: &NetworkManager, id: ConnectionId);
}

struct HandlerSlot<H>(Arc<H>);

/// Wraps a concrete handler for storage in the registry.
pub(crate) fn erase<H: Handler>(handler: Arc<H>) -> Arc<dyn ErasedHandler> {
    Arc::new(HandlerSlot(handler))
}

/// Data pointer of a handler `Arc`, comparable with [`ErasedHandler::wraps`].
pub(crate) fn handler_ptr<H: Handler>(handler: &Arc<H>) -> *const () {
    Arc::as_ptr(handler) as *const ()
}

impl<H: Handler> ErasedHandler for HandlerSlot<H> {
    fn greeting(&self) -> &str {
        self.0.greeting()
    }

    fn message_type(&self) -> TypeId {
        TypeId::of::<H::Message>()
    }

    fn message_type_name(&self) -> &'static str {
        std::any::type_name::<H::Message>()
    }

    fn wraps(&self, ptr: *const ()) -> bool {
        handler_ptr(&self.0) == ptr
    }

    fn decode(&self, payload: &[u8]) -> Decoded<Box<dyn Any + Send>> {
        decode_payload::<H::Message>(payload).map_application(|m| Box::new(m) as Box<dyn Any + Send>)
    }

    fn new_connection(&self, net: &NetworkManager, id: ConnectionId, peer: SocketAddr) {
        self.0.new_connection(net, id, peer);
    }

    fn connection_complete(&self, net: &NetworkManager, id: ConnectionId) {
        self.0.connection_complete(net, id);
    }

    fn connection_failed(&self, net: &NetworkManager, id: ConnectionId) {
        self.0.connection_failed(net, id);
    }

    fn receive_message(&self, net: &NetworkManager, id: ConnectionId, message: Box<dyn Any + Send>) {
        match message.downcast::<H::Message>() {
            Ok(message) => self.0.receive_message(net, id, *message),
            // decode() only ever boxes H::Message.
            Err(_) => warn!("discarding message of unexpected type on connection {id}"),
        }
    }

    fn receive_bad_string(
        &self,
        net: &NetworkManager,
        id: ConnectionId,
        raw: &[u8],
        error: &ProtocolError,
    ) {
        self.0.receive_bad_string(net, id, raw, error);
    }

    fn connection_lost(&self, net: &NetworkManager, id: ConnectionId) {
        self.0.connection_lost(net, id);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
