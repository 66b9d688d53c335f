//! Error type shared by the registry and the network manager.

use std::net::SocketAddr;

use hybrid_core::{ConnectionId, InvalidReliabilityConfig, ProtocolError};
use thiserror::Error;

/// Errors surfaced synchronously by [`NetworkManager`](crate::NetworkManager).
///
/// Transport failures on an individual connection are never returned here;
/// they reach the owning handler through `connection_failed` or
/// `connection_lost`.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// A listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The reliability timings would panic or stall the check timers.
    #[error("invalid reliability settings: {0}")]
    InvalidReliability(#[from] InvalidReliabilityConfig),

    /// Another handler already owns this greeting.
    #[error("a handler with greeting {0:?} is already registered")]
    DuplicateHandler(String),

    /// The handler passed to `remove_handler` is not registered.
    #[error("no handler with greeting {0:?} is registered")]
    UnknownHandler(String),

    /// No connection or pending attempt has this id.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    /// The id belongs to an attempt whose handshake has not completed.
    #[error("connection {0} is not established yet")]
    NotEstablished(ConnectionId),

    /// The peer has not announced its UDP port and id yet.
    #[error("UDP info for connection {0} is not available")]
    UdpInfoUnavailable(ConnectionId),

    /// Every connection id is in use.
    #[error("connection id space exhausted")]
    IdSpaceExhausted,

    /// The message type is not the vocabulary of the connection's handler.
    #[error("connection {id} speaks {expected}, not {actual}")]
    VocabularyMismatch {
        id: ConnectionId,
        expected: &'static str,
        actual: &'static str,
    },

    /// The connection's writer has already shut down.
    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    /// The message could not be encoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Socket-level I/O error outside any single connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<hybrid_core::AllocError> for ManagerError {
    fn from(_: hybrid_core::AllocError) -> Self {
        ManagerError::IdSpaceExhausted
    }
}
