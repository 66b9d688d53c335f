//! # hybrid-core
//!
//! Shared library for HybridNet containing the wire codec, the reserved
//! control messages, connection identifiers and the UDP reliability state
//! machine.
//!
//! This crate has zero dependencies on sockets or an async runtime; the
//! `hybrid-manager` crate drives everything defined here from its event loop.
//!
//! # Architecture overview (for beginners)
//!
//! HybridNet multiplexes many logical peer connections over one listening TCP
//! port and one UDP socket.  Every connection starts life on TCP; once both
//! sides have exchanged UDP details, a small ping/ack cycle decides whether
//! datagrams actually get through.  While they do, traffic may use UDP; when
//! they stop, traffic silently falls back to TCP.
//!
//! This crate (`hybrid-core`) is the shared foundation.  It defines:
//!
//! - **`protocol`** – How bytes travel over the network.  Stream frames are
//!   `<u32be length><payload>`, datagrams are `<u32be connection id><payload>`,
//!   and every payload starts with a short message identifier.
//!
//! - **`domain`** – Pure logic with no I/O: the [`ConnectionId`] allocator and
//!   the [`UdpReliability`] state machine that decides when to ping, how long
//!   to back off, and whether a link is currently verified.

pub mod domain;
pub mod protocol;

pub use domain::connection_id::{AllocError, ConnectionId, IdAllocator};
pub use domain::reliability::{
    CheckOutcome, InvalidReliabilityConfig, PingPlan, ReliabilityConfig, UdpReliability,
};
pub use protocol::codec::ProtocolError;
pub use protocol::control::{ControlMessage, CONTROL_SENTINEL};
pub use protocol::framing::{decode_datagram, encode_datagram, encode_frame, FrameDecoder};
pub use protocol::vocabulary::{decode_payload, Decoded, MessageVocabulary};
