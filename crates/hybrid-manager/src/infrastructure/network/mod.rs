//! Network infrastructure.
//!
//! # Sub-modules
//!
//! - **`manager`** – [`NetworkManager`]: listening, handshakes, dispatch, the
//!   UDP reliability check and the send API.
//! - **`connection`** – per-connection state, the writer task and the async
//!   [`FrameReader`].
//! - **`udp`** – UDP bind with ephemeral-port fallback and the receive loop.

pub mod connection;
pub mod manager;
pub(crate) mod udp;

pub use connection::FrameReader;
pub use manager::{ListenConfig, NetworkManager, DEFAULT_CONNECT_TIMEOUT};
