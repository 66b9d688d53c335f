//! # hybrid-manager
//!
//! A connection manager that gives every peer link two transports: a TCP
//! stream for ordered, reliable traffic and a UDP path for low-latency
//! traffic.  The UDP path is probed continuously; [`NetworkManager::send`]
//! uses it only while probes succeed and falls back to TCP otherwise.
//!
//! Applications plug in through the [`Handler`] trait: each handler owns a
//! greeting (the first frame of every TCP connection it serves) and a closed
//! message vocabulary.
//!
//! ```no_run
//! use std::sync::Arc;
//! use hybrid_manager::{EchoHandler, EchoMessage, NetworkManager};
//!
//! # async fn demo() -> Result<(), hybrid_manager::ManagerError> {
//! let net = NetworkManager::listen(Some(9000), 9001).await?;
//! let echo = Arc::new(EchoHandler::new("echo"));
//! net.add_handler(Arc::clone(&echo))?;
//!
//! let id = net.connect(echo, "192.0.2.10:9000".parse().unwrap())?;
//! // ... once `connection_complete(id)` has fired:
//! net.send(id, &EchoMessage::Text("hello".into()))?;
//! # Ok(())
//! # }
//! ```
//!
//! # Crate layout
//!
//! ```text
//! hybrid-manager
//! ├── application/       handler contract, registry, reference echo handler
//! └── infrastructure/
//!     ├── network/       NetworkManager, stream transport, UDP socket
//!     └── storage/       TOML node configuration
//! ```

pub mod application;
pub mod error;
pub mod infrastructure;

pub use application::echo::{EchoEvent, EchoHandler, EchoMessage, Probe};
pub use application::handler::Handler;
pub use error::ManagerError;
pub use infrastructure::network::{ListenConfig, NetworkManager, DEFAULT_CONNECT_TIMEOUT};
pub use infrastructure::storage::config::{ConfigError, NodeConfig};
