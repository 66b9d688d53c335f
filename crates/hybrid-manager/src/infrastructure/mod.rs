//! Infrastructure layer: sockets, background tasks and persistence.

pub mod network;
pub mod storage;
