//! Domain layer: pure logic with no I/O.
//!
//! - **`connection_id`** – The 32-bit [`ConnectionId`](connection_id::ConnectionId)
//!   handle and the wrapping linear-scan allocator that hands them out.
//! - **`reliability`** – The per-connection UDP reliability-check state
//!   machine: ping counter, failure backoff and the verified flag.

pub mod connection_id;
pub mod reliability;
