//! Application layer: the contract collaborators implement and the
//! bookkeeping the manager keeps about them.
//!
//! - **`handler`** – the [`Handler`](handler::Handler) trait and the
//!   type-erased adapter that lets handlers with different vocabularies share
//!   one manager.
//! - **`registry`** – greeting → handler and id → connection tables plus id
//!   allocation.
//! - **`echo`** – a reference handler used by the `hybrid-node` binary and the
//!   integration tests.

pub mod echo;
pub mod handler;
pub(crate) mod registry;
