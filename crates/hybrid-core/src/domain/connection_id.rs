//! Connection identifiers and their allocator.
//!
//! # Allocation scheme
//!
//! The allocator remembers the last id it handed out and scans forward from
//! there, wrapping at `u32::MAX`, until it finds an id the caller reports as
//! free.  Because ids are only reused after the scan has walked past every
//! live one, the cost of an allocation is bounded by the number of live
//! connections rather than by the size of the id space.  Allocation fails
//! only if the scan comes all the way back to where it started.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Number of distinct connection ids.
const ID_SPACE: u64 = 1 << 32;

/// Manager-local handle identifying one logical peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(u32);

impl ConnectionId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw 32-bit value as it appears on the wire.
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u32> for ConnectionId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

/// Error returned when no connection id is free.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("all connection ids are in use")]
    Overflow,
}

/// Wrapping linear-scan allocator for [`ConnectionId`]s.
///
/// The allocator does not own the set of live ids; the caller passes a
/// predicate so the scan and the registry lookup happen under the same lock.
#[derive(Debug, Default)]
pub struct IdAllocator {
    last_id: u32,
}

impl IdAllocator {
    /// Creates an allocator whose first id will be `1`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an allocator that resumes scanning after `last_id`.
    pub fn resuming_after(last_id: ConnectionId) -> Self {
        Self { last_id: last_id.0 }
    }

    /// The most recently allocated id.
    pub fn last_id(&self) -> ConnectionId {
        ConnectionId(self.last_id)
    }

    /// Allocates the first id after the last one that `in_use` reports free.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::Overflow`] when every one of the 2^32 ids is in use.
    pub fn allocate(
        &mut self,
        in_use: impl Fn(ConnectionId) -> bool,
    ) -> Result<ConnectionId, AllocError> {
        self.scan(ID_SPACE, in_use)
    }

    fn scan(
        &mut self,
        probes: u64,
        in_use: impl Fn(ConnectionId) -> bool,
    ) -> Result<ConnectionId, AllocError> {
        let mut candidate = self.last_id;
        for _ in 0..probes {
            candidate = candidate.wrapping_add(1);
            if candidate == 0 {
                debug!("connection id space wrapped");
            }
            if !in_use(ConnectionId(candidate)) {
                self.last_id = candidate;
                return Ok(ConnectionId(candidate));
            }
        }
        Err(AllocError::Overflow)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
