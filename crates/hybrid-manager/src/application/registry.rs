//! Connection bookkeeping owned by a single [`NetworkManager`].
//!
//! The registry holds three tables that must change together:
//!
//! - greeting → handler,
//! - id → entry, where an entry is either a pending outbound attempt or an
//!   established connection,
//! - the id allocator's cursor.
//!
//! Ids for pending attempts live in the same map as established ones, so an
//! id handed out by `connect` can never be given to an inbound connection
//! while the attempt is still running.  The registry itself is not
//! synchronised; the manager keeps it behind one mutex so that allocation and
//! insertion are atomic.
//!
//! [`NetworkManager`]: crate::NetworkManager

use std::collections::HashMap;
use std::sync::Arc;

use hybrid_core::{ConnectionId, IdAllocator};

use crate::application::handler::ErasedHandler;
use crate::error::ManagerError;

/// One slot in the id map.
pub(crate) enum Entry<P, C> {
    /// Outbound connect in progress.
    Pending(P),
    /// Handshake complete.
    Established(C),
}

/// Greeting, id and allocation tables for one manager.
pub(crate) struct ConnectionRegistry<P, C> {
    handlers: HashMap<String, Arc<dyn ErasedHandler>>,
    entries: HashMap<ConnectionId, Entry<P, C>>,
    allocator: IdAllocator,
}

impl<P, C> ConnectionRegistry<P, C> {
    pub(crate) fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            entries: HashMap::new(),
            allocator: IdAllocator::new(),
        }
    }

    // ── Handlers ──────────────────────────────────────────────────────────────

    pub(crate) fn add_handler(&mut self, handler: Arc<dyn ErasedHandler>) -> Result<(), ManagerError> {
        let greeting = handler.greeting().to_string();
        if self.handlers.contains_key(&greeting) {
            return Err(ManagerError::DuplicateHandler(greeting));
        }
        self.handlers.insert(greeting, handler);
        Ok(())
    }

    /// Removes the handler registered under `greeting`, provided it is the
    /// same handler instance (`ptr`) the caller registered.
    pub(crate) fn remove_handler(
        &mut self,
        greeting: &str,
        ptr: *const (),
    ) -> Result<Arc<dyn ErasedHandler>, ManagerError> {
        match self.handlers.get(greeting) {
            Some(existing) if existing.wraps(ptr) => {}
            _ => return Err(ManagerError::UnknownHandler(greeting.to_string())),
        }
        self.handlers
            .remove(greeting)
            .ok_or_else(|| ManagerError::UnknownHandler(greeting.to_string()))
    }

    pub(crate) fn handler_for(&self, greeting: &str) -> Option<Arc<dyn ErasedHandler>> {
        self.handlers.get(greeting).cloned()
    }

    // ── Ids and entries ───────────────────────────────────────────────────────

    /// Allocates an id that is neither pending nor established.
    ///
    /// The id is not reserved until an entry is inserted under it.
    pub(crate) fn allocate(&mut self) -> Result<ConnectionId, ManagerError> {
        let entries = &self.entries;
        Ok(self.allocator.allocate(|id| entries.contains_key(&id))?)
    }

    /// Allocates an id and records a pending attempt under it.
    pub(crate) fn reserve(&mut self, pending: P) -> Result<ConnectionId, ManagerError> {
        let id = self.allocate()?;
        self.entries.insert(id, Entry::Pending(pending));
        Ok(id)
    }

    pub(crate) fn pending_mut(&mut self, id: ConnectionId) -> Option<&mut P> {
        match self.entries.get_mut(&id) {
            Some(Entry::Pending(p)) => Some(p),
            _ => None,
        }
    }

    /// Removes `id` only if it is still a pending attempt.
    pub(crate) fn take_pending(&mut self, id: ConnectionId) -> Option<P> {
        match self.entries.remove(&id)? {
            Entry::Pending(p) => Some(p),
            established => {
                self.entries.insert(id, established);
                None
            }
        }
    }

    pub(crate) fn insert_established(&mut self, id: ConnectionId, connection: C) {
        self.entries.insert(id, Entry::Established(connection));
    }

    pub(crate) fn is_established(&self, id: ConnectionId) -> bool {
        matches!(self.entries.get(&id), Some(Entry::Established(_)))
    }

    pub(crate) fn connection(&self, id: ConnectionId) -> Result<&C, ManagerError> {
        match self.entries.get(&id) {
            Some(Entry::Established(c)) => Ok(c),
            Some(Entry::Pending(_)) => Err(ManagerError::NotEstablished(id)),
            None => Err(ManagerError::UnknownConnection(id)),
        }
    }

    pub(crate) fn connection_mut(&mut self, id: ConnectionId) -> Result<&mut C, ManagerError> {
        match self.entries.get_mut(&id) {
            Some(Entry::Established(c)) => Ok(c),
            Some(Entry::Pending(_)) => Err(ManagerError::NotEstablished(id)),
            None => Err(ManagerError::UnknownConnection(id)),
        }
    }

    /// Removes `id` only if it is established.
    pub(crate) fn remove_established(&mut self, id: ConnectionId) -> Option<C> {
        match self.entries.remove(&id)? {
            Entry::Established(c) => Some(c),
            pending => {
                self.entries.insert(id, pending);
                None
            }
        }
    }

    /// Established ids in ascending order.
    pub(crate) fn established_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, e)| matches!(e, Entry::Established(_)))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Empties the id map, returning every entry.
    pub(crate) fn drain(&mut self) -> Vec<(ConnectionId, Entry<P, C>)> {
        self.entries.drain().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
