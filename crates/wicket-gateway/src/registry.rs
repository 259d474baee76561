//! Live connections by ID

use crate::connection::Connection;
use crate::id::ConnId;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Concurrent map of registered connections.
///
/// Cloning is cheap and shares the underlying map. Callbacks passed to
/// [`apply`](Self::apply) and [`for_each`](Self::for_each) run after the map
/// lock is released, so they may write to connections or call back into the
/// registry.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    connections: Arc<DashMap<ConnId, Arc<Connection>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Returns `false` if the ID was already taken,
    /// in which case the existing entry is left in place.
    pub fn add(&self, conn: Arc<Connection>) -> bool {
        let id = conn.id();
        match self.connections.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(conn);
                debug!(conn_id = %id, "Connection registered");
                true
            }
        }
    }

    pub fn remove(&self, id: ConnId) -> Option<Arc<Connection>> {
        let removed = self.connections.remove(&id).map(|(_, conn)| conn);
        if removed.is_some() {
            debug!(conn_id = %id, "Connection deregistered");
        }
        removed
    }

    pub fn get(&self, id: ConnId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Run `f` on the connection registered under `id`, if any
    pub fn apply<R>(&self, id: ConnId, f: impl FnOnce(&Arc<Connection>) -> R) -> Option<R> {
        let conn = self.get(id)?;
        Some(f(&conn))
    }

    /// Run `f` on every connection registered at the time of the call
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Connection>)) {
        for conn in self.snapshot() {
            f(&conn);
        }
    }

    /// Close every registered connection, returning how many closes this
    /// call initiated. Entries stay until their gateway task removes them.
    pub fn close_all(&self) -> usize {
        let conns = self.snapshot();
        let closed = conns.iter().filter(|conn| conn.close()).count();
        debug!(total = conns.len(), closed, "Closed all connections");
        closed
    }

    pub fn ids(&self) -> Vec<ConnId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}
