use std::sync::Arc;

use dashmap::DashMap;

use crate::conn::RelayConn;

/// Process-wide map from account id to live relay connection.
///
/// Cheap to clone; clones share the same map. Lookups run concurrently;
/// insert and remove serialize against each other and against lookups on
/// the same shard. A handle returned by [`lookup`](Self::lookup) keeps the
/// connection alive for as long as the caller holds it, regardless of
/// concurrent removal.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<u64, Arc<RelayConn>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a connection under its account id, returning the connection
    /// it displaced, if any. At most one entry per account exists at any
    /// instant.
    pub fn insert(&self, conn: Arc<RelayConn>) -> Option<Arc<RelayConn>> {
        self.connections.insert(conn.id(), conn)
    }

    pub fn lookup(&self, id: u64) -> Option<Arc<RelayConn>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Removes the entry for `id` only while it still points at `conn`, so
    /// the teardown of a displaced connection cannot evict its replacement.
    pub fn remove(&self, id: u64, conn: &Arc<RelayConn>) -> bool {
        self.connections
            .remove_if(&id, |_, current| Arc::ptr_eq(current, conn))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
