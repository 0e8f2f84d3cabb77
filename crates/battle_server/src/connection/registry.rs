//! Dense connection id allocation.
//!
//! Ids are handed out lowest-free-first so the id space stays compact. One
//! lock guards the whole table: mutations are serialized, lookups share a read
//! guard and proceed concurrently.
//!
//! Releasing an id does not touch the connection's battle. Callers tear the
//! battle down first.

use super::client::Connection;
use crate::error::RegistryError;
use battle_events::ConnectionId;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
struct RegistryState {
    bound: HashMap<ConnectionId, Arc<Connection>>,
    /// Allocated but not yet bound
    reserved: BTreeSet<u32>,
    /// Released ids below `next`
    free: BTreeSet<u32>,
    /// One past the highest id ever in use
    next: u32,
}

impl RegistryState {
    fn is_live(&self, id: u32) -> bool {
        self.reserved.contains(&id) || self.bound.contains_key(&ConnectionId(id))
    }

    fn recycle(&mut self, id: u32) {
        self.free.insert(id);
        // Trailing free ids fold back into `next`.
        while self.next > 0 && self.free.remove(&(self.next - 1)) {
            self.next -= 1;
        }
    }
}

/// Owns the mapping from connection ids to live connections.
#[derive(Debug)]
pub struct ConnectionRegistry {
    limit: u32,
    state: RwLock<RegistryState>,
}

impl ConnectionRegistry {
    /// A registry handing out at most `limit` simultaneous ids.
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Reserve the smallest free id.
    pub async fn allocate(&self) -> Result<ConnectionId, RegistryError> {
        let mut state = self.state.write().await;

        let id = match state.free.pop_first() {
            Some(id) => id,
            None if state.next < self.limit => {
                let id = state.next;
                state.next += 1;
                id
            }
            None => return Err(RegistryError::Exhausted { limit: self.limit }),
        };

        debug_assert!(!state.is_live(id));
        state.reserved.insert(id);
        Ok(ConnectionId(id))
    }

    /// Bind `connection` under the id it was created with.
    ///
    /// The id must come from [`allocate`](Self::allocate) and not be bound yet.
    pub async fn bind(&self, connection: Arc<Connection>) -> Result<(), RegistryError> {
        let id = connection.id();
        let mut state = self.state.write().await;

        if state.bound.contains_key(&id) {
            return Err(RegistryError::AlreadyBound(id));
        }
        if !state.reserved.remove(&id.as_u32()) {
            return Err(RegistryError::NotAllocated(id));
        }
        state.bound.insert(id, connection);
        Ok(())
    }

    /// Free `id`. Releasing an id that is not live is a no-op.
    pub async fn release(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let mut state = self.state.write().await;

        let removed = state.bound.remove(&id);
        let was_reserved = state.reserved.remove(&id.as_u32());
        if removed.is_some() || was_reserved {
            state.recycle(id.as_u32());
            debug!("Released connection id {}", id);
        }
        removed
    }

    /// Free the id held by `connection`, unless it has since been reused.
    pub async fn release_connection(&self, connection: &Connection) -> bool {
        let mut state = self.state.write().await;
        let id = connection.id();

        match state.bound.get(&id) {
            Some(current) if current.serial() == connection.serial() => {
                state.bound.remove(&id);
                state.recycle(id.as_u32());
                debug!("Released connection id {}", id);
                true
            }
            _ => false,
        }
    }

    pub async fn lookup(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.state.read().await.bound.get(&id).cloned()
    }

    /// Bound connections, ordered by id.
    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        let state = self.state.read().await;
        let mut connections: Vec<_> = state.bound.values().cloned().collect();
        connections.sort_by_key(|c| c.id());
        connections
    }

    pub async fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.state.read().await.bound.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Number of bound connections.
    pub async fn len(&self) -> usize {
        self.state.read().await.bound.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;
    use tokio::sync::mpsc;

    fn connection(id: ConnectionId) -> Arc<Connection> {
        let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
        std::mem::forget(rx);
        Arc::new(Connection::new(id, "127.0.0.1:5000".parse().unwrap(), tx))
    }

    async fn allocate_and_bind(registry: &ConnectionRegistry) -> ConnectionId {
        let id = registry.allocate().await.unwrap();
        registry.bind(connection(id)).await.unwrap();
        id
    }

    #[tokio::test]
    async fn allocates_lowest_free_id() {
        let registry = ConnectionRegistry::new(16);
        for expected in 0..4 {
            assert_eq!(allocate_and_bind(&registry).await, ConnectionId(expected));
        }

        registry.release(ConnectionId(2)).await;
        registry.release(ConnectionId(1)).await;
        assert_eq!(registry.allocate().await.unwrap(), ConnectionId(1));
        assert_eq!(registry.allocate().await.unwrap(), ConnectionId(2));
        assert_eq!(registry.allocate().await.unwrap(), ConnectionId(4));
    }

    #[tokio::test]
    async fn trailing_release_shrinks_id_space() {
        let registry = ConnectionRegistry::new(16);
        for _ in 0..3 {
            allocate_and_bind(&registry).await;
        }
        registry.release(ConnectionId(1)).await;
        registry.release(ConnectionId(2)).await;

        assert_eq!(registry.state.read().await.next, 1);
        assert!(registry.state.read().await.free.is_empty());
        assert_eq!(registry.allocate().await.unwrap(), ConnectionId(1));
    }

    #[tokio::test]
    async fn exhaustion_is_reported() {
        let registry = ConnectionRegistry::new(2);
        allocate_and_bind(&registry).await;
        registry.allocate().await.unwrap();

        assert_eq!(
            registry.allocate().await,
            Err(RegistryError::Exhausted { limit: 2 })
        );

        registry.release(ConnectionId(0)).await;
        assert_eq!(registry.allocate().await.unwrap(), ConnectionId(0));
    }

    #[tokio::test]
    async fn bind_rejects_unallocated_and_duplicate_ids() {
        let registry = ConnectionRegistry::new(8);
        assert_eq!(
            registry.bind(connection(ConnectionId(5))).await,
            Err(RegistryError::NotAllocated(ConnectionId(5)))
        );

        let id = allocate_and_bind(&registry).await;
        let original = registry.lookup(id).await.unwrap();
        assert_eq!(
            registry.bind(connection(id)).await,
            Err(RegistryError::AlreadyBound(id))
        );
        assert_eq!(registry.lookup(id).await.unwrap().serial(), original.serial());
    }

    #[tokio::test]
    async fn double_release_is_a_noop() {
        let registry = ConnectionRegistry::new(8);
        let a = allocate_and_bind(&registry).await;
        let b = allocate_and_bind(&registry).await;

        assert!(registry.release(a).await.is_some());
        assert!(registry.release(a).await.is_none());

        // Id `a` was reused by a new connection; a stale release of the old
        // holder must not free it.
        let stale = registry.lookup(b).await.unwrap();
        let reused = allocate_and_bind(&registry).await;
        assert_eq!(reused, a);
        assert!(registry.lookup(b).await.is_some());
        assert_eq!(registry.ids().await, vec![a, b]);

        let old_holder = connection(a);
        assert!(!registry.release_connection(&old_holder).await);
        assert!(registry.lookup(a).await.is_some());
        assert!(registry.release_connection(&stale).await);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_allocation_never_duplicates() {
        let registry = Arc::new(ConnectionRegistry::new(1024));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                for round in 0..50 {
                    let id = registry.allocate().await.unwrap();
                    registry.bind(connection(id)).await.unwrap();
                    mine.push(id);
                    if round % 3 == 0 {
                        let released = mine.remove(0);
                        registry.release(released).await;
                    }
                }
                mine
            }));
        }

        let mut held = Vec::new();
        for task in tasks {
            held.extend(task.await.unwrap());
        }
        let unique: BTreeSet<_> = held.iter().copied().collect();
        assert_eq!(unique.len(), held.len());
        assert_eq!(registry.len().await, held.len());
    }
}
