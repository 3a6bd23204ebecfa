//! Cluster-unique identifier issuance.
//!
//! Ids come from an atomic increment on the coordination store, one counter
//! per entity kind (`ids:<kind>`). Every kind except `server` gets its
//! routing entry written before the id is handed out, so an id never exists
//! without a known owner.

use crate::error::Result;
use crate::routing::RoutingTable;
use crate::store::SharedStore;
use log::debug;
use shared::{EntityId, ProcessId, ScopeKind};

pub fn counter_key(kind: ScopeKind) -> String {
    format!("ids:{}", kind)
}

/// Mints this process's own identifier. No routing entry is written.
pub async fn allocate_process_id(store: &SharedStore) -> Result<ProcessId> {
    store.increment(&counter_key(ScopeKind::Server)).await
}

/// Allocator bound to the process that will own what it allocates
#[derive(Clone)]
pub struct IdAllocator {
    store: SharedStore,
    routing: RoutingTable,
    process_id: ProcessId,
}

impl IdAllocator {
    pub fn new(store: SharedStore, process_id: ProcessId) -> Self {
        Self {
            routing: RoutingTable::new(store.clone()),
            store,
            process_id,
        }
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub async fn allocate(&self, kind: ScopeKind) -> Result<EntityId> {
        let id = self.store.increment(&counter_key(kind)).await?;

        if kind != ScopeKind::Server {
            self.routing.register(kind, id, self.process_id).await?;
        }

        debug!("Allocated {} {} on process {}", kind, id, self.process_id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::store::{CoordinationStore, MemoryStore};
    use std::collections::HashSet;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_allocation_writes_routing_entry() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let allocator = IdAllocator::new(store.clone(), 4);

        let id = allocator.allocate(ScopeKind::Room).await.unwrap();

        let routing = RoutingTable::new(store);
        assert_eq!(routing.lookup(ScopeKind::Room, id).await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn test_process_ids_have_no_routing_entry() {
        let backing = MemoryStore::new();
        let store: SharedStore = Arc::new(backing.clone());

        let first = allocate_process_id(&store).await.unwrap();
        let second = allocate_process_id(&store).await.unwrap();
        assert_eq!((first, second), (1, 2));

        assert_eq!(backing.get_field("routes:server", "1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_allocation_is_distinct_and_gapless() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let mut tasks = Vec::new();

        for process in 1..=8u64 {
            let allocator = IdAllocator::new(store.clone(), process);
            tasks.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for _ in 0..50 {
                    ids.push(allocator.allocate(ScopeKind::NetworkEntity).await.unwrap());
                }
                ids
            }));
        }

        let mut seen = HashSet::new();
        for task in tasks {
            for id in task.await.unwrap() {
                assert!(seen.insert(id), "id {} issued twice", id);
            }
        }

        assert_eq!(seen.len(), 400);
        assert_eq!(seen.iter().copied().max(), Some(400));
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_allocation() {
        let backing = MemoryStore::new();
        backing.set_available(false);
        let allocator = IdAllocator::new(Arc::new(backing), 1);

        let result = allocator.allocate(ScopeKind::User).await;
        assert!(matches!(result, Err(Error::CoordinationUnavailable(_))));
    }
}
