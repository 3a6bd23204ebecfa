//! Cluster-wide routing table: `(kind, id) -> owning process`.
//!
//! Entries live in one store map per entity kind (`routes:<kind>`), keyed by
//! the decimal id. Registration is a last-writer-wins upsert. Callers check
//! their local registries first and only come here on a miss.

use crate::error::Result;
use crate::store::SharedStore;
use log::warn;
use shared::{EntityId, ProcessId, ScopeKind};

pub fn routes_key(kind: ScopeKind) -> String {
    format!("routes:{}", kind)
}

#[derive(Clone)]
pub struct RoutingTable {
    store: SharedStore,
}

impl RoutingTable {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub async fn register(&self, kind: ScopeKind, id: EntityId, process: ProcessId) -> Result<()> {
        self.store
            .set_field(&routes_key(kind), &id.to_string(), &process.to_string())
            .await
    }

    /// Returns the owning process, or `None` if no entry exists
    pub async fn lookup(&self, kind: ScopeKind, id: EntityId) -> Result<Option<ProcessId>> {
        let value = self
            .store
            .get_field(&routes_key(kind), &id.to_string())
            .await?;

        Ok(value.and_then(|raw| match raw.parse() {
            Ok(process) => Some(process),
            Err(_) => {
                warn!("Ignoring malformed routing entry {} {} -> {:?}", kind, id, raw);
                None
            }
        }))
    }

    pub async fn deregister(&self, kind: ScopeKind, id: EntityId) -> Result<()> {
        self.store
            .remove_field(&routes_key(kind), &id.to_string())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_register_then_lookup_from_any_process() {
        let store = MemoryStore::new();
        let on_a = RoutingTable::new(Arc::new(store.clone()));
        let on_b = RoutingTable::new(Arc::new(store.clone()));

        on_a.register(ScopeKind::Room, 5, 1).await.unwrap();

        assert_eq!(on_a.lookup(ScopeKind::Room, 5).await.unwrap(), Some(1));
        assert_eq!(on_b.lookup(ScopeKind::Room, 5).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_register_is_idempotent_upsert() {
        let routing = RoutingTable::new(Arc::new(MemoryStore::new()));

        routing.register(ScopeKind::User, 3, 1).await.unwrap();
        routing.register(ScopeKind::User, 3, 1).await.unwrap();
        assert_eq!(routing.lookup(ScopeKind::User, 3).await.unwrap(), Some(1));

        routing.register(ScopeKind::User, 3, 2).await.unwrap();
        assert_eq!(routing.lookup(ScopeKind::User, 3).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_kinds_have_separate_namespaces() {
        let routing = RoutingTable::new(Arc::new(MemoryStore::new()));
        routing.register(ScopeKind::Room, 1, 9).await.unwrap();

        assert_eq!(routing.lookup(ScopeKind::NetworkEntity, 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_deregister_removes_entry() {
        let routing = RoutingTable::new(Arc::new(MemoryStore::new()));
        routing.register(ScopeKind::Room, 1, 9).await.unwrap();
        routing.deregister(ScopeKind::Room, 1).await.unwrap();

        assert_eq!(routing.lookup(ScopeKind::Room, 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_malformed_entry_reads_as_absent() {
        let store = MemoryStore::new();
        store.set_field_now("routes:room", "1", "not-a-number").unwrap();
        let routing = RoutingTable::new(Arc::new(store));

        assert_eq!(routing.lookup(ScopeKind::Room, 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lookup_surfaces_unavailable_store() {
        let store = MemoryStore::new();
        store.set_available(false);
        let routing = RoutingTable::new(Arc::new(store));

        let result = routing.lookup(ScopeKind::Room, 1).await;
        assert!(matches!(result, Err(Error::CoordinationUnavailable(_))));
    }
}
