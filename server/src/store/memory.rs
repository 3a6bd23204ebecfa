use super::{CoordinationStore, StoreFuture};
use crate::error::{Error, Result};
use futures_util::FutureExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct Tables {
    counters: HashMap<String, u64>,
    maps: HashMap<String, HashMap<String, String>>,
}

#[derive(Default)]
struct Inner {
    tables: Mutex<Tables>,
    available: AtomicBool,
    round_trips: AtomicU64,
}

/// In-process coordination store.
///
/// Clones share the same tables, so several simulated processes handed
/// clones of one `MemoryStore` see a single cluster-wide store. The
/// `coordinator` binary serves one of these over TCP.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let inner = Inner {
            available: AtomicBool::new(true),
            ..Inner::default()
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Simulates losing (or regaining) the connection to the store
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Number of operations served so far
    pub fn round_trips(&self) -> u64 {
        self.inner.round_trips.load(Ordering::SeqCst)
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(Error::CoordinationUnavailable("store offline".into()));
        }
        self.inner.round_trips.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .inner
            .tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner))
    }

    pub fn increment_now(&self, key: &str) -> Result<u64> {
        let mut tables = self.tables()?;
        let counter = tables.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    pub fn set_field_now(&self, map: &str, field: &str, value: &str) -> Result<()> {
        self.tables()?
            .maps
            .entry(map.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    pub fn get_field_now(&self, map: &str, field: &str) -> Result<Option<String>> {
        Ok(self
            .tables()?
            .maps
            .get(map)
            .and_then(|fields| fields.get(field))
            .cloned())
    }

    pub fn remove_field_now(&self, map: &str, field: &str) -> Result<()> {
        if let Some(fields) = self.tables()?.maps.get_mut(map) {
            fields.remove(field);
        }
        Ok(())
    }
}

impl CoordinationStore for MemoryStore {
    fn increment<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64> {
        async move { self.increment_now(key) }.boxed()
    }

    fn set_field<'a>(
        &'a self,
        map: &'a str,
        field: &'a str,
        value: &'a str,
    ) -> StoreFuture<'a, ()> {
        async move { self.set_field_now(map, field, value) }.boxed()
    }

    fn get_field<'a>(&'a self, map: &'a str, field: &'a str) -> StoreFuture<'a, Option<String>> {
        async move { self.get_field_now(map, field) }.boxed()
    }

    fn remove_field<'a>(&'a self, map: &'a str, field: &'a str) -> StoreFuture<'a, ()> {
        async move { self.remove_field_now(map, field) }.boxed()
    }
}
