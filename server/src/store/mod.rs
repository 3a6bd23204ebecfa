//! Coordination store: the shared key/value service behind id allocation
//! and the routing table.
//!
//! Cross-process state is only ever mutated through the store's own
//! primitives (increment, set, get, remove), never read-modify-write from
//! process memory.

mod coordinator;
mod memory;
mod protocol;
mod remote;

pub use coordinator::serve;
pub use memory::MemoryStore;
pub use remote::RemoteStore;

use crate::error::Result;
use futures_util::future::BoxFuture;
use std::sync::Arc;

pub type StoreFuture<'a, T> = BoxFuture<'a, Result<T>>;

/// Store shared by every component of a process
pub type SharedStore = Arc<dyn CoordinationStore>;

pub trait CoordinationStore: Send + Sync {
    /// Atomically increments the counter at `key`, returning the new value
    fn increment<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64>;

    fn set_field<'a>(&'a self, map: &'a str, field: &'a str, value: &'a str)
        -> StoreFuture<'a, ()>;

    fn get_field<'a>(&'a self, map: &'a str, field: &'a str) -> StoreFuture<'a, Option<String>>;

    fn remove_field<'a>(&'a self, map: &'a str, field: &'a str) -> StoreFuture<'a, ()>;
}
