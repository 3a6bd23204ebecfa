//! # Cluster Session Server Library
//!
//! This library implements one process of a clustered multiplayer session
//! server. Clients hold a persistent WebSocket connection to any process;
//! users, rooms and network entities are addressable by a stable id no
//! matter which process owns them.
//!
//! ## Core Responsibilities
//!
//! ### Identifier Issuance
//! Ids are minted by an atomic increment on the coordination store, one
//! counter per entity kind. They are never reused.
//!
//! ### Routing
//! A cluster-wide routing table maps `(kind, id)` to the owning process.
//! Local registries are consulted first; the store is only asked when an
//! entity is not resident here.
//!
//! ### Dispatch
//! Every incoming message resolves to exactly one target: a global handler,
//! the process itself, a local user, room or network entity, or a remote
//! process. Remote targets are reached by forwarding the envelope over the
//! inter-process link, and replies travel back to the originating
//! connection with their correlation id intact.
//!
//! ## Architecture Design
//!
//! ### Single Owner Event Loop
//! One task owns the registries and all sessions. Transport and peer tasks
//! feed events into it over a channel; coordination store calls run in
//! spawned tasks and post their results back, so the loop never blocks on
//! the store and re-validates local state after every suspension.
//!
//! ### Correlation Slots
//! Each session tracks its outstanding correlated requests. Slots are
//! capped per connection and time out with an error reply.
//!
//! ## Module Organization
//!
//! - `allocator`, `routing`, `store`: cluster-wide state on the
//!   coordination store
//! - `registry`, `entity`: what this process owns
//! - `session`, `session_manager`, `auth`: per-connection protocol state
//! - `dispatch`, `handler`: target resolution and handler invocation
//! - `link`: the inter-process link
//! - `transport`, `network`: WebSocket bridge and the run loop
//! - `config`, `error`: startup configuration and the error taxonomy
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//! use server::store::RemoteStore;
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(RemoteStore::connect("127.0.0.1:7000").await?);
//!     let listener = TcpListener::bind("127.0.0.1:9000").await?;
//!     let config = ServerConfig::default().with_peer_addr("127.0.0.1:9100".parse()?);
//!
//!     let mut server = Server::new(config, store, listener).await?;
//!     server.on("ping", |request| {
//!         request.reply.ok(serde_json::json!("pong"));
//!         Ok(())
//!     })?;
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod allocator;
pub mod auth;
pub mod config;
pub mod dispatch;
pub mod entity;
pub mod error;
pub mod handler;
pub mod link;
pub mod network;
pub mod registry;
pub mod routing;
pub mod session;
pub mod session_manager;
pub mod store;
pub mod transport;

pub use error::{Error, HandlerError, Result};
pub use handler::{Handlers, Reply, Request, Sender};
pub use network::{Server, ServerHandle, ServerStats};
