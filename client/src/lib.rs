//! # Session Client Library
//!
//! A small client for the cluster session server. It opens a WebSocket to
//! any process, authenticates, and exchanges JSON envelopes with it.
//!
//! ## Request/Response Correlation
//!
//! Every [`Connection::request`] allocates a fresh correlation id and parks
//! a waiter in the connection's pending table. The reader task completes the
//! waiter when a response echoing that id arrives; responses without an id
//! are server pushes (for example room `state` broadcasts) and are queued for
//! [`Connection::next_push`]. A request that sees no reply within the
//! configured timeout gives up and frees its slot.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::Connection;
//! use serde_json::json;
//! use shared::Scope;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut connection = Connection::connect("ws://127.0.0.1:9000").await?;
//!     let user_id = connection.authenticate(json!({ "token": "secret" })).await?;
//!     println!("Authenticated as user {}", user_id);
//!
//!     let reply = connection.call("fire", Some(Scope::room(5)), json!({ "power": 3 })).await?;
//!     println!("Reply: {}", reply);
//!     Ok(())
//! }
//! ```

pub mod network;

pub use network::{ClientError, Connection, Result};
