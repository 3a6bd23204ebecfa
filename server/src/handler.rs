//! Message handlers and the reply path back to the sender.
//!
//! A [`Handler`] receives a [`Request`] carrying the payload, the sender's
//! identity and a [`Reply`]. The reply can be completed from anywhere (a
//! spawned task included) and produces at most one response envelope.
//! Handler failures, returned or panicked, are contained at the dispatch
//! boundary and converted into error replies.

use crate::error::HandlerError;
use crate::link::{PeerLink, PeerMessage};
use crate::network::{ServerHandle, ServerMessage};
use crate::session::ConnectionId;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::{CorrelationId, EntityId, ProcessId, Response, Scope};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Identity of the connection a message originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sender {
    pub user_id: EntityId,
    pub process_id: ProcessId,
    pub connection_id: ConnectionId,
}

#[derive(Clone)]
pub struct Handler(Arc<dyn Fn(Request) -> HandlerResult + Send + Sync>);

impl Handler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Request) -> HandlerResult + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Runs the handler, turning a panic into a `HandlerError`
    pub fn invoke(&self, request: Request) -> HandlerResult {
        match panic::catch_unwind(AssertUnwindSafe(|| (self.0)(request))) {
            Ok(result) => result,
            Err(payload) => Err(HandlerError::new(format!(
                "handler panicked: {}",
                panic_message(payload.as_ref())
            ))),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Handlers keyed by message name
#[derive(Clone, Default)]
pub struct Handlers {
    map: HashMap<String, Handler>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Request) -> HandlerResult + Send + Sync + 'static,
    {
        self.insert(name, f);
        self
    }

    pub fn insert<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Request) -> HandlerResult + Send + Sync + 'static,
    {
        self.map.insert(name.into(), Handler::new(f));
    }

    pub fn get(&self, name: &str) -> Option<&Handler> {
        self.map.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Everything a handler gets for one message
pub struct Request {
    pub name: String,
    pub scope: Option<Scope>,
    pub data: Value,
    pub sender: Sender,
    pub reply: Reply,
    pub server: ServerHandle,
}

/// Routes responses to the originating connection, locally or via the link
#[derive(Clone)]
pub struct Outbox {
    process_id: ProcessId,
    tx: mpsc::UnboundedSender<ServerMessage>,
    link: PeerLink,
}

impl Outbox {
    pub fn new(process_id: ProcessId, tx: mpsc::UnboundedSender<ServerMessage>, link: PeerLink) -> Self {
        Self {
            process_id,
            tx,
            link,
        }
    }

    pub fn deliver(&self, sender: &Sender, response: Response) {
        if sender.process_id == self.process_id {
            let message = ServerMessage::Respond {
                connection_id: sender.connection_id,
                response,
            };
            if self.tx.send(message).is_err() {
                debug!("Server stopped, dropping reply for {}", sender.connection_id);
            }
        } else {
            self.link.send(
                sender.process_id,
                PeerMessage::Reply {
                    connection_id: sender.connection_id,
                    response,
                },
            );
        }
    }
}

struct ReplyInner {
    name: String,
    correlation_id: Option<CorrelationId>,
    sender: Sender,
    outbox: Outbox,
    sent: AtomicBool,
}

/// One-shot reply callback.
///
/// Clones share state: only the first completion has any effect. Without
/// a correlation id nothing is sent, and errors are only logged.
#[derive(Clone)]
pub struct Reply {
    inner: Arc<ReplyInner>,
}

impl Reply {
    pub fn new(
        name: impl Into<String>,
        correlation_id: Option<CorrelationId>,
        sender: Sender,
        outbox: Outbox,
    ) -> Self {
        Self {
            inner: Arc::new(ReplyInner {
                name: name.into(),
                correlation_id,
                sender,
                outbox,
                sent: AtomicBool::new(false),
            }),
        }
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.inner.correlation_id
    }

    pub fn is_sent(&self) -> bool {
        self.inner.sent.load(Ordering::SeqCst)
    }

    pub fn ok(&self, data: Value) -> bool {
        self.send(Ok(data))
    }

    pub fn err(&self, message: impl Into<String>) -> bool {
        self.send(Err(HandlerError::new(message)))
    }

    /// Completes the reply; returns false if it was already completed
    pub fn send(&self, result: std::result::Result<Value, HandlerError>) -> bool {
        if self.inner.sent.swap(true, Ordering::SeqCst) {
            return false;
        }

        let inner = &self.inner;
        let Some(id) = inner.correlation_id else {
            if let Err(e) = result {
                warn!(
                    "Handler for '{}' from user {} failed: {}",
                    inner.name, inner.sender.user_id, e
                );
            }
            return true;
        };

        let response = match result {
            Ok(data) => Response::ok(inner.name.clone(), data, Some(id)),
            Err(e) => Response::error(inner.name.clone(), e.message(), Some(id)),
        };
        inner.outbox.deliver(&inner.sender, response);
        true
    }
}
