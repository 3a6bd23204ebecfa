//! Wire protocol shared by cluster processes and clients.
//!
//! Clients send [`Envelope`]s as JSON text frames and receive [`Response`]s.
//! A response echoes the request's `correlationId` in its `id` field; a
//! response without an `id` is a server push.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Name of the one message a fresh connection must send first.
pub const AUTHENTICATE: &str = "_authenticate";

/// Name used for room state broadcasts.
pub const STATE: &str = "state";

/// Lifecycle names that clients may never dispatch.
pub const RESERVED_NAMES: &[&str] = &["destroy", "open", "close", "message", "error"];

pub type EntityId = u64;
pub type ProcessId = u64;
pub type CorrelationId = u64;

/// Returns true if `name` is a lifecycle name clients cannot send
pub fn is_reserved(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}

/// Category of addressable object, each with its own id namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScopeKind {
    Server,
    User,
    Room,
    NetworkEntity,
}

impl ScopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeKind::Server => "server",
            ScopeKind::User => "user",
            ScopeKind::Room => "room",
            ScopeKind::NetworkEntity => "networkEntity",
        }
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `(kind, id)` pair a message is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    #[serde(rename = "type")]
    pub kind: ScopeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<EntityId>,
}

impl Scope {
    pub fn server() -> Self {
        Self {
            kind: ScopeKind::Server,
            id: None,
        }
    }

    pub fn user(id: EntityId) -> Self {
        Self {
            kind: ScopeKind::User,
            id: Some(id),
        }
    }

    pub fn room(id: EntityId) -> Self {
        Self {
            kind: ScopeKind::Room,
            id: Some(id),
        }
    }

    pub fn network_entity(id: EntityId) -> Self {
        Self {
            kind: ScopeKind::NetworkEntity,
            id: Some(id),
        }
    }
}

/// A client request, also the unit forwarded between processes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

impl Envelope {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            scope: None,
            data,
            correlation_id: None,
        }
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn with_correlation(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Payload of a failed response: `{"err": "<message>"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    pub err: String,
}

/// A reply to a request, or a push when `id` is absent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub name: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CorrelationId>,
}

impl Response {
    pub fn ok(name: impl Into<String>, data: Value, id: Option<CorrelationId>) -> Self {
        Self {
            name: name.into(),
            data,
            id,
        }
    }

    pub fn error(name: impl Into<String>, message: impl Into<String>, id: Option<CorrelationId>) -> Self {
        let data = serde_json::to_value(ErrorData {
            err: message.into(),
        })
        .unwrap_or(Value::Null);
        Self {
            name: name.into(),
            data,
            id,
        }
    }

    pub fn push(name: impl Into<String>, data: Value) -> Self {
        Self::ok(name, data, None)
    }

    /// Returns the error message if this response signals failure
    pub fn error_message(&self) -> Option<&str> {
        self.data.get("err").and_then(Value::as_str)
    }

    pub fn is_error(&self) -> bool {
        self.error_message().is_some()
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
