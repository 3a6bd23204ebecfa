//! Per-connection session: authentication state and correlation slots
//!
//! A session moves `Connecting → Authenticating → Authenticated → Closed`.
//! While authenticated it tracks every correlated request that is still
//! waiting for its reply; slots are removed when the reply is written or
//! when they time out, and their number is capped.

use crate::entity::UserId;
use crate::error::{Error, Result};
use log::debug;
use shared::{is_reserved, CorrelationId, Envelope, Response, AUTHENTICATE};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::mpsc;

pub type ConnectionId = u64;

/// Frames handed to the transport writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Authenticated(UserId),
    Closed,
}

#[derive(Debug)]
struct PendingReply {
    name: String,
    deadline: Instant,
}

#[derive(Debug)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub addr: Option<SocketAddr>,
    state: SessionState,
    auth_correlation: Option<CorrelationId>,
    pending: HashMap<CorrelationId, PendingReply>,
    max_pending: usize,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl Session {
    pub fn new(
        connection_id: ConnectionId,
        addr: Option<SocketAddr>,
        outbound: mpsc::UnboundedSender<Outbound>,
        max_pending: usize,
    ) -> Self {
        Self {
            connection_id,
            addr,
            state: SessionState::Connecting,
            auth_correlation: None,
            pending: HashMap::new(),
            max_pending,
            outbound,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn user_id(&self) -> Option<UserId> {
        match self.state {
            SessionState::Authenticated(user_id) => Some(user_id),
            _ => None,
        }
    }

    /// Checks whether `envelope` may be processed in the current state.
    ///
    /// Never changes state.
    pub fn admit(&self, envelope: &Envelope) -> Result<()> {
        if is_reserved(&envelope.name) {
            return Err(Error::ReservedName(envelope.name.clone()));
        }

        match (self.state, envelope.name == AUTHENTICATE) {
            (SessionState::Connecting, true) => Ok(()),
            (SessionState::Authenticating | SessionState::Authenticated(_), true) => {
                Err(Error::AlreadyAuthenticated)
            }
            (SessionState::Authenticated(_), false) => Ok(()),
            _ => Err(Error::NotAuthenticated),
        }
    }

    pub fn begin_authentication(&mut self, correlation_id: Option<CorrelationId>) -> Result<()> {
        if self.state != SessionState::Connecting {
            return Err(Error::AlreadyAuthenticated);
        }
        self.state = SessionState::Authenticating;
        self.auth_correlation = correlation_id;
        Ok(())
    }

    /// Binds the user; returns the correlation id of the `_authenticate`
    /// request, or `None` if this session was not authenticating
    pub fn complete_authentication(&mut self, user_id: UserId) -> Option<Option<CorrelationId>> {
        if self.state != SessionState::Authenticating {
            return None;
        }
        self.state = SessionState::Authenticated(user_id);
        Some(self.auth_correlation.take())
    }

    pub fn auth_correlation(&self) -> Option<CorrelationId> {
        self.auth_correlation
    }

    /// Reserves a correlation slot for a request about to be dispatched
    pub fn open_slot(&mut self, id: CorrelationId, name: &str, deadline: Instant) -> Result<()> {
        if self.pending.contains_key(&id) {
            return Err(Error::DuplicateCorrelation(id));
        }
        if self.pending.len() >= self.max_pending {
            return Err(Error::TooManyPendingReplies(self.max_pending));
        }
        self.pending.insert(
            id,
            PendingReply {
                name: name.to_string(),
                deadline,
            },
        );
        Ok(())
    }

    /// Writes a reply if its slot is still open; pushes (no id) always go out
    pub fn complete_slot(&mut self, response: &Response) -> bool {
        match response.id {
            None => self.send(response),
            Some(id) => {
                if self.pending.remove(&id).is_none() {
                    debug!(
                        "Dropping reply {} for connection {}: slot already closed",
                        id, self.connection_id
                    );
                    return false;
                }
                self.send(response)
            }
        }
    }

    /// Frees a slot without answering
    pub fn release_slot(&mut self, id: CorrelationId) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Fails every slot whose deadline has passed
    pub fn expire_slots(&mut self, now: Instant) -> usize {
        let expired: Vec<CorrelationId> = self
            .pending
            .iter()
            .filter(|(_, slot)| slot.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(slot) = self.pending.remove(id) {
                let response = Response::error(slot.name, Error::ReplyTimeout.to_string(), Some(*id));
                self.send(&response);
            }
        }

        expired.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn send(&self, response: &Response) -> bool {
        match response.encode() {
            Ok(text) => self.outbound.send(Outbound::Text(text)).is_ok(),
            Err(e) => {
                debug!("Failed to encode response for {}: {}", self.connection_id, e);
                false
            }
        }
    }

    /// Answers a refused message if the client is waiting for it
    pub fn reject(&self, envelope: &Envelope, error: &Error) {
        match envelope.correlation_id {
            Some(id) => {
                self.send(&Response::error(envelope.name.clone(), error.to_string(), Some(id)));
            }
            None => debug!(
                "Rejected '{}' from connection {}: {}",
                envelope.name, self.connection_id, error
            ),
        }
    }

    /// Moves to `Closed`, asks the transport to close, and returns the
    /// user that was bound to this connection
    pub fn close(&mut self) -> Option<UserId> {
        if self.state == SessionState::Closed {
            return None;
        }
        let user_id = self.user_id();
        self.state = SessionState::Closed;
        self.pending.clear();
        let _ = self.outbound.send(Outbound::Close);
        user_id
    }
}
