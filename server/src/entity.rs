//! Addressable entities owned by this process

use crate::handler::Handlers;
use crate::session::ConnectionId;
use serde_json::Value;
use shared::EntityId;
use std::collections::BTreeSet;

pub type UserId = EntityId;
pub type RoomId = EntityId;

/// Produces the transmissible state of a synchronized object.
///
/// Called when the entity is registered and whenever its room broadcasts
/// state; the output is forwarded to clients without interpretation.
pub trait Snapshot: Send {
    fn snapshot(&self) -> Value;
}

impl<F> Snapshot for F
where
    F: Fn() -> Value + Send,
{
    fn snapshot(&self) -> Value {
        self()
    }
}

/// An authenticated client bound to one connection on this process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub connection_id: ConnectionId,
    /// True if the id was minted by the allocator rather than supplied by
    /// the authentication policy
    pub minted: bool,
}

pub struct Room {
    pub id: RoomId,
    handlers: Handlers,
    members: BTreeSet<UserId>,
}

impl Room {
    pub fn new(id: RoomId, handlers: Handlers) -> Self {
        Self {
            id,
            handlers,
            members: BTreeSet::new(),
        }
    }

    pub fn handlers(&self) -> &Handlers {
        &self.handlers
    }

    /// Returns false if the user was already a member
    pub fn join(&mut self, user: UserId) -> bool {
        self.members.insert(user)
    }

    pub fn leave(&mut self, user: UserId) -> bool {
        self.members.remove(&user)
    }

    pub fn is_member(&self, user: UserId) -> bool {
        self.members.contains(&user)
    }

    pub fn members(&self) -> impl Iterator<Item = UserId> + '_ {
        self.members.iter().copied()
    }
}

/// A synchronized object, optionally attached to a room
pub struct NetworkEntity {
    pub id: EntityId,
    room: Option<RoomId>,
    handlers: Handlers,
    source: Box<dyn Snapshot>,
}

impl NetworkEntity {
    pub fn new(
        id: EntityId,
        room: Option<RoomId>,
        handlers: Handlers,
        source: impl Snapshot + 'static,
    ) -> Self {
        Self {
            id,
            room,
            handlers,
            source: Box::new(source),
        }
    }

    pub fn room(&self) -> Option<RoomId> {
        self.room
    }

    pub fn detach(&mut self) {
        self.room = None;
    }

    pub fn handlers(&self) -> &Handlers {
        &self.handlers
    }

    pub fn snapshot(&self) -> Value {
        self.source.snapshot()
    }
}
