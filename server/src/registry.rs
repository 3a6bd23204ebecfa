//! Per-process registries of live users, rooms and network entities.
//!
//! Only the run loop touches these, so there is no locking. A hit here is
//! authoritative and never costs a store round trip.

use crate::entity::{NetworkEntity, Room, RoomId, User, UserId};
use shared::{EntityId, ScopeKind};
use std::collections::HashMap;

#[derive(Default)]
pub struct LocalRegistries {
    users: HashMap<UserId, User>,
    rooms: HashMap<RoomId, Room>,
    entities: HashMap<EntityId, NetworkEntity>,
}

impl LocalRegistries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the entity is resident on this process
    pub fn contains(&self, kind: ScopeKind, id: EntityId) -> bool {
        match kind {
            ScopeKind::User => self.users.contains_key(&id),
            ScopeKind::Room => self.rooms.contains_key(&id),
            ScopeKind::NetworkEntity => self.entities.contains_key(&id),
            ScopeKind::Server => false,
        }
    }

    /// Registers a user; refuses to replace one that is already bound
    pub fn insert_user(&mut self, user: User) -> bool {
        if self.users.contains_key(&user.id) {
            return false;
        }
        self.users.insert(user.id, user);
        true
    }

    /// Removes a user and its memberships in local rooms
    pub fn remove_user(&mut self, id: UserId) -> Option<User> {
        let user = self.users.remove(&id)?;
        for room in self.rooms.values_mut() {
            room.leave(id);
        }
        Some(user)
    }

    pub fn user(&self, id: UserId) -> Option<&User> {
        self.users.get(&id)
    }

    pub fn insert_room(&mut self, room: Room) {
        self.rooms.insert(room.id, room);
    }

    /// Removes a room, detaching any entities that were attached to it
    pub fn remove_room(&mut self, id: RoomId) -> Option<Room> {
        let room = self.rooms.remove(&id)?;
        for entity in self.entities.values_mut() {
            if entity.room() == Some(id) {
                entity.detach();
            }
        }
        Some(room)
    }

    pub fn room(&self, id: RoomId) -> Option<&Room> {
        self.rooms.get(&id)
    }

    pub fn room_mut(&mut self, id: RoomId) -> Option<&mut Room> {
        self.rooms.get_mut(&id)
    }

    pub fn insert_entity(&mut self, entity: NetworkEntity) {
        self.entities.insert(entity.id, entity);
    }

    pub fn remove_entity(&mut self, id: EntityId) -> Option<NetworkEntity> {
        self.entities.remove(&id)
    }

    pub fn entity(&self, id: EntityId) -> Option<&NetworkEntity> {
        self.entities.get(&id)
    }

    /// Entities attached to `room`, ordered by id
    pub fn entities_in_room(&self, room: RoomId) -> Vec<&NetworkEntity> {
        let mut entities: Vec<&NetworkEntity> = self
            .entities
            .values()
            .filter(|entity| entity.room() == Some(room))
            .collect();
        entities.sort_by_key(|entity| entity.id);
        entities
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }
}
