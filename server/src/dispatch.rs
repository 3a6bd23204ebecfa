//! Target resolution for incoming messages.
//!
//! Resolution is local-first: global handlers, then the process itself,
//! then the local registries. Only a miss on a routable kind asks for a
//! routing-table lookup, which the caller performs asynchronously before
//! finishing with [`after_lookup`].

use crate::entity::{RoomId, UserId};
use crate::error::{Error, Result};
use crate::handler::{Handler, Handlers};
use crate::registry::LocalRegistries;
use shared::{is_reserved, EntityId, Envelope, ProcessId, ScopeKind};
use std::fmt;

/// Where a message came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A client connection on this process
    Local,
    /// Forwarded by a peer process; never forwarded again
    Peer,
}

pub enum Target {
    GlobalHandler(Handler),
    SelfProcess,
    LocalUser(UserId),
    LocalRoom(RoomId),
    LocalNetworkEntity(EntityId),
    RemoteProcess(ProcessId),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::GlobalHandler(_) => write!(f, "global handlers"),
            Target::SelfProcess => write!(f, "server"),
            Target::LocalUser(id) => write!(f, "{} {}", ScopeKind::User, id),
            Target::LocalRoom(id) => write!(f, "{} {}", ScopeKind::Room, id),
            Target::LocalNetworkEntity(id) => write!(f, "{} {}", ScopeKind::NetworkEntity, id),
            Target::RemoteProcess(id) => write!(f, "process {}", id),
        }
    }
}

pub enum Resolution {
    Resolved(Target),
    /// Not resident here; consult the routing table
    Lookup { kind: ScopeKind, id: EntityId },
    NotFound(String),
}

pub fn resolve_local(
    envelope: &Envelope,
    globals: &Handlers,
    registries: &LocalRegistries,
    origin: Origin,
) -> Result<Resolution> {
    if is_reserved(&envelope.name) {
        return Err(Error::ReservedName(envelope.name.clone()));
    }

    if let Some(handler) = globals.get(&envelope.name) {
        return Ok(Resolution::Resolved(Target::GlobalHandler(handler.clone())));
    }

    let Some(scope) = envelope.scope else {
        return Ok(Resolution::NotFound(format!(
            "no global handler for '{}'",
            envelope.name
        )));
    };

    if scope.kind == ScopeKind::Server {
        return Ok(Resolution::Resolved(Target::SelfProcess));
    }

    let Some(id) = scope.id else {
        return Ok(Resolution::NotFound(format!("{} scope without id", scope.kind)));
    };

    if let Some(target) = local_target(scope.kind, id, registries) {
        return Ok(Resolution::Resolved(target));
    }

    Ok(match origin {
        Origin::Local => Resolution::Lookup {
            kind: scope.kind,
            id,
        },
        Origin::Peer => Resolution::NotFound(format!("{} {} is not resident", scope.kind, id)),
    })
}

/// Finishes resolution once the routing table has answered.
///
/// The registries are checked again because the entity may have been
/// created or destroyed here while the lookup was in flight.
pub fn after_lookup(
    kind: ScopeKind,
    id: EntityId,
    owner: Option<ProcessId>,
    self_id: ProcessId,
    registries: &LocalRegistries,
) -> Resolution {
    if let Some(target) = local_target(kind, id, registries) {
        return Resolution::Resolved(target);
    }

    match owner {
        Some(process) if process != self_id => Resolution::Resolved(Target::RemoteProcess(process)),
        Some(_) => Resolution::NotFound(format!("{} {} vanished from this process", kind, id)),
        None => Resolution::NotFound(format!("{} {} has no owner", kind, id)),
    }
}

fn local_target(kind: ScopeKind, id: EntityId, registries: &LocalRegistries) -> Option<Target> {
    if !registries.contains(kind, id) {
        return None;
    }
    match kind {
        ScopeKind::User => Some(Target::LocalUser(id)),
        ScopeKind::Room => Some(Target::LocalRoom(id)),
        ScopeKind::NetworkEntity => Some(Target::LocalNetworkEntity(id)),
        ScopeKind::Server => None,
    }
}
