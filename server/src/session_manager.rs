//! Connection session table for one process
//!
//! Enforces the connection capacity, hands out deadlines for correlation
//! slots and sweeps expired slots across every live session.

use crate::error::{Error, Result};
use crate::session::{ConnectionId, Outbound, Session};
use log::info;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

pub struct SessionManager {
    sessions: HashMap<ConnectionId, Session>,
    max_sessions: usize,
    max_pending: usize,
    reply_timeout: Duration,
}

impl SessionManager {
    pub fn new(max_sessions: usize, max_pending: usize, reply_timeout: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            max_sessions,
            max_pending,
            reply_timeout,
        }
    }

    /// Opens a session for a new connection, or fails at capacity
    pub fn add_session(
        &mut self,
        connection_id: ConnectionId,
        addr: Option<SocketAddr>,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Result<()> {
        if self.sessions.len() >= self.max_sessions {
            return Err(Error::CapacityExceeded);
        }

        let session = Session::new(connection_id, addr, outbound, self.max_pending);
        info!("Connection {} opened from {:?}", connection_id, addr);
        self.sessions.insert(connection_id, session);
        Ok(())
    }

    pub fn remove_session(&mut self, connection_id: ConnectionId) -> Option<Session> {
        let session = self.sessions.remove(&connection_id)?;
        info!("Connection {} closed", connection_id);
        Some(session)
    }

    pub fn get(&self, connection_id: ConnectionId) -> Option<&Session> {
        self.sessions.get(&connection_id)
    }

    pub fn get_mut(&mut self, connection_id: ConnectionId) -> Option<&mut Session> {
        self.sessions.get_mut(&connection_id)
    }

    /// Deadline for a slot opened now
    pub fn slot_deadline(&self) -> Instant {
        Instant::now() + self.reply_timeout
    }

    /// Times out expired slots in every session, returning how many expired
    pub fn expire_pending(&mut self, now: Instant) -> usize {
        self.sessions
            .values_mut()
            .map(|session| session.expire_slots(now))
            .sum()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.sessions.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn channel() -> mpsc::UnboundedSender<Outbound> {
        mpsc::unbounded_channel().0
    }

    #[test]
    fn test_manager_creation() {
        let manager = SessionManager::new(5, 4, Duration::from_secs(1));
        assert!(manager.is_empty());
        assert_eq!(manager.len(), 0);
    }

    #[test]
    fn test_add_and_remove_session() {
        let mut manager = SessionManager::new(2, 4, Duration::from_secs(1));

        manager.add_session(1, Some(test_addr()), channel()).unwrap();
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.get(1).unwrap().state(), SessionState::Connecting);

        assert!(manager.remove_session(1).is_some());
        assert!(manager.remove_session(1).is_none());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_capacity_enforced() {
        let mut manager = SessionManager::new(1, 4, Duration::from_secs(1));

        manager.add_session(1, None, channel()).unwrap();
        let result = manager.add_session(2, None, channel());

        assert!(matches!(result, Err(Error::CapacityExceeded)));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_expire_pending_across_sessions() {
        let mut manager = SessionManager::new(4, 4, Duration::from_secs(1));
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.add_session(1, None, tx.clone()).unwrap();
        manager.add_session(2, None, tx).unwrap();

        let now = Instant::now();
        for id in [1, 2] {
            let session = manager.get_mut(id).unwrap();
            session.begin_authentication(None).unwrap();
            session.complete_authentication(id);
            session.open_slot(9, "x", now).unwrap();
        }

        assert_eq!(manager.expire_pending(now), 2);
        assert_eq!(manager.expire_pending(now), 0);
    }

    #[test]
    fn test_slot_deadline_is_in_the_future() {
        let manager = SessionManager::new(1, 1, Duration::from_secs(30));
        assert!(manager.slot_deadline() > Instant::now());
    }
}
