use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use serde_json::{json, Value};
use uuid::Uuid;

use crate::ServerAddress;

/// Server sessions this close to expiring are discarded rather than reused.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// The server side half of a session: its `lsid` and the last transaction number used.
#[derive(Debug, Clone)]
pub(crate) struct ServerSession {
    id: Uuid,
    txn_number: i64,
    last_use: Instant,
    dirty: bool,
}

impl ServerSession {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            txn_number: 0,
            last_use: Instant::now(),
            dirty: false,
        }
    }

    fn is_about_to_expire(&self, logical_session_timeout: Option<Duration>) -> bool {
        match logical_session_timeout {
            Some(timeout) => self.last_use.elapsed() + EXPIRY_MARGIN >= timeout,
            None => false,
        }
    }
}

/// A logical session handed to callers by [`Topology::start_session`](crate::Topology::start_session).
///
/// Dropping the session returns its server session to the pool for reuse.
#[derive(Debug)]
pub struct ClientSession {
    server_session: ServerSession,
    in_transaction: bool,
    pinned_server: Option<ServerAddress>,
    pool: SessionPool,
}

impl ClientSession {
    pub(crate) fn new(server_session: ServerSession, pool: SessionPool) -> Self {
        Self {
            server_session,
            in_transaction: false,
            pinned_server: None,
            pool,
        }
    }

    pub fn id(&self) -> Uuid {
        self.server_session.id
    }

    /// The `lsid` document attached to commands run in this session.
    pub fn lsid(&self) -> Value {
        json!({ "id": self.server_session.id.to_string() })
    }

    pub fn txn_number(&self) -> i64 {
        self.server_session.txn_number
    }

    /// Advances the transaction number for a new retryable write and returns it.
    pub fn increment_txn_number(&mut self) -> i64 {
        self.server_session.txn_number += 1;
        self.server_session.txn_number
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn set_in_transaction(&mut self, in_transaction: bool) {
        self.in_transaction = in_transaction;
    }

    /// The mongos a sharded transaction is bound to.
    pub fn pinned_server(&self) -> Option<&ServerAddress> {
        self.pinned_server.as_ref()
    }

    pub fn pin(&mut self, address: ServerAddress) {
        self.pinned_server = Some(address);
    }

    pub fn unpin(&mut self) {
        self.pinned_server = None;
    }

    pub(crate) fn mark_used(&mut self) {
        self.server_session.last_use = Instant::now();
    }

    /// A session that saw a network error may be in an unknown state on the server and is
    /// not reused.
    pub(crate) fn mark_dirty(&mut self) {
        self.server_session.dirty = true;
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.pool.release(self.server_session.clone());
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct SessionPool {
    sessions: Arc<Mutex<VecDeque<ServerSession>>>,
}

impl SessionPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Reuses the most recently released live session, or starts a new one.
    pub(crate) fn acquire(&self, logical_session_timeout: Option<Duration>) -> ServerSession {
        let mut sessions = match self.sessions.lock() {
            Ok(sessions) => sessions,
            Err(poisoned) => poisoned.into_inner(),
        };
        while let Some(session) = sessions.pop_front() {
            if !session.is_about_to_expire(logical_session_timeout) {
                return session;
            }
        }
        ServerSession::new()
    }

    pub(crate) fn release(&self, session: ServerSession) {
        if session.dirty {
            return;
        }
        let mut sessions = match self.sessions.lock() {
            Ok(sessions) => sessions,
            Err(poisoned) => poisoned.into_inner(),
        };
        sessions.push_front(session);
    }

    /// Empties the pool and returns the `lsid`s that should be ended on the server.
    pub(crate) fn drain_ids(&self) -> Vec<Value> {
        let mut sessions = match self.sessions.lock() {
            Ok(sessions) => sessions,
            Err(poisoned) => poisoned.into_inner(),
        };
        sessions
            .drain(..)
            .map(|s| json!({ "id": s.id.to_string() }))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    #[test]
    fn dropped_sessions_are_reused() {
        // Arrange
        let pool = SessionPool::new();
        let first = ClientSession::new(pool.acquire(None), pool.clone());
        let id = first.id();

        // Act
        drop(first);
        let second = ClientSession::new(pool.acquire(None), pool.clone());

        // Assert
        assert_eq!(second.id(), id);
    }

    #[test]
    fn dirty_sessions_are_discarded() {
        let pool = SessionPool::new();
        let mut session = ClientSession::new(pool.acquire(None), pool.clone());
        session.mark_dirty();

        drop(session);

        assert!(pool.drain_ids().is_empty());
    }

    #[test]
    fn expiring_sessions_are_not_reused() {
        let pool = SessionPool::new();
        let session = ClientSession::new(pool.acquire(None), pool.clone());
        let id = session.id();
        drop(session);

        let next = pool.acquire(Some(Duration::from_secs(30)));

        assert_ne!(next.id, id);
    }

    #[test]
    fn txn_number_increments() {
        let pool = SessionPool::new();
        let mut session = ClientSession::new(pool.acquire(None), pool.clone());

        assert_eq!(session.increment_txn_number(), 1);
        assert_eq!(session.increment_txn_number(), 2);
        assert_eq!(session.txn_number(), 2);
    }
}
