//! Admitted sessions, capped by insertion order.
//!
//! The registry holds connection identifiers, never the sockets themselves.
//! Whether a connection is still open is checked against the live connection
//! table at delivery time.

use std::collections::{HashMap, VecDeque};

use relay_core::{ConnectionId, SessionId};

/// A connection that presented a valid token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub token: String,
    pub connection: ConnectionId,
    valid: bool,
}

impl Session {
    /// Advisory only. Invalidation is enforced by closing the connection.
    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

pub struct SessionRegistry {
    capacity: usize,
    order: VecDeque<SessionId>,
    sessions: HashMap<SessionId, Session>,
    /// Sessions per token, oldest first.
    by_token: HashMap<String, Vec<SessionId>>,
    by_connection: HashMap<ConnectionId, SessionId>,
}

impl SessionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            sessions: HashMap::new(),
            by_token: HashMap::new(),
            by_connection: HashMap::new(),
        }
    }

    /// Register a session for `connection`, binding `token` to it.
    ///
    /// A connection holds at most one session; re-admission replaces it. Several
    /// sessions may share a token; the newest remaining one gets direct
    /// delivery. Returns the sessions
    /// evicted to stay within capacity, oldest first.
    pub fn admit(&mut self, token: &str, connection: ConnectionId) -> (SessionId, Vec<Session>) {
        if let Some(previous) = self.by_connection.get(&connection).cloned() {
            self.remove(&previous);
        }

        let session = Session {
            id: SessionId::new(),
            token: token.to_owned(),
            connection: connection.clone(),
            valid: true,
        };
        let id = session.id.clone();
        self.order.push_back(id.clone());
        self.by_token
            .entry(session.token.clone())
            .or_default()
            .push(id.clone());
        self.by_connection.insert(connection, id.clone());
        self.sessions.insert(id.clone(), session);

        let mut evicted = Vec::new();
        while self.sessions.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if let Some(session) = self.remove(&oldest) {
                evicted.push(session);
            }
        }
        (id, evicted)
    }

    pub fn get(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn for_token(&self, token: &str) -> Option<&Session> {
        self.by_token
            .get(token)
            .and_then(|ids| ids.last())
            .and_then(|id| self.sessions.get(id))
    }

    pub fn for_connection(&self, connection: &ConnectionId) -> Option<&Session> {
        self.by_connection.get(connection).and_then(|id| self.sessions.get(id))
    }

    /// Mark a session invalid and drop it. Returns it so the caller can close
    /// its connection.
    pub fn invalidate(&mut self, id: &SessionId) -> Option<Session> {
        let mut session = self.remove(id)?;
        session.valid = false;
        Some(session)
    }

    /// Invalidate every session that ever bound `token`.
    pub fn invalidate_token(&mut self, token: &str) -> Vec<Session> {
        let ids = self.by_token.get(token).cloned().unwrap_or_default();
        ids.iter().filter_map(|id| self.invalidate(id)).collect()
    }

    pub fn remove_connection(&mut self, connection: &ConnectionId) -> Option<Session> {
        let id = self.by_connection.get(connection)?.clone();
        self.remove(&id)
    }

    /// Valid sessions in admission order.
    pub fn valid_sessions(&self) -> impl Iterator<Item = &Session> {
        self.order
            .iter()
            .filter_map(|id| self.sessions.get(id))
            .filter(|s| s.valid)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn remove(&mut self, id: &SessionId) -> Option<Session> {
        let session = self.sessions.remove(id)?;
        self.order.retain(|queued| queued != id);
        if let Some(ids) = self.by_token.get_mut(&session.token) {
            ids.retain(|bound| bound != id);
            if ids.is_empty() {
                self.by_token.remove(&session.token);
            }
        }
        if self.by_connection.get(&session.connection) == Some(id) {
            self.by_connection.remove(&session.connection);
        }
        Some(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admit_and_lookup() {
        let mut registry = SessionRegistry::new(10);
        let conn = ConnectionId::new();
        let (id, evicted) = registry.admit("tok-a", conn.clone());
        assert!(evicted.is_empty());
        assert_eq!(registry.for_token("tok-a").unwrap().id, id);
        assert_eq!(registry.for_connection(&conn).unwrap().id, id);
        assert!(registry.get(&id).unwrap().is_valid());
        assert!(registry.for_token("tok-b").is_none());
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let mut registry = SessionRegistry::new(2);
        let (first, _) = registry.admit("a", ConnectionId::new());
        let (second, _) = registry.admit("b", ConnectionId::new());
        let (third, evicted) = registry.admit("c", ConnectionId::new());

        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, first);
        assert_eq!(registry.len(), 2);
        assert!(registry.for_token("a").is_none());
        let order: Vec<_> = registry.valid_sessions().map(|s| s.id.clone()).collect();
        assert_eq!(order, [second, third]);
    }

    #[test]
    fn readmitting_a_connection_replaces_its_session() {
        let mut registry = SessionRegistry::new(10);
        let conn = ConnectionId::new();
        let (old, _) = registry.admit("a", conn.clone());
        let (new, _) = registry.admit("b", conn.clone());

        assert_eq!(registry.len(), 1);
        assert!(registry.get(&old).is_none());
        assert!(registry.for_token("a").is_none());
        assert_eq!(registry.for_connection(&conn).unwrap().id, new);
    }

    #[test]
    fn newest_session_owns_the_token() {
        let mut registry = SessionRegistry::new(10);
        let (old, _) = registry.admit("shared", ConnectionId::new());
        let (new, _) = registry.admit("shared", ConnectionId::new());
        assert_eq!(registry.for_token("shared").unwrap().id, new);

        // Dropping the older session leaves the newer binding intact.
        registry.invalidate(&old);
        assert_eq!(registry.for_token("shared").unwrap().id, new);
    }

    #[test]
    fn older_session_takes_over_the_token_when_the_newest_leaves() {
        let mut registry = SessionRegistry::new(10);
        let first_tab = ConnectionId::new();
        let second_tab = ConnectionId::new();
        let (old, _) = registry.admit("shared", first_tab.clone());
        registry.admit("shared", second_tab.clone());

        registry.remove_connection(&second_tab);
        assert_eq!(registry.for_token("shared").unwrap().id, old);

        registry.remove_connection(&first_tab);
        assert!(registry.for_token("shared").is_none());
    }

    #[test]
    fn invalidate_token_returns_every_bound_session() {
        let mut registry = SessionRegistry::new(10);
        registry.admit("shared", ConnectionId::new());
        registry.admit("shared", ConnectionId::new());
        registry.admit("other", ConnectionId::new());

        let dropped = registry.invalidate_token("shared");
        assert_eq!(dropped.len(), 2);
        assert!(dropped.iter().all(|s| !s.is_valid()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_connection() {
        let mut registry = SessionRegistry::new(10);
        let conn = ConnectionId::new();
        registry.admit("a", conn.clone());
        assert!(registry.remove_connection(&conn).is_some());
        assert!(registry.remove_connection(&conn).is_none());
        assert!(registry.is_empty());
    }
}
