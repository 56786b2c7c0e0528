//! Connection registry: session and address indexes.
//!
//! Uniqueness invariant: each address maps to at most one live connection,
//! each session to exactly one. `bind_address` fails only when a
//! *different* live connection owns the address; rebinding the same
//! connection is a refresh, and reassigning a connection's address removes
//! the old mapping before inserting the new one.

use std::collections::HashMap;

use crate::connection::{Connection, SessionId};

/// Returned by [`ConnectionRegistry::bind_address`] when the address is
/// owned by another live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressInUse;

/// Session- and address-indexed map of live connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    by_session: HashMap<SessionId, Connection>,
    by_address: HashMap<String, SessionId>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly attached connection.
    pub fn insert(&mut self, conn: Connection) {
        self.by_session.insert(conn.session_id, conn);
    }

    /// Bind `address` to `session`.
    ///
    /// # Errors
    ///
    /// Returns [`AddressInUse`] if another live connection holds the
    /// address. The caller's previous address, if any, is released first.
    pub fn bind_address(&mut self, session: SessionId, address: &str) -> Result<(), AddressInUse> {
        if let Some(&owner) = self.by_address.get(address) {
            if owner != session {
                return Err(AddressInUse);
            }
        }

        let Some(conn) = self.by_session.get_mut(&session) else {
            return Ok(());
        };

        if let Some(old) = conn.address.take() {
            if old != address {
                self.by_address.remove(&old);
            }
        }
        conn.address = Some(address.to_string());
        self.by_address.insert(address.to_string(), session);
        Ok(())
    }

    /// Release a connection's address mapping, keeping the session.
    pub fn unbind(&mut self, session: SessionId) {
        if let Some(conn) = self.by_session.get_mut(&session) {
            if let Some(address) = conn.address.take() {
                self.by_address.remove(&address);
            }
        }
    }

    /// Remove a connection entirely, returning its record.
    pub fn remove(&mut self, session: SessionId) -> Option<Connection> {
        let conn = self.by_session.remove(&session)?;
        if let Some(address) = conn.address.as_deref() {
            // Only clear the index if it still points at this session.
            if self.by_address.get(address) == Some(&session) {
                self.by_address.remove(address);
            }
        }
        Some(conn)
    }

    #[must_use]
    pub fn by_session(&self, session: SessionId) -> Option<&Connection> {
        self.by_session.get(&session)
    }

    pub fn by_session_mut(&mut self, session: SessionId) -> Option<&mut Connection> {
        self.by_session.get_mut(&session)
    }

    #[must_use]
    pub fn by_address(&self, address: &str) -> Option<&Connection> {
        let session = self.by_address.get(address)?;
        self.by_session.get(session)
    }

    pub fn by_address_mut(&mut self, address: &str) -> Option<&mut Connection> {
        let session = *self.by_address.get(address)?;
        self.by_session.get_mut(&session)
    }

    #[must_use]
    pub fn session_for(&self, address: &str) -> Option<SessionId> {
        self.by_address.get(address).copied()
    }

    /// All live connections.
    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.by_session.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_session.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_session.is_empty()
    }

    /// Number of connections with a bound address.
    #[must_use]
    pub fn registered_count(&self) -> usize {
        self.by_address.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::DialRateLimiter;
    use std::time::Duration;
    use switchboard_transport::pair;
    use uuid::Uuid;

    fn attach(reg: &mut ConnectionRegistry) -> SessionId {
        let (sink, _rx) = pair();
        let session = Uuid::new_v4();
        // The receiver half is dropped; sends fail silently, which these
        // tests never exercise.
        reg.insert(Connection::new(
            session,
            sink,
            DialRateLimiter::new(100, Duration::from_secs(60)),
        ));
        session
    }

    #[test]
    fn test_bind_and_lookup() {
        let mut reg = ConnectionRegistry::new();
        let s1 = attach(&mut reg);

        reg.bind_address(s1, "a@x.y").unwrap();
        assert_eq!(reg.by_address("a@x.y").unwrap().session_id, s1);
        assert_eq!(reg.session_for("a@x.y"), Some(s1));
        assert_eq!(reg.registered_count(), 1);
    }

    #[test]
    fn test_bind_conflict() {
        let mut reg = ConnectionRegistry::new();
        let s1 = attach(&mut reg);
        let s2 = attach(&mut reg);

        reg.bind_address(s1, "a@x.y").unwrap();
        assert_eq!(reg.bind_address(s2, "a@x.y"), Err(AddressInUse));
        // The loser keeps no address.
        assert_eq!(reg.by_session(s2).unwrap().address, None);
    }

    #[test]
    fn test_rebind_same_connection_is_refresh() {
        let mut reg = ConnectionRegistry::new();
        let s1 = attach(&mut reg);

        reg.bind_address(s1, "a@x.y").unwrap();
        reg.bind_address(s1, "a@x.y").unwrap();
        assert_eq!(reg.registered_count(), 1);
    }

    #[test]
    fn test_reassign_releases_old_address() {
        let mut reg = ConnectionRegistry::new();
        let s1 = attach(&mut reg);

        reg.bind_address(s1, "a@x.y").unwrap();
        reg.bind_address(s1, "b@x.y").unwrap();

        assert!(reg.by_address("a@x.y").is_none());
        assert_eq!(reg.by_address("b@x.y").unwrap().session_id, s1);

        // The freed address is immediately bindable by someone else.
        let s2 = attach(&mut reg);
        assert!(reg.bind_address(s2, "a@x.y").is_ok());
    }

    #[test]
    fn test_remove_clears_both_indexes() {
        let mut reg = ConnectionRegistry::new();
        let s1 = attach(&mut reg);
        reg.bind_address(s1, "a@x.y").unwrap();

        let conn = reg.remove(s1).unwrap();
        assert_eq!(conn.address.as_deref(), Some("a@x.y"));
        assert!(reg.by_session(s1).is_none());
        assert!(reg.by_address("a@x.y").is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_unbind_keeps_session() {
        let mut reg = ConnectionRegistry::new();
        let s1 = attach(&mut reg);
        reg.bind_address(s1, "a@x.y").unwrap();

        reg.unbind(s1);
        assert!(reg.by_address("a@x.y").is_none());
        assert!(reg.by_session(s1).is_some());
    }
}
