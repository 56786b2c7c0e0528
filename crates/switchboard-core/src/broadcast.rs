//! Broadcast sessions: one broadcaster fanning out to a listener set.
//!
//! A broadcast-registered address has at most one session, created lazily
//! when the first listener dials in and destroyed when the broadcaster
//! leaves or the listener set empties. Listener insertion is keyed by
//! session so duplicate joins stay idempotent.

use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

use crate::calls::CallId;
use crate::connection::SessionId;

/// Shared call state between a broadcaster and its listeners.
#[derive(Debug)]
pub struct BroadcastSession {
    pub call_id: CallId,
    pub broadcaster: SessionId,
    pub broadcaster_address: String,
    /// Listener session -> listener address at join time.
    listeners: HashMap<SessionId, String>,
    pub active: bool,
    pub metadata: Option<Value>,
}

impl BroadcastSession {
    #[must_use]
    pub fn new(broadcaster: SessionId, broadcaster_address: String, metadata: Option<Value>) -> Self {
        Self {
            call_id: Uuid::new_v4(),
            broadcaster,
            broadcaster_address,
            listeners: HashMap::new(),
            active: true,
            metadata,
        }
    }

    /// Add a listener. Returns `false` if the session was already joined.
    pub fn add_listener(&mut self, session: SessionId, address: String) -> bool {
        self.listeners.insert(session, address).is_none()
    }

    /// Remove a listener, returning its join-time address.
    pub fn remove_listener(&mut self, session: SessionId) -> Option<String> {
        self.listeners.remove(&session)
    }

    #[must_use]
    pub fn has_listener(&self, session: SessionId) -> bool {
        self.listeners.contains_key(&session)
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Whether a cap of `max_listeners` leaves no room for another join.
    #[must_use]
    pub fn is_full(&self, max_listeners: Option<usize>) -> bool {
        max_listeners.is_some_and(|cap| self.listeners.len() >= cap)
    }

    /// Listener sessions, for fan-out.
    pub fn listener_sessions(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.listeners.keys().copied()
    }
}

/// Table of active broadcast sessions, indexed by call id and by
/// broadcaster session.
#[derive(Debug, Default)]
pub struct BroadcastTable {
    by_call: HashMap<CallId, BroadcastSession>,
    by_broadcaster: HashMap<SessionId, CallId>,
}

impl BroadcastTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session for a broadcaster, returning its call id.
    pub fn create(&mut self, session: BroadcastSession) -> CallId {
        let call_id = session.call_id;
        self.by_broadcaster.insert(session.broadcaster, call_id);
        self.by_call.insert(call_id, session);
        call_id
    }

    #[must_use]
    pub fn get(&self, call_id: CallId) -> Option<&BroadcastSession> {
        self.by_call.get(&call_id)
    }

    pub fn get_mut(&mut self, call_id: CallId) -> Option<&mut BroadcastSession> {
        self.by_call.get_mut(&call_id)
    }

    #[must_use]
    pub fn for_broadcaster(&self, session: SessionId) -> Option<&BroadcastSession> {
        let call_id = self.by_broadcaster.get(&session)?;
        self.by_call.get(call_id)
    }

    pub fn for_broadcaster_mut(&mut self, session: SessionId) -> Option<&mut BroadcastSession> {
        let call_id = *self.by_broadcaster.get(&session)?;
        self.by_call.get_mut(&call_id)
    }

    /// Destroy a session, returning the record.
    pub fn remove(&mut self, call_id: CallId) -> Option<BroadcastSession> {
        let session = self.by_call.remove(&call_id)?;
        self.by_broadcaster.remove(&session.broadcaster);
        Some(session)
    }

    #[must_use]
    pub fn contains(&self, call_id: CallId) -> bool {
        self.by_call.contains_key(&call_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_call.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_call.is_empty()
    }
}
