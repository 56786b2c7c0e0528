//! Point-to-point call records.
//!
//! A call moves `Ringing -> Connected -> Ended` with no back-transitions;
//! the terminal state releases the record from the table.

use std::collections::HashMap;
use std::time::SystemTime;

use serde_json::Value;
use uuid::Uuid;

use crate::connection::SessionId;

/// Unique identifier for a call. Shared namespace with broadcast
/// sessions; lookups check the point-to-point table first.
pub type CallId = Uuid;

/// Lifecycle state of a point-to-point call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Ringing,
    Connected,
    Ended,
}

impl CallState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Ended)
    }
}

/// A point-to-point call between two connections.
#[derive(Debug)]
pub struct Call {
    pub id: CallId,
    pub caller: SessionId,
    pub callee: SessionId,
    pub caller_address: String,
    pub callee_address: String,
    pub state: CallState,
    pub started_at: SystemTime,
    pub ended_at: Option<SystemTime>,
    pub end_reason: Option<String>,
    pub metadata: Option<Value>,
}

impl Call {
    /// Create a ringing call.
    #[must_use]
    pub fn new(
        id: CallId,
        caller: SessionId,
        callee: SessionId,
        caller_address: String,
        callee_address: String,
        metadata: Option<Value>,
    ) -> Self {
        Self {
            id,
            caller,
            callee,
            caller_address,
            callee_address,
            state: CallState::Ringing,
            started_at: SystemTime::now(),
            ended_at: None,
            end_reason: None,
            metadata,
        }
    }

    #[must_use]
    pub fn is_participant(&self, session: SessionId) -> bool {
        self.caller == session || self.callee == session
    }

    /// The other participant, if `session` is one.
    #[must_use]
    pub fn other_party(&self, session: SessionId) -> Option<SessionId> {
        if session == self.caller {
            Some(self.callee)
        } else if session == self.callee {
            Some(self.caller)
        } else {
            None
        }
    }

    /// Transition to connected. Only valid while ringing.
    pub fn connect(&mut self) {
        debug_assert_eq!(self.state, CallState::Ringing);
        self.state = CallState::Connected;
    }

    /// Transition to ended with a reason.
    pub fn end(&mut self, reason: impl Into<String>) {
        self.state = CallState::Ended;
        self.ended_at = Some(SystemTime::now());
        self.end_reason = Some(reason.into());
    }
}

/// Table of active point-to-point calls.
#[derive(Debug, Default)]
pub struct CallTable {
    calls: HashMap<CallId, Call>,
}

impl CallTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, call: Call) {
        self.calls.insert(call.id, call);
    }

    #[must_use]
    pub fn get(&self, id: CallId) -> Option<&Call> {
        self.calls.get(&id)
    }

    pub fn get_mut(&mut self, id: CallId) -> Option<&mut Call> {
        self.calls.get_mut(&id)
    }

    pub fn remove(&mut self, id: CallId) -> Option<Call> {
        self.calls.remove(&id)
    }

    #[must_use]
    pub fn contains(&self, id: CallId) -> bool {
        self.calls.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}
