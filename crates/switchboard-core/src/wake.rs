//! Wake-on-ring: profiles that outlive their connection and the pending
//! dials queued behind a sleeping address.
//!
//! The profile store is a process-wide side map keyed by address: entries
//! are created when a wake-configured connection sleeps, unregisters, or
//! times out, and cleared whenever the address is re-bound. Pending dials
//! are FIFO per address; completion reuses the call id generated at dial
//! time so the caller's state tracking stays valid.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::calls::CallId;
use crate::connection::SessionId;

/// Minimum wake timeout. Handlers may configure less; the timer floors
/// here.
pub const MIN_WAKE_TIMEOUT: Duration = Duration::from_millis(100);

/// How a sleeping address gets revived.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WakeHandler {
    Webhook {
        url: String,
        #[serde(rename = "timeout_seconds", serialize_with = "as_seconds")]
        timeout: Duration,
    },
    Spawn {
        command: Vec<String>,
        #[serde(rename = "timeout_seconds", serialize_with = "as_seconds")]
        timeout: Duration,
    },
}

fn as_seconds<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl WakeHandler {
    /// Per-attempt deadline, floored at [`MIN_WAKE_TIMEOUT`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        let configured = match self {
            WakeHandler::Webhook { timeout, .. } | WakeHandler::Spawn { timeout, .. } => *timeout,
        };
        configured.max(MIN_WAKE_TIMEOUT)
    }
}

/// The persisted configuration used to revive a sleeping address.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WakeProfile {
    pub address: String,
    pub handler: WakeHandler,
}

/// A dial queued while its callee sleeps.
#[derive(Debug, Clone)]
pub struct PendingWakeCall {
    pub call_id: CallId,
    pub caller: SessionId,
    pub caller_address: String,
    pub callee_address: String,
    pub metadata: Option<Value>,
}

/// Wake executor failure.
#[derive(Debug, Error)]
pub enum WakeError {
    #[error("wake request failed: {0}")]
    Request(String),

    #[error("wake handler timed out")]
    Timeout,

    #[error("wake command exited with status {0}")]
    NonZeroExit(i32),
}

/// The single async collaborator invoked from the dispatch path.
///
/// Fire-and-forget from the exchange's perspective: success does nothing
/// on its own (only the woken agent's REGISTER completes the call), and
/// failure is posted back as an internal event.
#[async_trait]
pub trait WakeExecutor: Send + Sync {
    async fn wake(&self, profile: &WakeProfile) -> Result<(), WakeError>;
}

/// Executor that logs and reports success; used in tests and as the
/// default when no real handler transport is wired up.
#[derive(Debug, Default)]
pub struct NoopWakeExecutor;

#[async_trait]
impl WakeExecutor for NoopWakeExecutor {
    async fn wake(&self, profile: &WakeProfile) -> Result<(), WakeError> {
        info!(address = %profile.address, "noop wake executor invoked");
        Ok(())
    }
}

/// Profiles and pending dial queues, keyed by address.
#[derive(Debug, Default)]
pub struct WakeStore {
    profiles: HashMap<String, WakeProfile>,
    pending: HashMap<String, VecDeque<PendingWakeCall>>,
}

impl WakeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist a profile for a sleeping address.
    pub fn store_profile(&mut self, profile: WakeProfile) {
        self.profiles.insert(profile.address.clone(), profile);
    }

    /// Remove and return the profile for an address.
    pub fn take_profile(&mut self, address: &str) -> Option<WakeProfile> {
        self.profiles.remove(address)
    }

    #[must_use]
    pub fn profile(&self, address: &str) -> Option<&WakeProfile> {
        self.profiles.get(address)
    }

    /// Append a pending dial to the address's FIFO queue.
    pub fn enqueue(&mut self, call: PendingWakeCall) {
        self.pending
            .entry(call.callee_address.clone())
            .or_default()
            .push_back(call);
    }

    /// Pop the oldest pending dial for an address.
    pub fn dequeue(&mut self, address: &str) -> Option<PendingWakeCall> {
        let queue = self.pending.get_mut(address)?;
        let call = queue.pop_front();
        if queue.is_empty() {
            self.pending.remove(address);
        }
        call
    }

    /// Remove a specific pending call (wake timeout or failure path).
    pub fn remove_call(&mut self, address: &str, call_id: CallId) -> Option<PendingWakeCall> {
        let queue = self.pending.get_mut(address)?;
        let idx = queue.iter().position(|c| c.call_id == call_id)?;
        let call = queue.remove(idx);
        if queue.is_empty() {
            self.pending.remove(address);
        }
        call
    }

    /// Remove every pending call placed by `caller`, returning them.
    pub fn remove_by_caller(&mut self, caller: SessionId) -> Vec<PendingWakeCall> {
        let mut removed = Vec::new();
        self.pending.retain(|_, queue| {
            let mut kept = VecDeque::with_capacity(queue.len());
            while let Some(call) = queue.pop_front() {
                if call.caller == caller {
                    removed.push(call);
                } else {
                    kept.push_back(call);
                }
            }
            *queue = kept;
            !queue.is_empty()
        });
        removed
    }

    #[must_use]
    pub fn pending_count(&self, address: &str) -> usize {
        self.pending.get(address).map_or(0, VecDeque::len)
    }

    #[must_use]
    pub fn total_pending(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    #[must_use]
    pub fn profile_count(&self) -> usize {
        self.profiles.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn profile(address: &str) -> WakeProfile {
        WakeProfile {
            address: address.to_string(),
            handler: WakeHandler::Webhook {
                url: "http://localhost:9/wake".into(),
                timeout: Duration::from_secs(1),
            },
        }
    }

    fn pending(callee: &str, caller: SessionId) -> PendingWakeCall {
        PendingWakeCall {
            call_id: Uuid::new_v4(),
            caller,
            caller_address: "caller@x.y".into(),
            callee_address: callee.to_string(),
            metadata: None,
        }
    }

    #[test]
    fn test_profile_take_removes() {
        let mut store = WakeStore::new();
        store.store_profile(profile("bot@x.y"));

        assert!(store.profile("bot@x.y").is_some());
        assert!(store.take_profile("bot@x.y").is_some());
        assert!(store.profile("bot@x.y").is_none());
    }

    #[test]
    fn test_queue_is_fifo() {
        let mut store = WakeStore::new();
        let caller = Uuid::new_v4();
        let first = pending("bot@x.y", caller);
        let second = pending("bot@x.y", caller);
        let first_id = first.call_id;
        let second_id = second.call_id;

        store.enqueue(first);
        store.enqueue(second);

        assert_eq!(store.dequeue("bot@x.y").unwrap().call_id, first_id);
        assert_eq!(store.dequeue("bot@x.y").unwrap().call_id, second_id);
        assert!(store.dequeue("bot@x.y").is_none());
    }

    #[test]
    fn test_remove_specific_call() {
        let mut store = WakeStore::new();
        let caller = Uuid::new_v4();
        let kept = pending("bot@x.y", caller);
        let removed = pending("bot@x.y", caller);
        let kept_id = kept.call_id;
        let removed_id = removed.call_id;

        store.enqueue(kept);
        store.enqueue(removed);

        assert!(store.remove_call("bot@x.y", removed_id).is_some());
        assert!(store.remove_call("bot@x.y", removed_id).is_none());
        assert_eq!(store.dequeue("bot@x.y").unwrap().call_id, kept_id);
    }

    #[test]
    fn test_remove_by_caller_preserves_others() {
        let mut store = WakeStore::new();
        let gone = Uuid::new_v4();
        let stays = Uuid::new_v4();

        store.enqueue(pending("bot@x.y", gone));
        store.enqueue(pending("bot@x.y", stays));
        store.enqueue(pending("other@x.y", gone));

        let removed = store.remove_by_caller(gone);
        assert_eq!(removed.len(), 2);
        assert_eq!(store.total_pending(), 1);
        assert_eq!(store.dequeue("bot@x.y").unwrap().caller, stays);
    }

    #[test]
    fn test_timeout_floor() {
        let handler = WakeHandler::Spawn {
            command: vec!["true".into()],
            timeout: Duration::from_millis(5),
        };
        assert_eq!(handler.timeout(), MIN_WAKE_TIMEOUT);
    }
}
