//! Per-session connection state.
//!
//! One [`Connection`] exists per transport session. The record carries the
//! bound address, status, concurrency discipline, active call set, and the
//! wake/auto-sleep configuration; the exchange mutates it only under the
//! dispatch lock.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use switchboard_transport::{close_codes, FrameSink};
use tracing::debug;
use uuid::Uuid;

use crate::calls::CallId;
use crate::ratelimit::DialRateLimiter;
use crate::wake::WakeHandler;
use switchboard_protocol::Frame;

/// Unique identifier for a transport session.
pub type SessionId = Uuid;

/// Connection status.
///
/// The manual status is what the client last set; the effective status
/// reported by presence is `Busy` whenever the connection participates in
/// a call (or is waiting on a wake), regardless of the manual value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Available,
    Busy,
    Dnd,
    Away,
}

impl Status {
    /// Wire form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Available => "available",
            Status::Busy => "busy",
            Status::Dnd => "dnd",
            Status::Away => "away",
        }
    }
}

impl FromStr for Status {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(Status::Available),
            "busy" => Ok(Status::Busy),
            "dnd" => Ok(Status::Dnd),
            "away" => Ok(Status::Away),
            _ => Err(()),
        }
    }
}

/// Dispatch discipline of an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Concurrency {
    /// At most one active call.
    #[default]
    Single,
    /// One shared session fanning out to listeners.
    Broadcast { max_listeners: Option<usize> },
    /// Independent point-to-point calls up to an optional cap.
    Parallel { max_sessions: Option<usize> },
}

impl Concurrency {
    /// Wire label for logs and errors.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Concurrency::Single => "single",
            Concurrency::Broadcast { .. } => "broadcast",
            Concurrency::Parallel { .. } => "parallel",
        }
    }
}

/// Auto-sleep configuration set via STATUS.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutoSleep {
    pub idle_timeout: Duration,
    pub wake_on_ring: bool,
}

/// Downstream exchange identity, set by REGISTER_PBX.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub domain: String,
    pub endpoint: Option<String>,
}

/// Why a connection is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ClientRequested,
    Timeout,
    Sleep,
    PeerDisconnected,
    Shutdown,
    Reconfigured,
}

impl DisconnectReason {
    /// Wire form, used for HANGUP propagation and close reasons.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DisconnectReason::ClientRequested => "client_requested",
            DisconnectReason::Timeout => "timeout",
            DisconnectReason::Sleep => "sleep",
            DisconnectReason::PeerDisconnected => "peer_disconnected",
            DisconnectReason::Shutdown => "shutdown",
            DisconnectReason::Reconfigured => "reconfigured",
        }
    }

    /// Transport close code for this reason.
    #[must_use]
    pub fn close_code(self) -> u16 {
        match self {
            DisconnectReason::ClientRequested => close_codes::NORMAL,
            DisconnectReason::Timeout => close_codes::TIMEOUT,
            DisconnectReason::Sleep => close_codes::SLEEP,
            DisconnectReason::PeerDisconnected => close_codes::PEER_DISCONNECTED,
            DisconnectReason::Shutdown => close_codes::SHUTDOWN,
            DisconnectReason::Reconfigured => close_codes::RECONFIGURED,
        }
    }
}

/// A live transport session and everything the exchange knows about it.
pub struct Connection {
    pub session_id: SessionId,
    sink: Arc<dyn FrameSink>,
    pub address: Option<String>,
    pub metadata: Option<Value>,
    manual_status: Status,
    pub concurrency: Concurrency,
    /// Calls this connection participates in; each id resolves to a Call
    /// or a BroadcastSession containing this connection.
    pub active_calls: HashSet<CallId>,
    /// Dials by this connection queued behind a sleeping callee.
    pub pending_wake: HashSet<CallId>,
    pub auto_sleep: Option<AutoSleep>,
    pub wake_handler: Option<WakeHandler>,
    pub last_heartbeat: Instant,
    /// Bumped on every activity; a fired idle/sleep timer with a stale
    /// epoch is a no-op.
    pub idle_epoch: u64,
    /// Whether the SLEEP_PENDING warning has been sent this idle cycle.
    pub sleep_pending: bool,
    pub dial_limiter: DialRateLimiter,
    pub peer: Option<PeerInfo>,
}

impl Connection {
    /// Create a fresh connection for a transport session.
    #[must_use]
    pub fn new(session_id: SessionId, sink: Arc<dyn FrameSink>, dial_limiter: DialRateLimiter) -> Self {
        Self {
            session_id,
            sink,
            address: None,
            metadata: None,
            manual_status: Status::Available,
            concurrency: Concurrency::Single,
            active_calls: HashSet::new(),
            pending_wake: HashSet::new(),
            auto_sleep: None,
            wake_handler: None,
            last_heartbeat: Instant::now(),
            idle_epoch: 0,
            sleep_pending: false,
            dial_limiter,
            peer: None,
        }
    }

    /// The status the client last set.
    #[must_use]
    pub fn manual_status(&self) -> Status {
        self.manual_status
    }

    pub fn set_manual_status(&mut self, status: Status) {
        self.manual_status = status;
    }

    /// Effective status: busy while in (or waiting on) any call, the
    /// manual value otherwise.
    #[must_use]
    pub fn status(&self) -> Status {
        if self.manual_status == Status::Available
            && !(self.active_calls.is_empty() && self.pending_wake.is_empty())
        {
            Status::Busy
        } else {
            self.manual_status
        }
    }

    /// Queue a frame for this connection.
    ///
    /// Transport send failures are logged and ignored; a dead peer is
    /// reconciled by the heartbeat sweep.
    pub fn send(&self, frame: Frame) {
        if let Err(e) = self.sink.send(frame) {
            debug!(session = %self.session_id, error = %e, "outbound send failed");
        }
    }

    /// Close the underlying transport.
    pub fn close(&self, code: u16, reason: &str) {
        self.sink.close(code, reason);
    }

    /// Whether a new point-to-point call can be admitted right now.
    #[must_use]
    pub fn at_capacity(&self) -> bool {
        match self.concurrency {
            Concurrency::Single => !self.active_calls.is_empty(),
            Concurrency::Broadcast { .. } => false,
            Concurrency::Parallel { max_sessions } => {
                max_sessions.is_some_and(|cap| self.active_calls.len() >= cap)
            }
        }
    }

    /// Whether this connection has wake-on-ring configured.
    #[must_use]
    pub fn wake_on_ring(&self) -> bool {
        self.wake_handler.is_some()
    }

    /// Invalidate any armed idle/sleep timer and return the new epoch.
    pub fn bump_idle_epoch(&mut self) -> u64 {
        self.idle_epoch += 1;
        self.sleep_pending = false;
        self.idle_epoch
    }

    /// Whether the idle timer should be armed: auto-sleep requested with
    /// wake-on-ring and nothing keeping the connection awake.
    #[must_use]
    pub fn idle_eligible(&self) -> bool {
        self.auto_sleep.is_some_and(|a| a.wake_on_ring)
            && self.active_calls.is_empty()
            && self.pending_wake.is_empty()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("session_id", &self.session_id)
            .field("address", &self.address)
            .field("status", &self.status())
            .field("concurrency", &self.concurrency.label())
            .field("active_calls", &self.active_calls.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_transport::pair;

    fn test_conn() -> (Connection, switchboard_transport::ChannelReceiver) {
        let (sink, rx) = pair();
        let conn = Connection::new(
            Uuid::new_v4(),
            sink,
            DialRateLimiter::new(100, Duration::from_secs(60)),
        );
        (conn, rx)
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("dnd".parse(), Ok(Status::Dnd));
        assert_eq!("available".parse(), Ok(Status::Available));
        assert!(Status::from_str("offline").is_err());
    }

    #[test]
    fn test_effective_status_tracks_calls() {
        let (mut conn, _rx) = test_conn();
        assert_eq!(conn.status(), Status::Available);

        conn.active_calls.insert(Uuid::new_v4());
        assert_eq!(conn.status(), Status::Busy);

        conn.active_calls.clear();
        assert_eq!(conn.status(), Status::Available);
    }

    #[test]
    fn test_manual_status_survives_call_end() {
        let (mut conn, _rx) = test_conn();
        conn.set_manual_status(Status::Away);
        conn.active_calls.insert(Uuid::new_v4());
        assert_eq!(conn.status(), Status::Away);

        conn.active_calls.clear();
        assert_eq!(conn.status(), Status::Away);
    }

    #[test]
    fn test_capacity_single() {
        let (mut conn, _rx) = test_conn();
        assert!(!conn.at_capacity());
        conn.active_calls.insert(Uuid::new_v4());
        assert!(conn.at_capacity());
    }

    #[test]
    fn test_capacity_parallel() {
        let (mut conn, _rx) = test_conn();
        conn.concurrency = Concurrency::Parallel {
            max_sessions: Some(2),
        };
        conn.active_calls.insert(Uuid::new_v4());
        assert!(!conn.at_capacity());
        conn.active_calls.insert(Uuid::new_v4());
        assert!(conn.at_capacity());

        conn.concurrency = Concurrency::Parallel { max_sessions: None };
        assert!(!conn.at_capacity());
    }

    #[test]
    fn test_idle_eligibility() {
        let (mut conn, _rx) = test_conn();
        assert!(!conn.idle_eligible());

        conn.auto_sleep = Some(AutoSleep {
            idle_timeout: Duration::from_secs(30),
            wake_on_ring: true,
        });
        assert!(conn.idle_eligible());

        conn.active_calls.insert(Uuid::new_v4());
        assert!(!conn.idle_eligible());
    }
}
