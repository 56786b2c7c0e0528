//! Frame types for the Switchboard exchange protocol.
//!
//! Frames are JSON objects tagged by an upper-case `type` field. One enum
//! covers both directions; the exchange decides which types it accepts
//! inbound.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reasons a `REGISTER` can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterFailReason {
    AddressInUse,
    InvalidAddress,
    AuthFailed,
}

/// Reasons a dial attempt comes back `BUSY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyReason {
    NoSuchAddress,
    AlreadyInCall,
    Dnd,
    Away,
    Busy,
    MaxListenersReached,
    MaxSessionsReached,
    Timeout,
    WakeFailed,
    CallerUnavailable,
}

/// Reasons carried by `ERROR` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    InvalidPayload,
    NotRegistered,
    RateLimited,
}

/// Wake handler description as supplied on `REGISTER`.
///
/// Fields are loose on purpose: shape is checked here, ranges and
/// cross-field requirements (webhook needs a URL, spawn needs a command,
/// both need a positive timeout) are checked by the exchange so it can
/// answer with a precise `invalid_payload` detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WakeHandlerSpec {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<f64>,
}

/// Auto-sleep request carried on `STATUS`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoSleepSpec {
    pub idle_timeout_seconds: f64,
    pub wake_on_ring: bool,
}

/// Geo filter inside a presence query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearSpec {
    pub lat: f64,
    pub lon: f64,
    pub radius_km: f64,
}

/// Presence query filters. All fields optional; an empty query matches
/// every registered connection except the requester.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceQuerySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub near: Option<NearSpec>,
}

/// One row of a `PRESENCE_RESULT`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub address: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Bind an address to this connection.
    #[serde(rename = "REGISTER")]
    Register {
        address: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        concurrency: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_listeners: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_sessions: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pool_size: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wake_handler: Option<WakeHandlerSpec>,
        /// Opaque auth token, forwarded but never validated at this layer.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth: Option<String>,
    },

    /// Release the address and disconnect.
    #[serde(rename = "UNREGISTER")]
    Unregister,

    /// Update manual status and auto-sleep configuration.
    #[serde(rename = "STATUS")]
    Status {
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auto_sleep: Option<AutoSleepSpec>,
    },

    /// Keepalive.
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,

    /// Place a call.
    #[serde(rename = "DIAL")]
    Dial {
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },

    /// Accept a ringing call (callee only).
    #[serde(rename = "ANSWER")]
    Answer { call_id: String },

    /// Terminate a call. Outbound, `from` identifies a departing
    /// broadcast listener to the broadcaster.
    #[serde(rename = "HANGUP")]
    Hangup {
        call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },

    /// In-call message. `from` is filled in by the exchange on delivery.
    #[serde(rename = "MSG")]
    Msg {
        call_id: String,
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },

    /// Query who is reachable.
    #[serde(rename = "PRESENCE")]
    Presence {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        query: Option<PresenceQuerySpec>,
    },

    /// Agent is going to sleep; exchange persists its wake profile.
    #[serde(rename = "SLEEP_ACK")]
    SleepAck,

    /// A downstream exchange announcing the routes it serves.
    #[serde(rename = "REGISTER_PBX")]
    RegisterPbx {
        domain: String,
        routes: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth: Option<String>,
    },

    /// Address bound.
    #[serde(rename = "REGISTERED")]
    Registered { address: String, session_id: String },

    /// Registration rejected.
    #[serde(rename = "REGISTER_FAILED")]
    RegisterFailed { reason: RegisterFailReason },

    /// Keepalive acknowledgment.
    #[serde(rename = "HEARTBEAT_ACK")]
    HeartbeatAck { timestamp: u64 },

    /// Incoming call notification.
    #[serde(rename = "RING")]
    Ring {
        from: String,
        call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },

    /// Call accepted; delivered to the caller.
    #[serde(rename = "CONNECTED")]
    Connected { call_id: String, to: String },

    /// Dial rejected.
    #[serde(rename = "BUSY")]
    Busy { to: String, reason: BusyReason },

    /// Idle-timeout warning before the exchange puts the agent to sleep.
    #[serde(rename = "SLEEP_PENDING")]
    SleepPending {
        reason: String,
        seconds_until_sleep: f64,
    },

    /// Presence query result.
    #[serde(rename = "PRESENCE_RESULT")]
    PresenceResult { addresses: Vec<PresenceEntry> },

    /// Request-level failure.
    #[serde(rename = "ERROR")]
    Error {
        reason: ErrorReason,
        context: String,
        detail: String,
    },

    /// Downstream exchange accepted.
    #[serde(rename = "REGISTERED_PBX")]
    RegisteredPbx { domain: String },

    /// Downstream exchange rejected.
    #[serde(rename = "REGISTER_PBX_FAILED")]
    RegisterPbxFailed { reason: String },
}

impl Frame {
    /// The wire name of this frame's `type` tag.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Frame::Register { .. } => "REGISTER",
            Frame::Unregister => "UNREGISTER",
            Frame::Status { .. } => "STATUS",
            Frame::Heartbeat => "HEARTBEAT",
            Frame::Dial { .. } => "DIAL",
            Frame::Answer { .. } => "ANSWER",
            Frame::Hangup { .. } => "HANGUP",
            Frame::Msg { .. } => "MSG",
            Frame::Presence { .. } => "PRESENCE",
            Frame::SleepAck => "SLEEP_ACK",
            Frame::RegisterPbx { .. } => "REGISTER_PBX",
            Frame::Registered { .. } => "REGISTERED",
            Frame::RegisterFailed { .. } => "REGISTER_FAILED",
            Frame::HeartbeatAck { .. } => "HEARTBEAT_ACK",
            Frame::Ring { .. } => "RING",
            Frame::Connected { .. } => "CONNECTED",
            Frame::Busy { .. } => "BUSY",
            Frame::SleepPending { .. } => "SLEEP_PENDING",
            Frame::PresenceResult { .. } => "PRESENCE_RESULT",
            Frame::Error { .. } => "ERROR",
            Frame::RegisteredPbx { .. } => "REGISTERED_PBX",
            Frame::RegisterPbxFailed { .. } => "REGISTER_PBX_FAILED",
        }
    }

    /// Create a minimal REGISTER frame.
    #[must_use]
    pub fn register(address: impl Into<String>) -> Self {
        Frame::Register {
            address: address.into(),
            metadata: None,
            concurrency: None,
            max_listeners: None,
            max_sessions: None,
            pool_size: None,
            mode: None,
            wake_handler: None,
            auth: None,
        }
    }

    /// Create a DIAL frame.
    #[must_use]
    pub fn dial(to: impl Into<String>, metadata: Option<Value>) -> Self {
        Frame::Dial {
            to: to.into(),
            metadata,
        }
    }

    /// Create an ANSWER frame.
    #[must_use]
    pub fn answer(call_id: impl Into<String>) -> Self {
        Frame::Answer {
            call_id: call_id.into(),
        }
    }

    /// Create an outbound HANGUP frame.
    #[must_use]
    pub fn hangup(call_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Frame::Hangup {
            call_id: call_id.into(),
            reason: Some(reason.into()),
            from: None,
        }
    }

    /// Create an outbound MSG frame.
    #[must_use]
    pub fn msg(
        call_id: impl Into<String>,
        from: impl Into<String>,
        data: Value,
        content_type: impl Into<String>,
    ) -> Self {
        Frame::Msg {
            call_id: call_id.into(),
            data,
            content_type: Some(content_type.into()),
            from: Some(from.into()),
        }
    }

    /// Create a RING frame.
    #[must_use]
    pub fn ring(
        from: impl Into<String>,
        call_id: impl Into<String>,
        metadata: Option<Value>,
    ) -> Self {
        Frame::Ring {
            from: from.into(),
            call_id: call_id.into(),
            metadata,
        }
    }

    /// Create a CONNECTED frame.
    #[must_use]
    pub fn connected(call_id: impl Into<String>, to: impl Into<String>) -> Self {
        Frame::Connected {
            call_id: call_id.into(),
            to: to.into(),
        }
    }

    /// Create a BUSY frame.
    #[must_use]
    pub fn busy(to: impl Into<String>, reason: BusyReason) -> Self {
        Frame::Busy {
            to: to.into(),
            reason,
        }
    }

    /// Create an ERROR frame.
    #[must_use]
    pub fn error(
        reason: ErrorReason,
        context: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Frame::Error {
            reason,
            context: context.into(),
            detail: detail.into(),
        }
    }

    /// Create an `invalid_payload` ERROR frame.
    #[must_use]
    pub fn invalid_payload(context: impl Into<String>, detail: impl Into<String>) -> Self {
        Frame::error(ErrorReason::InvalidPayload, context, detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_name() {
        assert_eq!(Frame::register("a@x.y").type_name(), "REGISTER");
        assert_eq!(Frame::Heartbeat.type_name(), "HEARTBEAT");
        assert_eq!(
            Frame::busy("b@x.y", BusyReason::NoSuchAddress).type_name(),
            "BUSY"
        );
    }

    #[test]
    fn test_tagged_serialization() {
        let frame = Frame::dial("b@x.y", Some(json!({"subject": "hi"})));
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "DIAL");
        assert_eq!(value["to"], "b@x.y");
        assert_eq!(value["metadata"]["subject"], "hi");
    }

    #[test]
    fn test_reason_wire_form() {
        let frame = Frame::busy("b@x.y", BusyReason::MaxListenersReached);
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["reason"], "max_listeners_reached");
    }

    #[test]
    fn test_optional_fields_omitted() {
        let value = serde_json::to_value(Frame::register("a@x.y")).unwrap();
        let obj = value.as_object().unwrap();
        assert!(!obj.contains_key("metadata"));
        assert!(!obj.contains_key("wake_handler"));
    }

    #[test]
    fn test_unit_variant_roundtrip() {
        let text = serde_json::to_string(&Frame::SleepAck).unwrap();
        let back: Frame = serde_json::from_str(&text).unwrap();
        assert_eq!(back, Frame::SleepAck);
    }
}
