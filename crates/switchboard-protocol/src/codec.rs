//! Codec for encoding and decoding Switchboard frames.
//!
//! The wire format is one JSON object per transport message. Decoding is
//! two-stage: parse the text, read the `type` tag, then deserialize into
//! [`Frame`]. The stages matter because the failure modes are handled
//! differently upstream: malformed JSON closes the connection at the
//! transport, an unknown type gets `ERROR{invalid_payload, context: UNKNOWN}`,
//! and a known type with bad field shapes gets an `invalid_payload` error
//! naming the frame.

use serde_json::Value;
use thiserror::Error;

use crate::frames::Frame;

/// Maximum accepted frame size (1 MiB of JSON text).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Every `type` tag the protocol knows, both directions.
pub const KNOWN_TYPES: &[&str] = &[
    "REGISTER",
    "UNREGISTER",
    "STATUS",
    "HEARTBEAT",
    "DIAL",
    "ANSWER",
    "HANGUP",
    "MSG",
    "PRESENCE",
    "SLEEP_ACK",
    "REGISTER_PBX",
    "REGISTERED",
    "REGISTER_FAILED",
    "HEARTBEAT_ACK",
    "RING",
    "CONNECTED",
    "BUSY",
    "SLEEP_PENDING",
    "PRESENCE_RESULT",
    "ERROR",
    "REGISTERED_PBX",
    "REGISTER_PBX_FAILED",
];

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// The text was not valid JSON at all.
    #[error("malformed JSON: {0}")]
    Malformed(serde_json::Error),

    /// Valid JSON, but not an object with a string `type` field.
    #[error("frame is not an object with a string `type` field")]
    MissingType,

    /// The `type` tag names no known frame.
    #[error("unknown frame type `{0}`")]
    UnknownType(String),

    /// A known frame type with missing or wrongly-typed fields.
    #[error("invalid {context} payload: {detail}")]
    InvalidPayload { context: String, detail: String },

    /// Serialization failure (outbound).
    #[error("encoding error: {0}")]
    Encode(serde_json::Error),
}

/// Encode a frame to JSON text.
///
/// # Errors
///
/// Returns an error if serialization fails or the result is oversized.
pub fn encode(frame: &Frame) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(frame).map_err(ProtocolError::Encode)?;
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(text)
}

/// Decode a frame from JSON text.
///
/// # Errors
///
/// Returns [`ProtocolError::Malformed`] for non-JSON input,
/// [`ProtocolError::UnknownType`] for an unrecognized tag, and
/// [`ProtocolError::InvalidPayload`] when a known frame's fields are
/// missing or wrongly typed.
pub fn decode(text: &str) -> Result<Frame, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }

    let value: Value = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
    decode_value(value)
}

/// Decode a frame from an already-parsed JSON value.
///
/// # Errors
///
/// Same as [`decode`], minus the malformed-JSON case.
pub fn decode_value(value: Value) -> Result<Frame, ProtocolError> {
    let type_name = value
        .as_object()
        .and_then(|obj| obj.get("type"))
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?;

    if !KNOWN_TYPES.contains(&type_name) {
        return Err(ProtocolError::UnknownType(type_name.to_string()));
    }

    let context = type_name.to_string();
    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
        context,
        detail: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::BusyReason;
    use serde_json::json;

    #[test]
    fn test_encode_decode_roundtrip() {
        let frames = vec![
            Frame::register("agent@example.com"),
            Frame::dial("b@x.y", Some(json!({"subject": "hi"}))),
            Frame::answer("call-1"),
            Frame::hangup("call-1", "normal"),
            Frame::msg("call-1", "a@x.y", json!("ping"), "text"),
            Frame::busy("b@x.y", BusyReason::Timeout),
            Frame::Heartbeat,
            Frame::SleepAck,
        ];

        for frame in frames {
            let encoded = encode(&frame).unwrap();
            let decoded = decode(&encoded).unwrap();
            assert_eq!(frame, decoded);
        }
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(decode("{not json"), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_decode_missing_type() {
        assert!(matches!(decode("{}"), Err(ProtocolError::MissingType)));
        assert!(matches!(decode("[1,2]"), Err(ProtocolError::MissingType)));
        assert!(matches!(
            decode(r#"{"type": 7}"#),
            Err(ProtocolError::MissingType)
        ));
    }

    #[test]
    fn test_decode_unknown_type() {
        match decode(r#"{"type": "TELEPORT"}"#) {
            Err(ProtocolError::UnknownType(t)) => assert_eq!(t, "TELEPORT"),
            other => panic!("expected UnknownType, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_bad_field_shape() {
        // DIAL with a numeric `to` is a known type with an invalid payload.
        match decode(r#"{"type": "DIAL", "to": 42}"#) {
            Err(ProtocolError::InvalidPayload { context, .. }) => assert_eq!(context, "DIAL"),
            other => panic!("expected InvalidPayload, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_missing_required_field() {
        match decode(r#"{"type": "ANSWER"}"#) {
            Err(ProtocolError::InvalidPayload { context, .. }) => assert_eq!(context, "ANSWER"),
            other => panic!("expected InvalidPayload, got {:?}", other),
        }
    }

    #[test]
    fn test_known_types_cover_enum() {
        // Every constructor-produced tag must be in the known list.
        for frame in [
            Frame::register("a@x.y"),
            Frame::Unregister,
            Frame::Heartbeat,
            Frame::SleepAck,
        ] {
            assert!(KNOWN_TYPES.contains(&frame.type_name()));
        }
    }
}
