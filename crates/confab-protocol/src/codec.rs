//! Codec for decoding inbound frames and encoding outbound frames.
//!
//! Inbound decoding is staged so each failure maps to a distinct protocol
//! error: size check, JSON parse, discriminator lookup, then
//! variant-specific deserialization.

use serde_json::Value;
use thiserror::Error;

use crate::envelope::{ClientEnvelope, ServerEnvelope};

/// Wire tags of every envelope a client may send.
const CLIENT_TYPES: &[&str] = &[
    "auth",
    "message",
    "message_edit",
    "message_delete",
    "message_forward",
    "typing_start",
    "typing_stop",
    "ping",
    "pong",
    "mark_read",
    "ack",
    "subscribe",
    "unsubscribe",
];

/// Errors that can occur while decoding an inbound frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Frame exceeds the configured maximum size.
    #[error("frame size {size} exceeds maximum {max}")]
    Oversize { size: usize, max: usize },

    /// Frame is not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// Frame has no `type` discriminator.
    #[error("message type is required")]
    MissingType,

    /// Frame carries an unrecognized `type`.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// Frame matched a known type but the payload shape is wrong.
    #[error("invalid payload for type '{kind}': {detail}")]
    InvalidPayload { kind: String, detail: String },
}

/// Decode one inbound frame.
///
/// `max_size` is compared against the UTF-8 byte length of the raw frame
/// before any parsing happens.
///
/// # Errors
///
/// Returns a [`DecodeError`] describing the first validation stage that
/// failed; the caller maps it to an `INVALID_MESSAGE` error envelope.
pub fn decode_client(raw: &str, max_size: usize) -> Result<ClientEnvelope, DecodeError> {
    if raw.len() > max_size {
        return Err(DecodeError::Oversize {
            size: raw.len(),
            max: max_size,
        });
    }

    let value: Value = serde_json::from_str(raw)?;

    let kind = match value.get("type").and_then(Value::as_str) {
        Some(kind) => kind.to_string(),
        None => return Err(DecodeError::MissingType),
    };

    if !CLIENT_TYPES.contains(&kind.as_str()) {
        return Err(DecodeError::UnknownType(kind));
    }

    serde_json::from_value(value).map_err(|e| DecodeError::InvalidPayload {
        kind,
        detail: e.to_string(),
    })
}

/// Encode an outbound envelope as a JSON text frame.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_server(envelope: &ServerEnvelope) -> Result<String, serde_json::Error> {
    serde_json::to_string(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ErrorCode;
    use uuid::Uuid;

    #[test]
    fn test_decode_valid_frames() {
        let auth = decode_client(r#"{"type":"auth","token":"abc"}"#, 1024).unwrap();
        assert!(matches!(auth, ClientEnvelope::Auth { token } if token == "abc"));

        let raw = format!(
            r#"{{"type":"message","conversation_id":"{}","content":"hi"}}"#,
            Uuid::nil()
        );
        let msg = decode_client(&raw, 1024).unwrap();
        assert!(matches!(msg, ClientEnvelope::Message { .. }));
    }

    #[test]
    fn test_decode_oversize() {
        let raw = format!(r#"{{"type":"ping","pad":"{}"}}"#, "x".repeat(100));
        match decode_client(&raw, 64) {
            Err(DecodeError::Oversize { max: 64, .. }) => {}
            other => panic!("expected Oversize, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_missing_type() {
        match decode_client(r#"{"token":"abc"}"#, 1024) {
            Err(DecodeError::MissingType) => {}
            other => panic!("expected MissingType, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_unknown_type() {
        match decode_client(r#"{"type":"presence"}"#, 1024) {
            Err(DecodeError::UnknownType(kind)) => assert_eq!(kind, "presence"),
            other => panic!("expected UnknownType, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_invalid_payload() {
        // Known type, malformed conversation_id.
        let raw = r#"{"type":"subscribe","conversation_id":"not-a-uuid"}"#;
        match decode_client(raw, 1024) {
            Err(DecodeError::InvalidPayload { kind, .. }) => assert_eq!(kind, "subscribe"),
            other => panic!("expected InvalidPayload, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_invalid_json() {
        assert!(matches!(
            decode_client("{not json", 1024),
            Err(DecodeError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_encode_error_envelope() {
        let env = ServerEnvelope::error(ErrorCode::AuthRequired, "Authentication required");
        let json = encode_server(&env).unwrap();
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains(r#""code":"AUTH_REQUIRED""#));
        // Unstamped envelopes must not leak a null sequence.
        assert!(!json.contains("sequence"));
    }
}
