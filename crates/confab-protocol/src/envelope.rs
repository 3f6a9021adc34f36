//! Envelope types for the confab protocol.
//!
//! Envelopes are the JSON frames exchanged over a connection. The inbound and
//! outbound sets are closed tagged unions; the `type` field selects the
//! variant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum message content length in characters.
pub const MAX_CONTENT_CHARS: usize = 1000;

/// Media attached to a message, as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Media {
    /// Media identifier.
    pub id: Uuid,
    /// Public URL of the stored object.
    pub url: String,
    /// MIME type.
    pub content_type: String,
}

/// Error codes carried by `error` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthRequired,
    AuthFailed,
    InvalidMessage,
    PermissionDenied,
    ConversationNotFound,
    MessageNotFound,
    UserNotFound,
    InvalidContent,
    RateLimitExceeded,
    InternalError,
}

/// Delivery status reported by `message_ack` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Delivered,
}

/// Frames a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    /// Bearer-token authentication, the required first frame.
    Auth { token: String },

    /// Create a message in a conversation.
    Message {
        conversation_id: Uuid,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        forwarded_from_id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_ids: Option<Vec<Uuid>>,
    },

    /// Edit a message (sender only).
    MessageEdit { message_id: Uuid, content: String },

    /// Soft-delete a message (sender only).
    MessageDelete { message_id: Uuid },

    /// Forward a message into another conversation.
    MessageForward {
        message_id: Uuid,
        conversation_id: Uuid,
    },

    /// Typing indicator on.
    TypingStart { conversation_id: Uuid },

    /// Typing indicator off.
    TypingStop { conversation_id: Uuid },

    /// Heartbeat.
    Ping,

    /// Heartbeat reply; accepted and exempt from rate limiting.
    Pong,

    /// Advance the read cursor to a message.
    MarkRead {
        message_id: Uuid,
        conversation_id: Uuid,
    },

    /// Acknowledge delivery of a message.
    Ack {
        message_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence: Option<u64>,
    },

    /// Subscribe to conversation fan-out (participants only).
    Subscribe { conversation_id: Uuid },

    /// Unsubscribe from conversation fan-out; unconditional.
    Unsubscribe { conversation_id: Uuid },
}

impl ClientEnvelope {
    /// The wire `type` tag of this envelope.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEnvelope::Auth { .. } => "auth",
            ClientEnvelope::Message { .. } => "message",
            ClientEnvelope::MessageEdit { .. } => "message_edit",
            ClientEnvelope::MessageDelete { .. } => "message_delete",
            ClientEnvelope::MessageForward { .. } => "message_forward",
            ClientEnvelope::TypingStart { .. } => "typing_start",
            ClientEnvelope::TypingStop { .. } => "typing_stop",
            ClientEnvelope::Ping => "ping",
            ClientEnvelope::Pong => "pong",
            ClientEnvelope::MarkRead { .. } => "mark_read",
            ClientEnvelope::Ack { .. } => "ack",
            ClientEnvelope::Subscribe { .. } => "subscribe",
            ClientEnvelope::Unsubscribe { .. } => "unsubscribe",
        }
    }

    /// Validate payload constraints that the type system cannot express.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason if the envelope violates a content
    /// constraint (empty or over-long message content).
    pub fn validate(&self) -> Result<(), &'static str> {
        match self {
            ClientEnvelope::Message { content, .. }
            | ClientEnvelope::MessageEdit { content, .. } => {
                if content.is_empty() {
                    return Err("content must not be empty");
                }
                if content.chars().count() > MAX_CONTENT_CHARS {
                    return Err("content exceeds maximum length");
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Frames the server emits.
///
/// Every substantive envelope carries a `sequence` stamped by the owning
/// connection's writer just before serialization; `pong` never does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    AuthSuccess {
        user_id: Uuid,
        user_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence: Option<u64>,
    },

    Message {
        id: Uuid,
        content: String,
        sender_id: Uuid,
        conversation_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        forwarded_from_id: Option<Uuid>,
        sender_name: String,
        media: Vec<Media>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        is_edited: bool,
        is_deleted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence: Option<u64>,
    },

    MessageEdit {
        message_id: Uuid,
        content: String,
        updated_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence: Option<u64>,
    },

    MessageDelete {
        message_id: Uuid,
        conversation_id: Uuid,
        deleted_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence: Option<u64>,
    },

    MessageForward {
        original_message_id: Uuid,
        new_message_id: Uuid,
        conversation_id: Uuid,
        forwarded_from_id: Uuid,
        content: String,
        created_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence: Option<u64>,
    },

    TypingStart {
        user_id: Uuid,
        user_name: String,
        conversation_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence: Option<u64>,
    },

    TypingStop {
        user_id: Uuid,
        user_name: String,
        conversation_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence: Option<u64>,
    },

    Pong,

    MarkReadSuccess {
        message_id: Uuid,
        conversation_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence: Option<u64>,
    },

    MessageRead {
        message_id: Uuid,
        conversation_id: Uuid,
        reader_id: Uuid,
        reader_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence: Option<u64>,
    },

    MessageAck {
        message_id: Uuid,
        status: AckStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence: Option<u64>,
    },

    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence: Option<u64>,
    },
}

impl ServerEnvelope {
    /// Create an error envelope.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerEnvelope::Error {
            code,
            message: message.into(),
            details: None,
            sequence: None,
        }
    }

    /// Whether this envelope takes a sequence number.
    ///
    /// Heartbeat frames are reserved out of the sequence space so clients can
    /// detect gaps in substantive traffic.
    #[must_use]
    pub fn is_sequenced(&self) -> bool {
        !matches!(self, ServerEnvelope::Pong)
    }

    /// Stamp the outbound sequence number. No-op for unsequenced envelopes.
    pub fn set_sequence(&mut self, n: u64) {
        match self {
            ServerEnvelope::AuthSuccess { sequence, .. }
            | ServerEnvelope::Message { sequence, .. }
            | ServerEnvelope::MessageEdit { sequence, .. }
            | ServerEnvelope::MessageDelete { sequence, .. }
            | ServerEnvelope::MessageForward { sequence, .. }
            | ServerEnvelope::TypingStart { sequence, .. }
            | ServerEnvelope::TypingStop { sequence, .. }
            | ServerEnvelope::MarkReadSuccess { sequence, .. }
            | ServerEnvelope::MessageRead { sequence, .. }
            | ServerEnvelope::MessageAck { sequence, .. }
            | ServerEnvelope::Error { sequence, .. } => *sequence = Some(n),
            ServerEnvelope::Pong => {}
        }
    }

    /// The stamped sequence number, if any.
    #[must_use]
    pub fn sequence(&self) -> Option<u64> {
        match self {
            ServerEnvelope::AuthSuccess { sequence, .. }
            | ServerEnvelope::Message { sequence, .. }
            | ServerEnvelope::MessageEdit { sequence, .. }
            | ServerEnvelope::MessageDelete { sequence, .. }
            | ServerEnvelope::MessageForward { sequence, .. }
            | ServerEnvelope::TypingStart { sequence, .. }
            | ServerEnvelope::TypingStop { sequence, .. }
            | ServerEnvelope::MarkReadSuccess { sequence, .. }
            | ServerEnvelope::MessageRead { sequence, .. }
            | ServerEnvelope::MessageAck { sequence, .. }
            | ServerEnvelope::Error { sequence, .. } => *sequence,
            ServerEnvelope::Pong => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_envelope_tags() {
        let ping: ClientEnvelope = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping, ClientEnvelope::Ping);
        assert_eq!(ping.kind(), "ping");

        let sub: ClientEnvelope = serde_json::from_str(&format!(
            r#"{{"type":"subscribe","conversation_id":"{}"}}"#,
            Uuid::nil()
        ))
        .unwrap();
        assert_eq!(sub.kind(), "subscribe");
    }

    #[test]
    fn test_content_validation() {
        let ok = ClientEnvelope::Message {
            conversation_id: Uuid::new_v4(),
            content: "hi".into(),
            forwarded_from_id: None,
            media_ids: None,
        };
        assert!(ok.validate().is_ok());

        let empty = ClientEnvelope::MessageEdit {
            message_id: Uuid::new_v4(),
            content: String::new(),
        };
        assert!(empty.validate().is_err());

        let long = ClientEnvelope::Message {
            conversation_id: Uuid::new_v4(),
            content: "x".repeat(MAX_CONTENT_CHARS + 1),
            forwarded_from_id: None,
            media_ids: None,
        };
        assert!(long.validate().is_err());
    }

    #[test]
    fn test_error_code_wire_format() {
        let json = serde_json::to_string(&ErrorCode::RateLimitExceeded).unwrap();
        assert_eq!(json, r#""RATE_LIMIT_EXCEEDED""#);
    }

    #[test]
    fn test_sequence_stamping() {
        let mut env = ServerEnvelope::MarkReadSuccess {
            message_id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sequence: None,
        };
        assert!(env.is_sequenced());
        env.set_sequence(7);
        assert_eq!(env.sequence(), Some(7));

        let mut pong = ServerEnvelope::Pong;
        assert!(!pong.is_sequenced());
        pong.set_sequence(1);
        assert_eq!(pong.sequence(), None);
    }

    #[test]
    fn test_pong_has_no_sequence_on_wire() {
        let json = serde_json::to_string(&ServerEnvelope::Pong).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);
    }
}
