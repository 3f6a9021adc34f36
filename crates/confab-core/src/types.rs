//! Domain types shared across the engine.

use chrono::{DateTime, Utc};
use confab_protocol::Media;
use uuid::Uuid;

/// A user identifier.
pub type UserId = Uuid;

/// A conversation identifier.
pub type ConversationId = Uuid;

/// A message identifier.
pub type MessageId = Uuid;

/// A media identifier.
pub type MediaId = Uuid;

/// Minimal user profile needed by the delivery engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub id: UserId,
    pub name: String,
}

/// Minimal conversation metadata needed by the delivery engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationMeta {
    pub id: ConversationId,
    pub is_deleted: bool,
}

/// A persisted message as returned by the message repository.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub content: String,
    pub forwarded_from_id: Option<MessageId>,
    pub media: Vec<Media>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub is_edited: bool,
    pub is_deleted: bool,
}

/// A participant's read cursor in one conversation.
///
/// `last_read` is the id of the newest message the participant is recorded as
/// having read, or `None` if they have read nothing yet. `updated_at` is when
/// the cursor last moved and doubles as the reported read time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadCursor {
    pub user_id: UserId,
    pub user_name: String,
    pub last_read: Option<MessageId>,
    pub updated_at: DateTime<Utc>,
}
