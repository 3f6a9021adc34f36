//! Persistence and push-notification collaborator contracts.
//!
//! Storage of users, conversations, messages and media lives outside the
//! delivery engine. The engine consumes it through these repository traits;
//! the server wires in a concrete backend at startup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use confab_protocol::Media;
use std::fmt;
use thiserror::Error;

use crate::types::{
    ConversationId, ConversationMeta, MediaId, MessageId, MessageRecord, ReadCursor, UserId,
    UserProfile,
};

/// Entity kinds referenced by storage errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    User,
    Conversation,
    Message,
    Media,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Entity::User => "user",
            Entity::Conversation => "conversation",
            Entity::Message => "message",
            Entity::Media => "media",
        };
        write!(f, "{name}")
    }
}

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Referenced entity does not exist (or is deleted where that matters).
    #[error("{0} not found")]
    NotFound(Entity),

    /// The request conflicts with persisted state.
    #[error("invalid request: {0}")]
    Invalid(&'static str),

    /// The backend failed.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Read/write access to user records.
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Look up a user by id.
    async fn get_user(&self, id: UserId) -> Result<Option<UserProfile>, StoreError>;

    /// Record a user's online flag and last-seen stamp.
    async fn set_presence(
        &self,
        id: UserId,
        online: bool,
        last_seen: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// Read/write access to conversations, memberships, and read cursors.
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    /// Look up conversation metadata.
    async fn get_conversation(
        &self,
        id: ConversationId,
    ) -> Result<Option<ConversationMeta>, StoreError>;

    /// Whether the user has a persisted membership in the conversation.
    async fn is_participant(
        &self,
        user: UserId,
        conversation: ConversationId,
    ) -> Result<bool, StoreError>;

    /// All participant user ids of a conversation.
    async fn participants(
        &self,
        conversation: ConversationId,
    ) -> Result<Vec<UserId>, StoreError>;

    /// The requester's read cursor, if any.
    async fn last_read(
        &self,
        user: UserId,
        conversation: ConversationId,
    ) -> Result<Option<MessageId>, StoreError>;

    /// Advance a participant's read cursor.
    ///
    /// Returns `false` if the user has no membership row to update.
    async fn set_last_read(
        &self,
        user: UserId,
        conversation: ConversationId,
        message: MessageId,
    ) -> Result<bool, StoreError>;

    /// Every participant's read cursor for one conversation, with names.
    async fn read_cursors(
        &self,
        conversation: ConversationId,
    ) -> Result<Vec<ReadCursor>, StoreError>;
}

/// Read/write access to message history and attached media.
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Look up one message.
    async fn get_message(
        &self,
        id: MessageId,
        include_deleted: bool,
    ) -> Result<Option<MessageRecord>, StoreError>;

    /// Persist a new message.
    async fn create_message(
        &self,
        sender: UserId,
        conversation: ConversationId,
        content: &str,
        forwarded_from: Option<MessageId>,
    ) -> Result<MessageRecord, StoreError>;

    /// Replace a message's content, marking it edited.
    async fn update_content(
        &self,
        id: MessageId,
        content: &str,
    ) -> Result<MessageRecord, StoreError>;

    /// Soft-delete a message.
    async fn soft_delete(&self, id: MessageId) -> Result<MessageRecord, StoreError>;

    /// Copy a message into another conversation, recording its origin.
    async fn forward_message(
        &self,
        original: MessageId,
        sender: UserId,
        target: ConversationId,
    ) -> Result<MessageRecord, StoreError>;

    /// Re-home uploaded media onto a message.
    ///
    /// Every id must resolve to media already belonging to the target
    /// conversation; on success the media rows point at `message`.
    async fn claim_media(
        &self,
        media_ids: &[MediaId],
        message: MessageId,
        conversation: ConversationId,
    ) -> Result<Vec<Media>, StoreError>;

    /// Newest non-deleted messages of a conversation, newest first.
    async fn recent_messages(
        &self,
        conversation: ConversationId,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError>;

    /// Non-deleted messages strictly newer than `after`, newest first.
    async fn messages_after(
        &self,
        conversation: ConversationId,
        after: DateTime<Utc>,
    ) -> Result<Vec<MessageRecord>, StoreError>;

    /// Non-deleted messages at or before `at`, newest first, capped at `limit`.
    async fn messages_at_or_before(
        &self,
        conversation: ConversationId,
        at: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError>;

    /// Bulk fetch of the given messages restricted to one conversation.
    async fn messages_in(
        &self,
        conversation: ConversationId,
        ids: &[MessageId],
    ) -> Result<Vec<MessageRecord>, StoreError>;

    /// Bulk fetch by id with no conversation filter (cursor resolution).
    async fn messages_by_ids(&self, ids: &[MessageId])
        -> Result<Vec<MessageRecord>, StoreError>;
}

/// Summary handed to the push-notification collaborator.
#[derive(Debug, Clone)]
pub struct MessageSummary {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub sender_name: String,
    pub preview: String,
}

/// Push-notification delivery for users with no live connection.
///
/// Delivery is best effort; failures are the collaborator's to log.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn message_created(&self, user: UserId, summary: &MessageSummary);
}
