//! In-memory repository backend.
//!
//! Backs the development server and the test suites. Not meant for
//! production; real deployments wire database-backed repositories into the
//! same traits.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use confab_protocol::Media;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::auth::{AuthError, TokenClaims, TokenKind, TokenVerifier};
use crate::store::{
    ConversationRepository, Entity, MessageRepository, MessageSummary, Notifier, StoreError,
    UserRepository,
};
use crate::types::{
    ConversationId, ConversationMeta, MediaId, MessageId, MessageRecord, ReadCursor, UserId,
    UserProfile,
};

struct MediaRow {
    media: Media,
    conversation: ConversationId,
    #[allow(dead_code)]
    message: MessageId,
}

#[derive(Default)]
struct MemoryInner {
    users: HashMap<UserId, UserProfile>,
    presence: HashMap<UserId, (bool, DateTime<Utc>)>,
    conversations: HashMap<ConversationId, ConversationMeta>,
    members: HashMap<ConversationId, Vec<UserId>>,
    cursors: HashMap<(UserId, ConversationId), (MessageId, DateTime<Utc>)>,
    messages: HashMap<MessageId, MessageRecord>,
    media: HashMap<MediaId, MediaRow>,
}

/// In-memory implementation of all repository traits.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a user, returning its id.
    pub fn add_user(&self, name: &str) -> UserId {
        let id = Uuid::new_v4();
        self.lock().users.insert(
            id,
            UserProfile {
                id,
                name: name.to_string(),
            },
        );
        id
    }

    /// Insert a conversation with the given participants.
    pub fn add_conversation(&self, participants: &[UserId]) -> ConversationId {
        let id = Uuid::new_v4();
        let mut inner = self.lock();
        inner.conversations.insert(
            id,
            ConversationMeta {
                id,
                is_deleted: false,
            },
        );
        inner.members.insert(id, participants.to_vec());
        id
    }

    /// Mark a conversation deleted.
    pub fn delete_conversation(&self, id: ConversationId) {
        if let Some(meta) = self.lock().conversations.get_mut(&id) {
            meta.is_deleted = true;
        }
    }

    /// Insert a message with an explicit creation time.
    pub fn seed_message(
        &self,
        conversation: ConversationId,
        sender: UserId,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> MessageId {
        let mut inner = self.lock();
        let sender_name = inner
            .users
            .get(&sender)
            .map_or_else(String::new, |u| u.name.clone());
        let id = Uuid::new_v4();
        inner.messages.insert(
            id,
            MessageRecord {
                id,
                conversation_id: conversation,
                sender_id: sender,
                sender_name,
                content: content.to_string(),
                forwarded_from_id: None,
                media: Vec::new(),
                created_at,
                updated_at: created_at,
                deleted_at: None,
                is_edited: false,
                is_deleted: false,
            },
        );
        id
    }

    /// Insert an uploaded media object attached to a message.
    pub fn seed_media(
        &self,
        conversation: ConversationId,
        message: MessageId,
        url: &str,
        content_type: &str,
    ) -> MediaId {
        let id = Uuid::new_v4();
        self.lock().media.insert(
            id,
            MediaRow {
                media: Media {
                    id,
                    url: url.to_string(),
                    content_type: content_type.to_string(),
                },
                conversation,
                message,
            },
        );
        id
    }

    /// Set a read cursor directly.
    pub fn set_cursor(&self, user: UserId, conversation: ConversationId, message: MessageId) {
        self.lock()
            .cursors
            .insert((user, conversation), (message, Utc::now()));
    }

    /// Read back a cursor.
    #[must_use]
    pub fn cursor_of(&self, user: UserId, conversation: ConversationId) -> Option<MessageId> {
        self.lock().cursors.get(&(user, conversation)).map(|c| c.0)
    }

    /// Read back the recorded presence of a user.
    #[must_use]
    pub fn presence_of(&self, user: UserId) -> Option<(bool, DateTime<Utc>)> {
        self.lock().presence.get(&user).copied()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn get_user(&self, id: UserId) -> Result<Option<UserProfile>, StoreError> {
        Ok(self.lock().users.get(&id).cloned())
    }

    async fn set_presence(
        &self,
        id: UserId,
        online: bool,
        last_seen: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.lock().presence.insert(id, (online, last_seen));
        Ok(())
    }
}

#[async_trait]
impl ConversationRepository for MemoryStore {
    async fn get_conversation(
        &self,
        id: ConversationId,
    ) -> Result<Option<ConversationMeta>, StoreError> {
        Ok(self.lock().conversations.get(&id).cloned())
    }

    async fn is_participant(
        &self,
        user: UserId,
        conversation: ConversationId,
    ) -> Result<bool, StoreError> {
        Ok(self
            .lock()
            .members
            .get(&conversation)
            .is_some_and(|m| m.contains(&user)))
    }

    async fn participants(
        &self,
        conversation: ConversationId,
    ) -> Result<Vec<UserId>, StoreError> {
        Ok(self.lock().members.get(&conversation).cloned().unwrap_or_default())
    }

    async fn last_read(
        &self,
        user: UserId,
        conversation: ConversationId,
    ) -> Result<Option<MessageId>, StoreError> {
        Ok(self.lock().cursors.get(&(user, conversation)).map(|c| c.0))
    }

    async fn set_last_read(
        &self,
        user: UserId,
        conversation: ConversationId,
        message: MessageId,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        if !inner
            .members
            .get(&conversation)
            .is_some_and(|m| m.contains(&user))
        {
            return Ok(false);
        }
        inner
            .cursors
            .insert((user, conversation), (message, Utc::now()));
        Ok(true)
    }

    async fn read_cursors(
        &self,
        conversation: ConversationId,
    ) -> Result<Vec<ReadCursor>, StoreError> {
        let inner = self.lock();
        let members = inner.members.get(&conversation).cloned().unwrap_or_default();
        Ok(members
            .into_iter()
            .map(|user_id| {
                let user_name = inner
                    .users
                    .get(&user_id)
                    .map_or_else(String::new, |u| u.name.clone());
                let cursor = inner.cursors.get(&(user_id, conversation));
                ReadCursor {
                    user_id,
                    user_name,
                    last_read: cursor.map(|c| c.0),
                    updated_at: cursor.map_or_else(Utc::now, |c| c.1),
                }
            })
            .collect())
    }
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn get_message(
        &self,
        id: MessageId,
        include_deleted: bool,
    ) -> Result<Option<MessageRecord>, StoreError> {
        Ok(self
            .lock()
            .messages
            .get(&id)
            .filter(|m| include_deleted || !m.is_deleted)
            .cloned())
    }

    async fn create_message(
        &self,
        sender: UserId,
        conversation: ConversationId,
        content: &str,
        forwarded_from: Option<MessageId>,
    ) -> Result<MessageRecord, StoreError> {
        let mut inner = self.lock();
        let sender_name = inner
            .users
            .get(&sender)
            .ok_or(StoreError::NotFound(Entity::User))?
            .name
            .clone();
        let now = Utc::now();
        let record = MessageRecord {
            id: Uuid::new_v4(),
            conversation_id: conversation,
            sender_id: sender,
            sender_name,
            content: content.to_string(),
            forwarded_from_id: forwarded_from,
            media: Vec::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            is_edited: false,
            is_deleted: false,
        };
        inner.messages.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_content(
        &self,
        id: MessageId,
        content: &str,
    ) -> Result<MessageRecord, StoreError> {
        let mut inner = self.lock();
        let record = inner
            .messages
            .get_mut(&id)
            .ok_or(StoreError::NotFound(Entity::Message))?;
        record.content = content.to_string();
        record.updated_at = Utc::now();
        record.is_edited = true;
        Ok(record.clone())
    }

    async fn soft_delete(&self, id: MessageId) -> Result<MessageRecord, StoreError> {
        let mut inner = self.lock();
        let record = inner
            .messages
            .get_mut(&id)
            .ok_or(StoreError::NotFound(Entity::Message))?;
        record.is_deleted = true;
        record.deleted_at = Some(Utc::now());
        Ok(record.clone())
    }

    async fn forward_message(
        &self,
        original: MessageId,
        sender: UserId,
        target: ConversationId,
    ) -> Result<MessageRecord, StoreError> {
        let content = {
            let inner = self.lock();
            inner
                .messages
                .get(&original)
                .filter(|m| !m.is_deleted)
                .ok_or(StoreError::NotFound(Entity::Message))?
                .content
                .clone()
        };
        self.create_message(sender, target, &content, Some(original))
            .await
    }

    async fn claim_media(
        &self,
        media_ids: &[MediaId],
        message: MessageId,
        conversation: ConversationId,
    ) -> Result<Vec<Media>, StoreError> {
        let mut inner = self.lock();
        let mut claimed = Vec::with_capacity(media_ids.len());
        for id in media_ids {
            let row = inner
                .media
                .get(id)
                .ok_or(StoreError::NotFound(Entity::Media))?;
            if row.conversation != conversation {
                return Err(StoreError::Invalid(
                    "media belongs to a different conversation",
                ));
            }
            claimed.push(row.media.clone());
        }
        for id in media_ids {
            if let Some(row) = inner.media.get_mut(id) {
                row.message = message;
            }
        }
        if let Some(record) = inner.messages.get_mut(&message) {
            record.media = claimed.clone();
        }
        Ok(claimed)
    }

    async fn recent_messages(
        &self,
        conversation: ConversationId,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let inner = self.lock();
        let mut page: Vec<MessageRecord> = inner
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation && !m.is_deleted)
            .cloned()
            .collect();
        page.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        page.truncate(limit);
        Ok(page)
    }

    async fn messages_after(
        &self,
        conversation: ConversationId,
        after: DateTime<Utc>,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let inner = self.lock();
        let mut page: Vec<MessageRecord> = inner
            .messages
            .values()
            .filter(|m| {
                m.conversation_id == conversation && !m.is_deleted && m.created_at > after
            })
            .cloned()
            .collect();
        page.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(page)
    }

    async fn messages_at_or_before(
        &self,
        conversation: ConversationId,
        at: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let inner = self.lock();
        let mut page: Vec<MessageRecord> = inner
            .messages
            .values()
            .filter(|m| {
                m.conversation_id == conversation && !m.is_deleted && m.created_at <= at
            })
            .cloned()
            .collect();
        page.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        page.truncate(limit);
        Ok(page)
    }

    async fn messages_in(
        &self,
        conversation: ConversationId,
        ids: &[MessageId],
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let inner = self.lock();
        Ok(ids
            .iter()
            .filter_map(|id| inner.messages.get(id))
            .filter(|m| m.conversation_id == conversation)
            .cloned()
            .collect())
    }

    async fn messages_by_ids(
        &self,
        ids: &[MessageId],
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let inner = self.lock();
        Ok(ids
            .iter()
            .filter_map(|id| inner.messages.get(id))
            .cloned()
            .collect())
    }
}

/// Token verifier backed by a static token table.
///
/// Suitable for development and tests only; production deployments plug a
/// real verification service into [`TokenVerifier`].
#[derive(Default)]
pub struct StaticTokenVerifier {
    tokens: Mutex<HashMap<String, TokenClaims>>,
}

impl StaticTokenVerifier {
    /// Create an empty verifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an access token valid for one hour.
    pub fn grant(&self, token: &str, user: UserId) {
        self.insert(
            token,
            TokenClaims {
                user_id: user,
                kind: TokenKind::Access,
                expires_at: Utc::now() + Duration::hours(1),
            },
        );
    }

    /// Register a token with explicit claims.
    pub fn insert(&self, token: &str, claims: TokenClaims) {
        self.tokens
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(token.to_string(), claims);
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<TokenClaims, AuthError> {
        self.tokens
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(token)
            .cloned()
            .ok_or(AuthError::Malformed)
    }
}

/// Notifier that drops every notification.
#[derive(Default)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn message_created(&self, _user: UserId, _summary: &MessageSummary) {}
}
