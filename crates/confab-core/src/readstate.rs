//! Unread-first catch-up pagination and read-receipt aggregation.
//!
//! Both operations work against the message/conversation repositories with a
//! fixed number of bulk fetches and merge in memory, independent of
//! per-message round trips.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::store::{ConversationRepository, MessageRepository, StoreError};
use crate::types::{ConversationId, MessageId, MessageRecord, UserId};

/// A participant recorded as having read a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reader {
    pub user_id: UserId,
    pub user_name: String,
    pub read_at: DateTime<Utc>,
}

/// Computes catch-up pages and read receipts over message history.
pub struct ReadStateEngine {
    messages: Arc<dyn MessageRepository>,
    conversations: Arc<dyn ConversationRepository>,
}

impl ReadStateEngine {
    /// Create an engine over the given repositories.
    #[must_use]
    pub fn new(
        messages: Arc<dyn MessageRepository>,
        conversations: Arc<dyn ConversationRepository>,
    ) -> Self {
        Self {
            messages,
            conversations,
        }
    }

    /// One page of catch-up history for a requester, newest first.
    ///
    /// Messages the requester has not read yet come first; if fewer than
    /// `limit` are unread, the page is topped up with already-read history at
    /// or before the cursor. When the unread set alone reaches `limit`, only
    /// the newest `limit` unread messages are returned and older unread items
    /// wait for the next page.
    ///
    /// # Errors
    ///
    /// Propagates repository failures.
    pub async fn paginate(
        &self,
        conversation: ConversationId,
        requester: UserId,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let cursor = self.conversations.last_read(requester, conversation).await?;

        let Some(cursor_id) = cursor else {
            return self.messages.recent_messages(conversation, limit).await;
        };

        // A cursor pointing at a purged message degrades to plain recency.
        let Some(cursor_msg) = self.messages.get_message(cursor_id, true).await? else {
            return self.messages.recent_messages(conversation, limit).await;
        };

        let mut unread = self
            .messages
            .messages_after(conversation, cursor_msg.created_at)
            .await?;

        if unread.is_empty() {
            return self.messages.recent_messages(conversation, limit).await;
        }

        debug!(
            conversation = %conversation,
            requester = %requester,
            unread = unread.len(),
            "Unread-first page"
        );

        if unread.len() >= limit {
            unread.truncate(limit);
            return Ok(unread);
        }

        let fill = self
            .messages
            .messages_at_or_before(conversation, cursor_msg.created_at, limit - unread.len())
            .await?;
        unread.extend(fill);
        Ok(unread)
    }

    /// Which participants have read each of the given messages.
    ///
    /// A participant P has read message M iff M's timestamp is at or before
    /// the timestamp of the message P's cursor points to (ties count as
    /// read). Senders are not excluded from their own messages; callers
    /// filter if they need to. Three bulk fetches, then an O(N x P) merge.
    ///
    /// # Errors
    ///
    /// Propagates repository failures.
    pub async fn message_readers(
        &self,
        conversation: ConversationId,
        ids: &[MessageId],
    ) -> Result<HashMap<MessageId, Vec<Reader>>, StoreError> {
        let mut readers: HashMap<MessageId, Vec<Reader>> =
            ids.iter().map(|&id| (id, Vec::new())).collect();
        if ids.is_empty() {
            return Ok(readers);
        }

        let batch = self.messages.messages_in(conversation, ids).await?;
        if batch.is_empty() {
            return Ok(readers);
        }

        let cursors = self.conversations.read_cursors(conversation).await?;
        let cursor_ids: Vec<MessageId> = cursors.iter().filter_map(|c| c.last_read).collect();
        if cursor_ids.is_empty() {
            return Ok(readers);
        }

        let cursor_msgs: HashMap<MessageId, DateTime<Utc>> = self
            .messages
            .messages_by_ids(&cursor_ids)
            .await?
            .into_iter()
            .map(|m| (m.id, m.created_at))
            .collect();

        for cursor in &cursors {
            let Some(read_until) = cursor.last_read.and_then(|id| cursor_msgs.get(&id)) else {
                continue;
            };
            for message in &batch {
                if message.created_at <= *read_until {
                    if let Some(list) = readers.get_mut(&message.id) {
                        list.push(Reader {
                            user_id: cursor.user_id,
                            user_name: cursor.user_name.clone(),
                            read_at: cursor.updated_at,
                        });
                    }
                }
            }
        }

        Ok(readers)
    }

    /// Advance a participant's read cursor to a message.
    ///
    /// The message must exist, belong to the conversation, and not be
    /// deleted; returns `false` otherwise (and when the user has no
    /// membership in the conversation).
    ///
    /// # Errors
    ///
    /// Propagates repository failures.
    pub async fn advance_cursor(
        &self,
        user: UserId,
        conversation: ConversationId,
        message: MessageId,
    ) -> Result<bool, StoreError> {
        let Some(record) = self.messages.get_message(message, false).await? else {
            return Ok(false);
        };
        if record.conversation_id != conversation {
            return Ok(false);
        }
        self.conversations.set_last_read(user, conversation, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use chrono::Duration;
    use uuid::Uuid;

    struct Fixture {
        store: Arc<MemoryStore>,
        engine: ReadStateEngine,
        conversation: ConversationId,
        alice: UserId,
        bob: UserId,
        /// Ten messages, oldest first: ids[0] is #1, ids[9] is #10.
        ids: Vec<MessageId>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let alice = store.add_user("Alice");
        let bob = store.add_user("Bob");
        let conversation = store.add_conversation(&[alice, bob]);

        let base = Utc::now() - Duration::minutes(100);
        let mut ids = Vec::new();
        for i in 0..10 {
            let id = store.seed_message(
                conversation,
                alice,
                &format!("m{}", i + 1),
                base + Duration::minutes(i),
            );
            ids.push(id);
        }

        let engine = ReadStateEngine::new(store.clone(), store.clone());
        Fixture {
            store,
            engine,
            conversation,
            alice,
            bob,
            ids,
        }
    }

    fn contents(page: &[MessageRecord]) -> Vec<&str> {
        page.iter().map(|m| m.content.as_str()).collect()
    }

    #[tokio::test]
    async fn test_no_cursor_returns_recent() {
        let f = fixture().await;
        let page = f.engine.paginate(f.conversation, f.bob, 4).await.unwrap();
        assert_eq!(contents(&page), ["m10", "m9", "m8", "m7"]);
    }

    #[tokio::test]
    async fn test_unread_set_caps_page() {
        let f = fixture().await;
        // Bob has read through #6; #7..#10 are unread.
        f.store.set_cursor(f.bob, f.conversation, f.ids[5]);

        let page = f.engine.paginate(f.conversation, f.bob, 4).await.unwrap();
        assert_eq!(contents(&page), ["m10", "m9", "m8", "m7"]);
    }

    #[tokio::test]
    async fn test_unread_first_then_read_fill() {
        let f = fixture().await;
        f.store.set_cursor(f.bob, f.conversation, f.ids[5]);

        let page = f.engine.paginate(f.conversation, f.bob, 20).await.unwrap();
        assert_eq!(
            contents(&page),
            ["m10", "m9", "m8", "m7", "m6", "m5", "m4", "m3", "m2", "m1"]
        );
    }

    #[tokio::test]
    async fn test_partial_fill_respects_limit() {
        let f = fixture().await;
        f.store.set_cursor(f.bob, f.conversation, f.ids[7]);

        // Two unread (#9, #10) + four read fill = limit 6.
        let page = f.engine.paginate(f.conversation, f.bob, 6).await.unwrap();
        assert_eq!(contents(&page), ["m10", "m9", "m8", "m7", "m6", "m5"]);
    }

    #[tokio::test]
    async fn test_cursor_at_head_falls_back_to_recent() {
        let f = fixture().await;
        f.store.set_cursor(f.bob, f.conversation, f.ids[9]);

        let page = f.engine.paginate(f.conversation, f.bob, 3).await.unwrap();
        assert_eq!(contents(&page), ["m10", "m9", "m8"]);
    }

    #[tokio::test]
    async fn test_deleted_messages_excluded() {
        let f = fixture().await;
        f.store.soft_delete(f.ids[8]).await.unwrap(); // delete #9
        f.store.set_cursor(f.bob, f.conversation, f.ids[5]);

        let page = f.engine.paginate(f.conversation, f.bob, 4).await.unwrap();
        assert_eq!(contents(&page), ["m10", "m8", "m7", "m6"]);
    }

    #[tokio::test]
    async fn test_readers_boundary_inclusive() {
        let f = fixture().await;
        // Bob's cursor resolves to #6's timestamp.
        f.store.set_cursor(f.bob, f.conversation, f.ids[5]);

        let readers = f
            .engine
            .message_readers(f.conversation, &f.ids)
            .await
            .unwrap();

        for (i, id) in f.ids.iter().enumerate() {
            let read_by_bob = readers[id].iter().any(|r| r.user_id == f.bob);
            // Messages #1..#6 (timestamp <= cursor) are read, #7..#10 not.
            assert_eq!(read_by_bob, i <= 5, "message #{}", i + 1);
        }
    }

    #[tokio::test]
    async fn test_readers_include_sender() {
        let f = fixture().await;
        f.store.set_cursor(f.alice, f.conversation, f.ids[9]);

        let readers = f
            .engine
            .message_readers(f.conversation, &[f.ids[0]])
            .await
            .unwrap();
        // Alice sent every message; she still appears as a reader.
        assert!(readers[&f.ids[0]].iter().any(|r| r.user_id == f.alice));
    }

    #[tokio::test]
    async fn test_readers_no_cursors() {
        let f = fixture().await;
        let readers = f
            .engine
            .message_readers(f.conversation, &[f.ids[0], f.ids[1]])
            .await
            .unwrap();
        assert!(readers.values().all(Vec::is_empty));
    }

    #[tokio::test]
    async fn test_advance_cursor_validates_message() {
        let f = fixture().await;

        // Unknown message.
        assert!(!f
            .engine
            .advance_cursor(f.bob, f.conversation, Uuid::new_v4())
            .await
            .unwrap());

        // Message from another conversation.
        let other = f.store.add_conversation(&[f.alice]);
        let foreign = f
            .store
            .seed_message(other, f.alice, "elsewhere", Utc::now());
        assert!(!f
            .engine
            .advance_cursor(f.bob, f.conversation, foreign)
            .await
            .unwrap());

        // Deleted message.
        f.store.soft_delete(f.ids[3]).await.unwrap();
        assert!(!f
            .engine
            .advance_cursor(f.bob, f.conversation, f.ids[3])
            .await
            .unwrap());

        // Valid advance.
        assert!(f
            .engine
            .advance_cursor(f.bob, f.conversation, f.ids[4])
            .await
            .unwrap());
        assert_eq!(
            f.store.cursor_of(f.bob, f.conversation),
            Some(f.ids[4])
        );
    }

    #[tokio::test]
    async fn test_non_participant_cannot_advance() {
        let f = fixture().await;
        let outsider = f.store.add_user("Mallory");
        assert!(!f
            .engine
            .advance_cursor(outsider, f.conversation, f.ids[0])
            .await
            .unwrap());
    }
}
