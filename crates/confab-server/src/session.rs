//! Per-connection session protocol.
//!
//! A session starts unauthenticated, accepts exactly one successful `auth`
//! frame, and then dispatches envelopes to handlers. The session never owns
//! the socket: inbound text arrives via [`Session::handle_text`], timer wakeups
//! via [`Session::handle_event`], and everything outbound goes through the
//! connection's unbounded queue. Malformed input is answered with an `error`
//! envelope and never ends the loop; only heartbeat silence and the
//! unauthenticated-handshake deadline close a connection from our side.

use chrono::Utc;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use confab_core::auth::TokenKind;
use confab_core::store::{Entity, MessageSummary, StoreError};
use confab_core::types::{ConversationId, MessageId, MessageRecord, UserProfile};
use confab_core::{ConnectionId, RateCategory, RateLimiter};
use confab_protocol::{decode_client, AckStatus, ClientEnvelope, ErrorCode, ServerEnvelope};

use crate::metrics;
use crate::serve::AppState;

/// Length of the content preview handed to the push notifier.
const PREVIEW_CHARS: usize = 100;

/// Timer and lifecycle wakeups delivered to the session's drive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A typing indicator ran its course without an explicit stop.
    TypingExpired(ConversationId),
    /// Periodic liveness check.
    HeartbeatTick,
    /// The unauthenticated-handshake grace period ended.
    AuthDeadline,
}

/// Sending half of the session's event queue.
pub type EventSender = mpsc::UnboundedSender<SessionEvent>;

/// State machine for one WebSocket connection.
pub struct Session {
    state: Arc<AppState>,
    conn: ConnectionId,
    outbound: mpsc::UnboundedSender<ServerEnvelope>,
    events: EventSender,
    /// `Some` once authenticated; registration happens at the same moment.
    identity: Option<UserProfile>,
    /// Active typing auto-expiry timers, one per conversation.
    typing: HashMap<ConversationId, JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    last_pong: Instant,
}

impl Session {
    pub fn new(
        state: Arc<AppState>,
        conn: ConnectionId,
        outbound: mpsc::UnboundedSender<ServerEnvelope>,
        events: EventSender,
    ) -> Self {
        Self {
            state,
            conn,
            outbound,
            events,
            identity: None,
            typing: HashMap::new(),
            heartbeat: None,
            last_pong: Instant::now(),
        }
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }

    /// Decode, admit, and dispatch one inbound text frame.
    pub async fn handle_text(&mut self, raw: &str) {
        let started = Instant::now();
        metrics::record_envelope(raw.len(), "inbound");

        let envelope = match decode_client(raw, self.state.config.websocket.max_frame_bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(connection = %self.conn, error = %err, "Rejected inbound frame");
                metrics::record_error("decode");
                self.send_error(ErrorCode::InvalidMessage, err.to_string());
                return;
            }
        };

        // Heartbeat replies refresh liveness and bypass admission control.
        if envelope == ClientEnvelope::Pong {
            self.last_pong = Instant::now();
            return;
        }

        // Anonymous traffic pools under one shared identity, so only the
        // roomy general ceiling applies before an identity exists; the
        // tighter per-category ceilings bind per user after auth.
        let (identity, category) = match &self.identity {
            Some(user) => (user.id, rate_category(&envelope)),
            None => (RateLimiter::anonymous(), RateCategory::General),
        };
        if !self.state.limiter.is_allowed(identity, category) {
            metrics::record_rate_limited(envelope.kind());
            self.send_error(
                ErrorCode::RateLimitExceeded,
                "Rate limit exceeded. Slow down.",
            );
            return;
        }

        if let Err(reason) = envelope.validate() {
            self.send_error(ErrorCode::InvalidContent, reason);
            return;
        }

        if self.identity.is_none() && !matches!(envelope, ClientEnvelope::Auth { .. }) {
            self.send_error(ErrorCode::AuthRequired, "Authenticate first");
            return;
        }

        self.dispatch(envelope).await;
        metrics::record_dispatch_latency(started.elapsed().as_secs_f64());
    }

    async fn dispatch(&mut self, envelope: ClientEnvelope) {
        match envelope {
            ClientEnvelope::Auth { token } => self.handle_auth(&token).await,
            ClientEnvelope::Message {
                conversation_id,
                content,
                forwarded_from_id,
                media_ids,
            } => {
                self.handle_message(conversation_id, &content, forwarded_from_id, media_ids)
                    .await;
            }
            ClientEnvelope::MessageEdit {
                message_id,
                content,
            } => self.handle_edit(message_id, &content).await,
            ClientEnvelope::MessageDelete { message_id } => self.handle_delete(message_id).await,
            ClientEnvelope::MessageForward {
                message_id,
                conversation_id,
            } => self.handle_forward(message_id, conversation_id).await,
            ClientEnvelope::TypingStart { conversation_id } => {
                self.handle_typing_start(conversation_id).await;
            }
            ClientEnvelope::TypingStop { conversation_id } => {
                self.handle_typing_stop(conversation_id).await;
            }
            ClientEnvelope::Ping => {
                self.last_pong = Instant::now();
                self.send(ServerEnvelope::Pong);
            }
            // Filtered out before dispatch; kept for exhaustiveness.
            ClientEnvelope::Pong => {}
            ClientEnvelope::MarkRead {
                message_id,
                conversation_id,
            } => self.handle_mark_read(message_id, conversation_id).await,
            ClientEnvelope::Ack { message_id, .. } => {
                self.send(ServerEnvelope::MessageAck {
                    message_id,
                    status: AckStatus::Delivered,
                    sequence: None,
                });
            }
            ClientEnvelope::Subscribe { conversation_id } => {
                self.handle_subscribe(conversation_id).await;
            }
            ClientEnvelope::Unsubscribe { conversation_id } => {
                if let Some(user) = &self.identity {
                    self.state.registry.unsubscribe(user.id, conversation_id);
                }
            }
        }
    }

    /// Handle a timer or lifecycle wakeup. `Break` closes the connection.
    pub async fn handle_event(&mut self, event: SessionEvent) -> ControlFlow<()> {
        match event {
            SessionEvent::TypingExpired(conversation) => {
                // The timer completed on its own; broadcast the implied stop.
                if self.typing.remove(&conversation).is_some() {
                    self.broadcast_typing(conversation, false).await;
                }
                ControlFlow::Continue(())
            }
            SessionEvent::HeartbeatTick => {
                if self.last_pong.elapsed() >= self.state.config.heartbeat.timeout() {
                    warn!(connection = %self.conn, "Heartbeat timeout, closing connection");
                    return ControlFlow::Break(());
                }
                ControlFlow::Continue(())
            }
            SessionEvent::AuthDeadline => {
                if self.identity.is_none() {
                    info!(connection = %self.conn, "Closing unauthenticated connection");
                    return ControlFlow::Break(());
                }
                ControlFlow::Continue(())
            }
        }
    }

    async fn handle_auth(&mut self, token: &str) {
        if self.identity.is_some() {
            self.send_error(ErrorCode::InvalidMessage, "Already authenticated");
            return;
        }

        let claims = match self.state.tokens.verify(token).await {
            Ok(claims) => claims,
            Err(err) => {
                debug!(connection = %self.conn, error = %err, "Token verification failed");
                self.auth_failed();
                return;
            }
        };
        if claims.kind != TokenKind::Access || claims.is_expired(Utc::now()) {
            self.auth_failed();
            return;
        }

        let user = match self.state.users.get_user(claims.user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                self.auth_failed();
                return;
            }
            Err(err) => {
                self.store_failure(err);
                return;
            }
        };

        self.state
            .registry
            .register(self.conn, user.id, self.outbound.clone());
        if let Err(err) = self.state.users.set_presence(user.id, true, Utc::now()).await {
            warn!(user = %user.id, error = %err, "Failed to record presence");
        }
        self.start_heartbeat();

        info!(connection = %self.conn, user = %user.id, "Session authenticated");
        self.send(ServerEnvelope::AuthSuccess {
            user_id: user.id,
            user_name: user.name.clone(),
            sequence: None,
        });
        self.identity = Some(user);
    }

    fn auth_failed(&self) {
        metrics::record_error("auth");
        self.send_error(
            ErrorCode::AuthFailed,
            "Authentication failed. Invalid or expired token.",
        );
    }

    fn start_heartbeat(&mut self) {
        let events = self.events.clone();
        let interval = self.state.config.heartbeat.interval();
        self.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                if events.send(SessionEvent::HeartbeatTick).is_err() {
                    break;
                }
            }
        }));
    }

    async fn handle_message(
        &mut self,
        conversation: ConversationId,
        content: &str,
        forwarded_from: Option<MessageId>,
        media_ids: Option<Vec<Uuid>>,
    ) {
        let Some(user) = self.identity.clone() else {
            return;
        };

        if !self.require_participant(user.id, conversation).await {
            return;
        }
        if !self.require_live_conversation(conversation).await {
            return;
        }
        if let Some(original) = forwarded_from {
            match self.state.messages.get_message(original, false).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    self.send_error(ErrorCode::MessageNotFound, "Forwarded message not found");
                    return;
                }
                Err(err) => {
                    self.store_failure(err);
                    return;
                }
            }
        }

        let mut record = match self
            .state
            .messages
            .create_message(user.id, conversation, content, forwarded_from)
            .await
        {
            Ok(record) => record,
            Err(err) => {
                self.store_failure(err);
                return;
            }
        };

        if let Some(media_ids) = media_ids.filter(|ids| !ids.is_empty()) {
            match self
                .state
                .messages
                .claim_media(&media_ids, record.id, conversation)
                .await
            {
                Ok(media) => record.media = media,
                Err(err) => {
                    self.store_failure(err);
                    return;
                }
            }
        }

        // Sending into a conversation implies interest in its events.
        self.state.registry.subscribe(user.id, conversation);

        let participants = match self.state.conversations.participants(conversation).await {
            Ok(participants) => participants,
            Err(err) => {
                self.store_failure(err);
                return;
            }
        };

        let reached = self.state.registry.broadcast_to_participants(
            &message_envelope(&record),
            &participants,
            &[],
        );
        debug!(
            message = %record.id,
            conversation = %conversation,
            reached = reached.len(),
            "Message broadcast"
        );

        self.notify_offline(&participants, &record).await;
    }

    /// Push-notify participants with no live connection anywhere.
    async fn notify_offline(&self, participants: &[Uuid], record: &MessageRecord) {
        let summary = MessageSummary {
            conversation_id: record.conversation_id,
            message_id: record.id,
            sender_name: record.sender_name.clone(),
            preview: record.content.chars().take(PREVIEW_CHARS).collect(),
        };
        for &participant in participants {
            if participant == record.sender_id || self.state.registry.is_online(participant) {
                continue;
            }
            self.state.notifier.message_created(participant, &summary).await;
        }
    }

    async fn handle_edit(&mut self, message: MessageId, content: &str) {
        let Some(user) = self.identity.clone() else {
            return;
        };
        let Some(record) = self.fetch_message(message).await else {
            return;
        };
        if record.sender_id != user.id {
            self.send_error(
                ErrorCode::PermissionDenied,
                "Only the sender can edit a message",
            );
            return;
        }

        let updated = match self.state.messages.update_content(message, content).await {
            Ok(updated) => updated,
            Err(err) => {
                self.store_failure(err);
                return;
            }
        };

        self.broadcast_to_conversation(
            record.conversation_id,
            ServerEnvelope::MessageEdit {
                message_id: message,
                content: updated.content,
                updated_at: updated.updated_at,
                sequence: None,
            },
            &[],
        )
        .await;
    }

    async fn handle_delete(&mut self, message: MessageId) {
        let Some(user) = self.identity.clone() else {
            return;
        };
        let Some(record) = self.fetch_message(message).await else {
            return;
        };
        if record.sender_id != user.id {
            self.send_error(
                ErrorCode::PermissionDenied,
                "Only the sender can delete a message",
            );
            return;
        }

        let deleted = match self.state.messages.soft_delete(message).await {
            Ok(deleted) => deleted,
            Err(err) => {
                self.store_failure(err);
                return;
            }
        };

        self.broadcast_to_conversation(
            record.conversation_id,
            ServerEnvelope::MessageDelete {
                message_id: message,
                conversation_id: record.conversation_id,
                deleted_at: deleted.deleted_at.unwrap_or_else(Utc::now),
                sequence: None,
            },
            &[],
        )
        .await;
    }

    async fn handle_forward(&mut self, message: MessageId, target: ConversationId) {
        let Some(user) = self.identity.clone() else {
            return;
        };
        let Some(original) = self.fetch_message(message).await else {
            return;
        };
        // Forwarding requires membership on both ends.
        if !self.require_participant(user.id, original.conversation_id).await
            || !self.require_participant(user.id, target).await
        {
            return;
        }
        if !self.require_live_conversation(target).await {
            return;
        }

        let forwarded = match self
            .state
            .messages
            .forward_message(message, user.id, target)
            .await
        {
            Ok(forwarded) => forwarded,
            Err(err) => {
                self.store_failure(err);
                return;
            }
        };

        self.state.registry.subscribe(user.id, target);
        self.broadcast_to_conversation(
            target,
            ServerEnvelope::MessageForward {
                original_message_id: message,
                new_message_id: forwarded.id,
                conversation_id: target,
                forwarded_from_id: message,
                content: forwarded.content,
                created_at: forwarded.created_at,
                sequence: None,
            },
            &[],
        )
        .await;
    }

    async fn handle_typing_start(&mut self, conversation: ConversationId) {
        let Some(user) = self.identity.clone() else {
            return;
        };
        if !self.require_participant(user.id, conversation).await {
            return;
        }

        // A repeated start resets the auto-expiry clock.
        if let Some(previous) = self.typing.remove(&conversation) {
            previous.abort();
        }
        self.broadcast_typing(conversation, true).await;

        let events = self.events.clone();
        let timeout = self.state.config.typing.timeout();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(SessionEvent::TypingExpired(conversation));
        });
        self.typing.insert(conversation, timer);
    }

    async fn handle_typing_stop(&mut self, conversation: ConversationId) {
        // Stop without a live indicator is a no-op.
        if let Some(timer) = self.typing.remove(&conversation) {
            timer.abort();
            self.broadcast_typing(conversation, false).await;
        }
    }

    async fn broadcast_typing(&self, conversation: ConversationId, started: bool) {
        let Some(user) = &self.identity else {
            return;
        };
        let envelope = if started {
            ServerEnvelope::TypingStart {
                user_id: user.id,
                user_name: user.name.clone(),
                conversation_id: conversation,
                sequence: None,
            }
        } else {
            ServerEnvelope::TypingStop {
                user_id: user.id,
                user_name: user.name.clone(),
                conversation_id: conversation,
                sequence: None,
            }
        };
        let exclude = [user.id];
        self.broadcast_to_conversation(conversation, envelope, &exclude)
            .await;
    }

    async fn handle_mark_read(&mut self, message: MessageId, conversation: ConversationId) {
        let Some(user) = self.identity.clone() else {
            return;
        };
        match self
            .state
            .reads
            .advance_cursor(user.id, conversation, message)
            .await
        {
            Ok(true) => {
                self.send(ServerEnvelope::MarkReadSuccess {
                    message_id: message,
                    conversation_id: conversation,
                    sequence: None,
                });
                self.broadcast_to_conversation(
                    conversation,
                    ServerEnvelope::MessageRead {
                        message_id: message,
                        conversation_id: conversation,
                        reader_id: user.id,
                        reader_name: user.name.clone(),
                        sequence: None,
                    },
                    &[user.id],
                )
                .await;
            }
            Ok(false) => {
                self.send_error(
                    ErrorCode::MessageNotFound,
                    "Message not found in this conversation",
                );
            }
            Err(err) => self.store_failure(err),
        }
    }

    async fn handle_subscribe(&mut self, conversation: ConversationId) {
        let Some(user) = self.identity.clone() else {
            return;
        };
        if !self.require_participant(user.id, conversation).await {
            return;
        }
        self.state.registry.subscribe(user.id, conversation);
    }

    /// Release everything the connection holds. Idempotent; called on every
    /// exit path.
    pub async fn cleanup(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        for (_, timer) in self.typing.drain() {
            timer.abort();
        }

        let Some(user) = self.identity.take() else {
            return;
        };
        self.state.limiter.reset(user.id);
        self.state.registry.unregister(self.conn);
        // Another device may still be connected; only then stamp last-seen.
        if !self.state.registry.is_online(user.id) {
            if let Err(err) = self
                .state
                .users
                .set_presence(user.id, false, Utc::now())
                .await
            {
                warn!(user = %user.id, error = %err, "Failed to record last-seen");
            }
        }
        info!(connection = %self.conn, user = %user.id, "Session closed");
    }

    // -- helpers ---------------------------------------------------------

    async fn broadcast_to_conversation(
        &self,
        conversation: ConversationId,
        envelope: ServerEnvelope,
        exclude: &[Uuid],
    ) {
        match self.state.conversations.participants(conversation).await {
            Ok(participants) => {
                self.state
                    .registry
                    .broadcast_to_participants(&envelope, &participants, exclude);
            }
            Err(err) => self.store_failure(err),
        }
    }

    /// Fetch a non-deleted message or reply MESSAGE_NOT_FOUND.
    async fn fetch_message(&self, id: MessageId) -> Option<MessageRecord> {
        match self.state.messages.get_message(id, false).await {
            Ok(Some(record)) => Some(record),
            Ok(None) => {
                self.send_error(ErrorCode::MessageNotFound, "Message not found");
                None
            }
            Err(err) => {
                self.store_failure(err);
                None
            }
        }
    }

    async fn require_participant(&self, user: Uuid, conversation: ConversationId) -> bool {
        match self.state.conversations.is_participant(user, conversation).await {
            Ok(true) => true,
            Ok(false) => {
                self.send_error(
                    ErrorCode::PermissionDenied,
                    "Not a participant of this conversation",
                );
                false
            }
            Err(err) => {
                self.store_failure(err);
                false
            }
        }
    }

    async fn require_live_conversation(&self, conversation: ConversationId) -> bool {
        match self.state.conversations.get_conversation(conversation).await {
            Ok(Some(meta)) if !meta.is_deleted => true,
            Ok(_) => {
                self.send_error(ErrorCode::ConversationNotFound, "Conversation not found");
                false
            }
            Err(err) => {
                self.store_failure(err);
                false
            }
        }
    }

    /// Answer a storage failure without leaking backend detail.
    fn store_failure(&self, err: StoreError) {
        metrics::record_error("store");
        match err {
            StoreError::NotFound(Entity::Message) => {
                self.send_error(ErrorCode::MessageNotFound, "Message not found");
            }
            StoreError::NotFound(Entity::Conversation) => {
                self.send_error(ErrorCode::ConversationNotFound, "Conversation not found");
            }
            StoreError::NotFound(Entity::User) => {
                self.send_error(ErrorCode::UserNotFound, "User not found");
            }
            StoreError::NotFound(Entity::Media) | StoreError::Invalid(_) => {
                self.send_error(ErrorCode::InvalidMessage, err.to_string());
            }
            StoreError::Backend(detail) => {
                warn!(connection = %self.conn, error = %detail, "Storage backend failure");
                self.send_error(ErrorCode::InternalError, "Internal server error");
            }
        }
    }

    fn send(&self, envelope: ServerEnvelope) {
        // A closed writer is handled by the drive loop; nothing to do here.
        let _ = self.outbound.send(envelope);
    }

    fn send_error(&self, code: ErrorCode, message: impl Into<String>) {
        self.send(ServerEnvelope::error(code, message));
    }
}

fn rate_category(envelope: &ClientEnvelope) -> RateCategory {
    match envelope {
        ClientEnvelope::Auth { .. } => RateCategory::Auth,
        ClientEnvelope::Message { .. }
        | ClientEnvelope::MessageEdit { .. }
        | ClientEnvelope::MessageDelete { .. }
        | ClientEnvelope::MessageForward { .. } => RateCategory::MessageMutation,
        ClientEnvelope::TypingStart { .. } | ClientEnvelope::TypingStop { .. } => {
            RateCategory::Typing
        }
        _ => RateCategory::General,
    }
}

/// Wire form of a persisted message.
fn message_envelope(record: &MessageRecord) -> ServerEnvelope {
    ServerEnvelope::Message {
        id: record.id,
        content: record.content.clone(),
        sender_id: record.sender_id,
        conversation_id: record.conversation_id,
        forwarded_from_id: record.forwarded_from_id,
        sender_name: record.sender_name.clone(),
        media: record.media.clone(),
        created_at: record.created_at,
        updated_at: record.updated_at,
        is_edited: record.is_edited,
        is_deleted: record.is_deleted,
        sequence: None,
    }
}
