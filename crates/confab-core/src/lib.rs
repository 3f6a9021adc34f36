//! # confab-core
//!
//! Core engine components for the confab realtime chat server.
//!
//! This crate provides the concurrency-sensitive building blocks:
//!
//! - **ConnectionRegistry** - live connections, subscriptions, fan-out
//! - **RateLimiter** - sliding-window admission control per identity
//! - **ReadStateEngine** - unread-first pagination and read receipts
//! - **Repository traits** - contracts for the external persistence,
//!   token-verification, and push-notification collaborators
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────────┐     ┌──────────────┐
//! │   Session   │────▶│ ConnectionRegistry│────▶│  Connections │
//! └─────────────┘     └──────────────────┘     └──────────────┘
//!        │
//!        ├──────▶ RateLimiter
//!        └──────▶ ReadStateEngine ────▶ repositories
//! ```

pub mod auth;
pub mod memory;
pub mod ratelimit;
pub mod readstate;
pub mod registry;
pub mod store;
pub mod types;

pub use auth::{AuthError, TokenClaims, TokenKind, TokenVerifier};
pub use ratelimit::{RateCategory, RateLimiter, RateLimits};
pub use readstate::{ReadStateEngine, Reader};
pub use registry::{ConnectionId, ConnectionRegistry, OutboundSender};
pub use store::{
    ConversationRepository, Entity, MessageRepository, MessageSummary, Notifier, StoreError,
    UserRepository,
};
pub use types::{
    ConversationId, ConversationMeta, MediaId, MessageId, MessageRecord, ReadCursor, UserId,
    UserProfile,
};
