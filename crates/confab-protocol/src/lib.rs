//! # confab-protocol
//!
//! Wire protocol definitions for the confab realtime chat engine.
//!
//! Every frame on the wire is a single JSON object with a `type`
//! discriminator. This crate defines the closed set of envelopes in each
//! direction plus the codec that validates and decodes inbound frames.
//!
//! ## Envelope directions
//!
//! - [`ClientEnvelope`] - frames a client may send (`auth`, `message`,
//!   `typing_start`, `ping`, ...)
//! - [`ServerEnvelope`] - frames the server emits (`message`, `pong`,
//!   `error`, ...), each substantive one carrying a per-connection
//!   `sequence` number
//!
//! ## Example
//!
//! ```rust
//! use confab_protocol::{codec, ClientEnvelope};
//!
//! let raw = r#"{"type":"typing_start","conversation_id":"1f5e4a9e-9b6a-4c1e-9d3a-7b2f0c8d1e22"}"#;
//! let envelope = codec::decode_client(raw, 64 * 1024).unwrap();
//! assert!(matches!(envelope, ClientEnvelope::TypingStart { .. }));
//! ```

pub mod codec;
pub mod envelope;

pub use codec::{decode_client, encode_server, DecodeError};
pub use envelope::{
    AckStatus, ClientEnvelope, ErrorCode, Media, ServerEnvelope, MAX_CONTENT_CHARS,
};
