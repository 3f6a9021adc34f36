//! Token verification collaborator contract.
//!
//! Token issuance and its cryptography live outside the engine; sessions only
//! need "verify this bearer token, get back an identity and expiry".

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::UserId;

/// The class of a verified token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Short-lived token accepted for session authentication.
    Access,
    /// Refresh token; never valid for a session.
    Refresh,
}

/// Claims extracted from a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    pub user_id: UserId,
    pub kind: TokenKind,
    pub expires_at: DateTime<Utc>,
}

impl TokenClaims {
    /// Whether the token has expired as of `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Token verification errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Token could not be parsed or its signature is invalid.
    #[error("malformed or unsigned token")]
    Malformed,

    /// Token was valid once but has expired.
    #[error("token expired")]
    Expired,

    /// Verifier rejected the token for another reason.
    #[error("token rejected: {0}")]
    Rejected(String),
}

/// Opaque bearer-token verification.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify a token and return its claims.
    async fn verify(&self, token: &str) -> Result<TokenClaims, AuthError>;
}
