//! Password-reset capabilities.
//!
//! The raw token leaves the process exactly once (in the reset link). Only its
//! SHA-256 digest is stored, so a leaked table cannot be replayed.

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

use gatehouse_core::UserId;

use crate::session::random_hex_32;

pub const DEFAULT_RESET_TTL_MINUTES: i64 = 30;

/// Raw reset token as handed to the user. Never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct RawResetToken(String);

impl RawResetToken {
    pub fn generate() -> Self {
        Self(random_hex_32())
    }

    pub fn from_string(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn digest(&self) -> ResetTokenHash {
        ResetTokenHash(hex::encode(Sha256::digest(self.0.as_bytes())))
    }
}

impl core::fmt::Debug for RawResetToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("RawResetToken(<redacted>)")
    }
}

/// SHA-256 digest of a raw reset token (hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResetTokenHash(String);

impl ResetTokenHash {
    pub fn from_stored(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Stored, single-use reset capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordResetToken {
    pub token_hash: ResetTokenHash,
    pub user_id: UserId,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl PasswordResetToken {
    /// Issue a new token for `user_id`; returns the stored record and the raw
    /// value to deliver.
    pub fn issue(user_id: UserId, now: DateTime<Utc>, ttl: Duration) -> (Self, RawResetToken) {
        let raw = RawResetToken::generate();
        let record = Self {
            token_hash: raw.digest(),
            user_id,
            expires_at: now + ttl,
            created_at: now,
        };
        (record, raw)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
