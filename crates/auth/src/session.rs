//! Server-side session records.
//!
//! A session record is the authoritative half of the hybrid session: the
//! signed token only names it (`sessionToken` claim). Deleting the record
//! revokes the session no matter what the client still holds.

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use gatehouse_core::UserId;

/// Default lifetime of a session record.
pub const DEFAULT_SESSION_TTL_DAYS: i64 = 30;

/// Opaque, unguessable session token (256 bits from the OS RNG, hex encoded).
///
/// Generated independently of the signed token's signature.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn generate() -> Self {
        Self(random_hex_32())
    }

    pub fn from_string(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix suitable for logs.
    pub fn redacted(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl core::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "SessionToken({}…)", self.redacted())
    }
}

/// 32 bytes from the OS RNG, hex encoded.
pub(crate) fn random_hex_32() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Where a session was created from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOrigin {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Liveness of a session record at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// `now < expires_at`.
    Active,
    /// `now >= expires_at`; invalid, but the record still exists.
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub token: SessionToken,
    pub user_id: UserId,
    pub expires_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Open a new session with a fresh token.
    pub fn open(user_id: UserId, origin: SessionOrigin, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            token: SessionToken::generate(),
            user_id,
            expires_at: now + ttl,
            ip_address: origin.ip_address,
            user_agent: origin.user_agent,
            created_at: now,
        }
    }

    pub fn state(&self, now: DateTime<Utc>) -> SessionState {
        if now < self.expires_at {
            SessionState::Active
        } else {
            SessionState::Expired
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.state(now) == SessionState::Active
    }
}
