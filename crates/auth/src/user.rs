//! User identity records and credentials.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use gatehouse_core::{DomainError, UserId};

use crate::password::PasswordHash;

/// Normalize an email for storage and lookup (trimmed, lower-cased).
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// User identity record.
///
/// Credentials live in a separate [`Credential`] record and are never part of
/// this type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub name: String,
    pub first_name: String,
    pub last_name: String,
    pub email_verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn email_verified(&self) -> bool {
        self.email_verified_at.is_some()
    }
}

/// Input for registering a user.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

impl NewUser {
    pub fn new(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: name.into(),
            first_name: String::new(),
            last_name: String::new(),
        }
    }

    /// Normalize the email and check the minimum shape of the record.
    pub fn normalized(mut self) -> Result<Self, DomainError> {
        self.email = normalize_email(&self.email);
        let valid_email = self
            .email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && !domain.is_empty());
        if !valid_email {
            return Err(DomainError::validation("email is not a valid address"));
        }
        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            return Err(DomainError::validation("name must not be empty"));
        }
        Ok(self)
    }

    pub fn into_user(self, now: DateTime<Utc>) -> User {
        User {
            id: UserId::new(),
            email: self.email,
            name: self.name,
            first_name: self.first_name,
            last_name: self.last_name,
            email_verified_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Stored password credential (one per user).
///
/// Deliberately not `Serialize`; `Debug` output redacts the hash.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub user_id: UserId,
    pub password_hash: PasswordHash,
}

impl core::fmt::Debug for Credential {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Credential")
            .field("user_id", &self.user_id)
            .field("password_hash", &"<redacted>")
            .finish()
    }
}
