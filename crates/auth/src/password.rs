//! Credential verification (salted, slow hashing).
//!
//! All functions here are CPU-bound and synchronous; async callers should run
//! them on a blocking pool.

use thiserror::Error;

use gatehouse_core::DomainError;

/// bcrypt work factor used for every stored credential.
pub const DEFAULT_COST_FACTOR: u32 = 12;

const MIN_COST_FACTOR: u32 = 4;
const MAX_COST_FACTOR: u32 = 31;

pub const MIN_PASSWORD_CHARS: usize = 8;

/// bcrypt only looks at the first 72 bytes of input.
pub const MAX_PASSWORD_BYTES: usize = 72;

/// A stored password hash (bcrypt modular crypt format).
///
/// `Debug` is redacted and there is no `Display`.
#[derive(Clone, PartialEq, Eq)]
pub struct PasswordHash(String);

impl PasswordHash {
    /// Wrap a hash loaded from storage.
    pub fn from_stored(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Debug for PasswordHash {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("PasswordHash(<redacted>)")
    }
}

#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("password hashing failed: {0}")]
    Hashing(String),
}

/// Check a candidate password against the password policy.
pub fn validate_password(plain: &str) -> Result<(), DomainError> {
    if plain.chars().count() < MIN_PASSWORD_CHARS {
        return Err(DomainError::validation(format!(
            "password must be at least {MIN_PASSWORD_CHARS} characters"
        )));
    }
    if plain.len() > MAX_PASSWORD_BYTES {
        return Err(DomainError::validation(format!(
            "password must be at most {MAX_PASSWORD_BYTES} bytes"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordHasher {
    cost: u32,
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl PasswordHasher {
    pub fn new() -> Self {
        Self {
            cost: DEFAULT_COST_FACTOR,
        }
    }

    /// Use a non-default work factor (bcrypt accepts 4..=31).
    pub fn with_cost(cost: u32) -> Self {
        Self {
            cost: cost.clamp(MIN_COST_FACTOR, MAX_COST_FACTOR),
        }
    }

    pub fn cost(&self) -> u32 {
        self.cost
    }

    /// Hash a password with a fresh random salt.
    pub fn hash(&self, plain: &str) -> Result<PasswordHash, PasswordError> {
        bcrypt::hash(plain, self.cost)
            .map(PasswordHash)
            .map_err(|e| PasswordError::Hashing(e.to_string()))
    }

    /// Compare a password against a stored hash.
    ///
    /// A malformed or tampered hash is a mismatch, never an error.
    pub fn verify(&self, plain: &str, hash: &PasswordHash) -> bool {
        bcrypt::verify(plain, hash.as_str()).unwrap_or(false)
    }

    /// Spend the same work as a verification without a stored hash.
    ///
    /// Used when the identity does not exist so that login latency does not
    /// reveal which emails are registered.
    pub fn burn(&self, plain: &str) {
        let _ = bcrypt::hash(plain, self.cost);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hasher() -> PasswordHasher {
        PasswordHasher::with_cost(4)
    }

    #[test]
    fn default_cost_is_twelve() {
        assert_eq!(PasswordHasher::new().cost(), 12);
    }

    #[test]
    fn correct_password_matches_own_hash() {
        let h = hasher();
        let hash = h.hash("correct horse").unwrap();
        assert!(h.verify("correct horse", &hash));
        assert!(!h.verify("wrong horse", &hash));
    }

    #[test]
    fn password_does_not_match_other_users_hash() {
        let h = hasher();
        let alice = h.hash("alice-password").unwrap();
        let _bob = h.hash("bob-password").unwrap();
        assert!(!h.verify("bob-password", &alice));
    }

    #[test]
    fn same_password_gets_distinct_salts() {
        let h = hasher();
        let a = h.hash("same-password").unwrap();
        let b = h.hash("same-password").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn corrupt_hash_is_a_mismatch_not_an_error() {
        let h = hasher();
        let mut tampered = h.hash("pa55word!").unwrap().as_str().to_string();
        tampered.truncate(20);
        assert!(!h.verify("pa55word!", &PasswordHash::from_stored(tampered)));
        assert!(!h.verify("pa55word!", &PasswordHash::from_stored("")));
        assert!(!h.verify("pa55word!", &PasswordHash::from_stored("not a hash at all")));
    }

    #[test]
    fn policy_enforces_length_bounds() {
        assert!(validate_password("short").is_err());
        assert!(validate_password("long enough").is_ok());
        assert!(validate_password(&"x".repeat(73)).is_err());
    }

    #[test]
    fn debug_never_shows_hash() {
        let hash = hasher().hash("pa55word!").unwrap();
        assert_eq!(format!("{hash:?}"), "PasswordHash(<redacted>)");
    }
}
