//! Relational store boundary.
//!
//! The core never talks to a database directly: it talks to [`AuthStore`].
//! Every mutating method is a single transaction in the backing store, and
//! methods documented as atomic apply all of their effects or none.
//!
//! There is no cross-request caching behind this trait. Two requests may race
//! (e.g. a role assignment and a permission check on another connection); the
//! check may briefly observe the pre-assignment state. That window is
//! accepted and not papered over with locks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use gatehouse_auth::{
    Credential, NewRole, PasswordHash, PasswordResetToken, Permission, PermissionId, ResetTokenHash,
    Role, RoleAssignment, Session, SessionToken, User,
};
use gatehouse_core::{RoleId, UserId};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryAuthStore;
pub use postgres::PostgresAuthStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Backend failure. The message carries internal detail and is for logs only.
    #[error("database error in {operation}: {message}")]
    Database { operation: &'static str, message: String },
}

impl StoreError {
    pub fn database(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Database {
            operation,
            message: message.into(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Users and their credentials.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Insert a user and its credential in one transaction.
    ///
    /// `Conflict` if the (normalized) email is taken.
    async fn create_user(&self, user: User, password_hash: PasswordHash) -> StoreResult<User>;
    async fn get_user(&self, user_id: UserId) -> StoreResult<Option<User>>;
    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>>;
    async fn credential(&self, user_id: UserId) -> StoreResult<Option<Credential>>;

    /// Replace the credential and delete every session of the user, atomically.
    ///
    /// Returns the number of sessions deleted.
    async fn rotate_credential(
        &self,
        user_id: UserId,
        password_hash: PasswordHash,
        now: DateTime<Utc>,
    ) -> StoreResult<u64>;
}

/// Roles, the permission catalog and both association tables.
#[async_trait]
pub trait RbacStore: Send + Sync {
    async fn upsert_permission(&self, permission: Permission) -> StoreResult<()>;
    async fn list_permissions(&self) -> StoreResult<Vec<Permission>>;

    /// `Conflict` if the name is taken.
    async fn create_role(&self, role: NewRole, now: DateTime<Utc>) -> StoreResult<Role>;
    async fn get_role(&self, role_id: RoleId) -> StoreResult<Option<Role>>;
    async fn find_role_by_name(&self, name: &str) -> StoreResult<Option<Role>>;
    async fn list_roles(&self) -> StoreResult<Vec<Role>>;

    /// Delete a role and its permission grants.
    ///
    /// `Conflict` while any user holds the role; the check and the delete are
    /// one transaction. `NotFound` if there is no such role.
    async fn delete_role(&self, role_id: RoleId) -> StoreResult<()>;

    /// Returns `false` if the grant already existed. `NotFound` for an unknown
    /// role or a permission outside the catalog.
    async fn grant_permission(&self, role_id: RoleId, permission: &PermissionId) -> StoreResult<bool>;
    async fn revoke_permission(&self, role_id: RoleId, permission: &PermissionId) -> StoreResult<bool>;
    async fn role_permissions(&self, role_id: RoleId) -> StoreResult<Vec<PermissionId>>;

    /// Returns `false` (and changes nothing) if the user already holds the
    /// role. `NotFound` for an unknown user or role.
    async fn assign_role(
        &self,
        user_id: UserId,
        role_id: RoleId,
        assigned_by: Option<UserId>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;
    async fn remove_role(&self, user_id: UserId, role_id: RoleId) -> StoreResult<bool>;
    async fn role_assignments(&self, user_id: UserId) -> StoreResult<Vec<RoleAssignment>>;

    /// Distinct permission ids reachable through the user's roles, sorted.
    async fn effective_permissions(&self, user_id: UserId) -> StoreResult<Vec<PermissionId>>;

    /// Existence check for one permission through any role.
    async fn has_permission(&self, user_id: UserId, permission: &PermissionId) -> StoreResult<bool>;

    /// Existence check for at least one of `permissions`.
    async fn has_any_permission(
        &self,
        user_id: UserId,
        permissions: &[PermissionId],
    ) -> StoreResult<bool>;

    /// The subset of `permissions` the user holds (any order, no duplicates).
    async fn held_permissions(
        &self,
        user_id: UserId,
        permissions: &[PermissionId],
    ) -> StoreResult<Vec<PermissionId>>;
}

/// Server-side session records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert_session(&self, session: Session) -> StoreResult<()>;
    async fn find_session(&self, token: &SessionToken) -> StoreResult<Option<Session>>;
    async fn delete_session(&self, token: &SessionToken) -> StoreResult<bool>;
    async fn delete_user_sessions(&self, user_id: UserId) -> StoreResult<u64>;
    async fn list_user_sessions(&self, user_id: UserId) -> StoreResult<Vec<Session>>;
    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> StoreResult<u64>;
}

/// Password-reset tokens.
#[async_trait]
pub trait ResetTokenStore: Send + Sync {
    /// Store a token, replacing any outstanding token of the same user.
    async fn replace_reset_token(&self, token: PasswordResetToken) -> StoreResult<()>;
    async fn find_reset_token(&self, hash: &ResetTokenHash) -> StoreResult<Option<PasswordResetToken>>;
    async fn delete_reset_token(&self, hash: &ResetTokenHash) -> StoreResult<bool>;

    /// Consume a reset token, atomically:
    /// - replace the user's credential
    /// - delete the user's reset tokens
    /// - delete every session of the user
    ///
    /// `NotFound` if the token vanished (e.g. consumed concurrently); nothing
    /// is applied in that case. Returns the number of sessions deleted.
    async fn complete_password_reset(
        &self,
        hash: &ResetTokenHash,
        password_hash: PasswordHash,
        now: DateTime<Utc>,
    ) -> StoreResult<u64>;
}

/// Everything the core needs from the relational store.
#[async_trait]
pub trait AuthStore: UserStore + RbacStore + SessionStore + ResetTokenStore {
    async fn health_check(&self) -> StoreResult<()>;
    fn backend_name(&self) -> &'static str;
}
