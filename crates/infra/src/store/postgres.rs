//! Postgres-backed auth store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `Conflict` | Duplicate email, role name or session token |
//! | Database (foreign key violation) | `23503` | `NotFound` | Grant/assignment referencing an unknown row |
//! | Database (other) | Any other | `Database` | Other database errors |
//! | PoolClosed / Other | N/A | `Database` | Network errors, connection failures, etc. |
//!
//! Multi-step mutations (user creation, credential rotation, reset completion,
//! role deletion) each run in a single transaction.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use gatehouse_auth::{
    Credential, NewRole, PasswordHash, PasswordResetToken, Permission, PermissionId, ResetTokenHash,
    Role, RoleAssignment, Session, SessionToken, User,
};
use gatehouse_core::{RoleId, UserId};

use super::{
    AuthStore, RbacStore, ResetTokenStore, SessionStore, StoreError, StoreResult, UserStore,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id UUID PRIMARY KEY,
        email TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        first_name TEXT NOT NULL DEFAULT '',
        last_name TEXT NOT NULL DEFAULT '',
        email_verified_at TIMESTAMPTZ NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS credentials (
        user_id UUID PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
        password_hash TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS permissions (
        id TEXT PRIMARY KEY,
        module TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT ''
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS roles (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        description TEXT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS role_permissions (
        role_id UUID NOT NULL REFERENCES roles(id) ON DELETE CASCADE,
        permission_id TEXT NOT NULL REFERENCES permissions(id) ON DELETE CASCADE,
        PRIMARY KEY (role_id, permission_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_roles (
        user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        role_id UUID NOT NULL REFERENCES roles(id) ON DELETE RESTRICT,
        assigned_by UUID NULL,
        assigned_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (user_id, role_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        token TEXT PRIMARY KEY,
        user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        expires_at TIMESTAMPTZ NOT NULL,
        ip_address TEXT NULL,
        user_agent TEXT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS sessions_user_id_idx ON sessions (user_id)",
    "CREATE INDEX IF NOT EXISTS sessions_expires_at_idx ON sessions (expires_at)",
    r#"
    CREATE TABLE IF NOT EXISTS password_reset_tokens (
        token_hash TEXT PRIMARY KEY,
        user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        expires_at TIMESTAMPTZ NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS password_reset_tokens_user_id_idx ON password_reset_tokens (user_id)",
];

#[derive(Debug, Clone)]
pub struct PostgresAuthStore {
    pool: Arc<PgPool>,
}

impl PostgresAuthStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect and make sure the schema exists.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Create tables and indexes if missing. Idempotent.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl UserStore for PostgresAuthStore {
    #[instrument(skip(self, user, password_hash), fields(user_id = %user.id), err)]
    async fn create_user(&self, user: User, password_hash: PasswordHash) -> StoreResult<User> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query(
            r#"
            INSERT INTO users (id, email, name, first_name, last_name, email_verified_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(user.id.as_uuid())
        .bind(&user.email)
        .bind(&user.name)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(user.email_verified_at)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("create_user", e))?;

        sqlx::query("INSERT INTO credentials (user_id, password_hash) VALUES ($1, $2)")
            .bind(user.id.as_uuid())
            .bind(password_hash.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("create_credential", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Ok(user)
    }

    #[instrument(skip(self), err)]
    async fn get_user(&self, user_id: UserId) -> StoreResult<Option<User>> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(user_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_user", e))?;
        row.as_ref()
            .map(user_from_row)
            .transpose()
            .map_err(|e| map_sqlx_error("get_user", e))
    }

    #[instrument(skip(self, email), err)]
    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1"))
            .bind(email)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_user_by_email", e))?;
        row.as_ref()
            .map(user_from_row)
            .transpose()
            .map_err(|e| map_sqlx_error("find_user_by_email", e))
    }

    #[instrument(skip(self), err)]
    async fn credential(&self, user_id: UserId) -> StoreResult<Option<Credential>> {
        let hash: Option<String> =
            sqlx::query_scalar("SELECT password_hash FROM credentials WHERE user_id = $1")
                .bind(user_id.as_uuid())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("credential", e))?;
        Ok(hash.map(|hash| Credential {
            user_id,
            password_hash: PasswordHash::from_stored(hash),
        }))
    }

    #[instrument(skip(self, password_hash), err)]
    async fn rotate_credential(
        &self,
        user_id: UserId,
        password_hash: PasswordHash,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let updated = sqlx::query("UPDATE users SET updated_at = $2 WHERE id = $1")
            .bind(user_id.as_uuid())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("rotate_credential", e))?;
        if updated.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::NotFound(format!("user {user_id}")));
        }

        let revoked = write_credential_and_clear_sessions(&mut tx, user_id, &password_hash).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Ok(revoked)
    }
}

#[async_trait]
impl RbacStore for PostgresAuthStore {
    #[instrument(skip(self, permission), fields(permission = %permission.id), err)]
    async fn upsert_permission(&self, permission: Permission) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO permissions (id, module, description)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET module = EXCLUDED.module, description = EXCLUDED.description
            "#,
        )
        .bind(permission.id.as_str())
        .bind(&permission.module)
        .bind(&permission.description)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_permission", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list_permissions(&self) -> StoreResult<Vec<Permission>> {
        let rows = sqlx::query("SELECT id, module, description FROM permissions ORDER BY id")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_permissions", e))?;
        rows.iter()
            .map(permission_from_row)
            .collect::<Result<_, _>>()
            .map_err(|e| map_sqlx_error("list_permissions", e))
    }

    #[instrument(skip(self, role), fields(name = %role.name), err)]
    async fn create_role(&self, role: NewRole, now: DateTime<Utc>) -> StoreResult<Role> {
        let role = role.into_role(now);
        sqlx::query(
            r#"
            INSERT INTO roles (id, name, description, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(role.id.as_uuid())
        .bind(&role.name)
        .bind(&role.description)
        .bind(role.created_at)
        .bind(role.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_role", e))?;
        Ok(role)
    }

    #[instrument(skip(self), err)]
    async fn get_role(&self, role_id: RoleId) -> StoreResult<Option<Role>> {
        let row = sqlx::query(&format!("SELECT {ROLE_COLUMNS} FROM roles WHERE id = $1"))
            .bind(role_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_role", e))?;
        row.as_ref()
            .map(role_from_row)
            .transpose()
            .map_err(|e| map_sqlx_error("get_role", e))
    }

    #[instrument(skip(self), err)]
    async fn find_role_by_name(&self, name: &str) -> StoreResult<Option<Role>> {
        let row = sqlx::query(&format!("SELECT {ROLE_COLUMNS} FROM roles WHERE name = $1"))
            .bind(name)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_role_by_name", e))?;
        row.as_ref()
            .map(role_from_row)
            .transpose()
            .map_err(|e| map_sqlx_error("find_role_by_name", e))
    }

    #[instrument(skip(self), err)]
    async fn list_roles(&self) -> StoreResult<Vec<Role>> {
        let rows = sqlx::query(&format!("SELECT {ROLE_COLUMNS} FROM roles ORDER BY name"))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_roles", e))?;
        rows.iter()
            .map(role_from_row)
            .collect::<Result<_, _>>()
            .map_err(|e| map_sqlx_error("list_roles", e))
    }

    #[instrument(skip(self), err)]
    async fn delete_role(&self, role_id: RoleId) -> StoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Row lock blocks concurrent assignments (their FK check needs KEY SHARE).
        let exists: Option<uuid::Uuid> = sqlx::query_scalar("SELECT id FROM roles WHERE id = $1 FOR UPDATE")
            .bind(role_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_role", e))?;
        if exists.is_none() {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::NotFound(format!("role {role_id}")));
        }

        let holders: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM user_roles WHERE role_id = $1")
            .bind(role_id.as_uuid())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_role", e))?;
        if holders > 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::Conflict(format!(
                "role is assigned to {holders} user(s)"
            )));
        }

        sqlx::query("DELETE FROM roles WHERE id = $1")
            .bind(role_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_role", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    #[instrument(skip(self), fields(permission = %permission), err)]
    async fn grant_permission(&self, role_id: RoleId, permission: &PermissionId) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO role_permissions (role_id, permission_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(role_id.as_uuid())
        .bind(permission.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("grant_permission", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(permission = %permission), err)]
    async fn revoke_permission(&self, role_id: RoleId, permission: &PermissionId) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM role_permissions WHERE role_id = $1 AND permission_id = $2")
            .bind(role_id.as_uuid())
            .bind(permission.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("revoke_permission", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn role_permissions(&self, role_id: RoleId) -> StoreResult<Vec<PermissionId>> {
        let rows = sqlx::query(
            "SELECT permission_id FROM role_permissions WHERE role_id = $1 ORDER BY permission_id",
        )
        .bind(role_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("role_permissions", e))?;
        permission_ids(&rows).map_err(|e| map_sqlx_error("role_permissions", e))
    }

    #[instrument(skip(self), err)]
    async fn assign_role(
        &self,
        user_id: UserId,
        role_id: RoleId,
        assigned_by: Option<UserId>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO user_roles (user_id, role_id, assigned_by, assigned_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, role_id) DO NOTHING
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(role_id.as_uuid())
        .bind(assigned_by.map(|id| *id.as_uuid()))
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("assign_role", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn remove_role(&self, user_id: UserId, role_id: RoleId) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM user_roles WHERE user_id = $1 AND role_id = $2")
            .bind(user_id.as_uuid())
            .bind(role_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("remove_role", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn role_assignments(&self, user_id: UserId) -> StoreResult<Vec<RoleAssignment>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, role_id, assigned_by, assigned_at
            FROM user_roles
            WHERE user_id = $1
            ORDER BY assigned_at
            "#,
        )
        .bind(user_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("role_assignments", e))?;
        rows.iter()
            .map(assignment_from_row)
            .collect::<Result<_, _>>()
            .map_err(|e| map_sqlx_error("role_assignments", e))
    }

    #[instrument(skip(self), err)]
    async fn effective_permissions(&self, user_id: UserId) -> StoreResult<Vec<PermissionId>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT rp.permission_id
            FROM user_roles ur
            JOIN role_permissions rp ON rp.role_id = ur.role_id
            WHERE ur.user_id = $1
            ORDER BY rp.permission_id
            "#,
        )
        .bind(user_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("effective_permissions", e))?;
        permission_ids(&rows).map_err(|e| map_sqlx_error("effective_permissions", e))
    }

    #[instrument(skip(self), fields(permission = %permission), err)]
    async fn has_permission(&self, user_id: UserId, permission: &PermissionId) -> StoreResult<bool> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM user_roles ur
                JOIN role_permissions rp ON rp.role_id = ur.role_id
                WHERE ur.user_id = $1 AND rp.permission_id = $2
            )
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(permission.as_str())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("has_permission", e))
    }

    #[instrument(skip(self, permissions), fields(count = permissions.len()), err)]
    async fn has_any_permission(
        &self,
        user_id: UserId,
        permissions: &[PermissionId],
    ) -> StoreResult<bool> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM user_roles ur
                JOIN role_permissions rp ON rp.role_id = ur.role_id
                WHERE ur.user_id = $1 AND rp.permission_id = ANY($2)
            )
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(id_strings(permissions))
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("has_any_permission", e))
    }

    #[instrument(skip(self, permissions), fields(count = permissions.len()), err)]
    async fn held_permissions(
        &self,
        user_id: UserId,
        permissions: &[PermissionId],
    ) -> StoreResult<Vec<PermissionId>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT rp.permission_id
            FROM user_roles ur
            JOIN role_permissions rp ON rp.role_id = ur.role_id
            WHERE ur.user_id = $1 AND rp.permission_id = ANY($2)
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(id_strings(permissions))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("held_permissions", e))?;
        permission_ids(&rows).map_err(|e| map_sqlx_error("held_permissions", e))
    }
}

#[async_trait]
impl SessionStore for PostgresAuthStore {
    #[instrument(skip(self, session), fields(user_id = %session.user_id, session = %session.token.redacted()), err)]
    async fn insert_session(&self, session: Session) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (token, user_id, expires_at, ip_address, user_agent, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(session.token.as_str())
        .bind(session.user_id.as_uuid())
        .bind(session.expires_at)
        .bind(&session.ip_address)
        .bind(&session.user_agent)
        .bind(session.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_session", e))?;
        Ok(())
    }

    #[instrument(skip(self, token), fields(session = %token.redacted()), err)]
    async fn find_session(&self, token: &SessionToken) -> StoreResult<Option<Session>> {
        let row = sqlx::query(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE token = $1"))
            .bind(token.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_session", e))?;
        row.as_ref()
            .map(session_from_row)
            .transpose()
            .map_err(|e| map_sqlx_error("find_session", e))
    }

    #[instrument(skip(self, token), fields(session = %token.redacted()), err)]
    async fn delete_session(&self, token: &SessionToken) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE token = $1")
            .bind(token.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_session", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn delete_user_sessions(&self, user_id: UserId) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE user_id = $1")
            .bind(user_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_user_sessions", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn list_user_sessions(&self, user_id: UserId) -> StoreResult<Vec<Session>> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = $1 ORDER BY created_at"
        ))
        .bind(user_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_user_sessions", e))?;
        rows.iter()
            .map(session_from_row)
            .collect::<Result<_, _>>()
            .map_err(|e| map_sqlx_error("list_user_sessions", e))
    }

    #[instrument(skip(self), err)]
    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= $1")
            .bind(now)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_expired_sessions", e))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ResetTokenStore for PostgresAuthStore {
    #[instrument(skip(self, token), fields(user_id = %token.user_id), err)]
    async fn replace_reset_token(&self, token: PasswordResetToken) -> StoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("DELETE FROM password_reset_tokens WHERE user_id = $1")
            .bind(token.user_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("replace_reset_token", e))?;

        sqlx::query(
            r#"
            INSERT INTO password_reset_tokens (token_hash, user_id, expires_at, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(token.token_hash.as_str())
        .bind(token.user_id.as_uuid())
        .bind(token.expires_at)
        .bind(token.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("replace_reset_token", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    #[instrument(skip(self, hash), err)]
    async fn find_reset_token(&self, hash: &ResetTokenHash) -> StoreResult<Option<PasswordResetToken>> {
        let row = sqlx::query(
            "SELECT token_hash, user_id, expires_at, created_at FROM password_reset_tokens WHERE token_hash = $1",
        )
        .bind(hash.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_reset_token", e))?;
        row.as_ref()
            .map(reset_token_from_row)
            .transpose()
            .map_err(|e| map_sqlx_error("find_reset_token", e))
    }

    #[instrument(skip(self, hash), err)]
    async fn delete_reset_token(&self, hash: &ResetTokenHash) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM password_reset_tokens WHERE token_hash = $1")
            .bind(hash.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_reset_token", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, hash, password_hash), err)]
    async fn complete_password_reset(
        &self,
        hash: &ResetTokenHash,
        password_hash: PasswordHash,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Deleting first makes a concurrent second use find nothing.
        let user_id: Option<uuid::Uuid> = sqlx::query_scalar(
            "DELETE FROM password_reset_tokens WHERE token_hash = $1 RETURNING user_id",
        )
        .bind(hash.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("complete_password_reset", e))?;
        let Some(user_id) = user_id.map(UserId::from_uuid) else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::NotFound("reset token".to_string()));
        };

        sqlx::query("UPDATE users SET updated_at = $2 WHERE id = $1")
            .bind(user_id.as_uuid())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("complete_password_reset", e))?;

        sqlx::query("DELETE FROM password_reset_tokens WHERE user_id = $1")
            .bind(user_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("complete_password_reset", e))?;

        let revoked = write_credential_and_clear_sessions(&mut tx, user_id, &password_hash).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Ok(revoked)
    }
}

#[async_trait]
impl AuthStore for PostgresAuthStore {
    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("health_check", e))?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

async fn write_credential_and_clear_sessions(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user_id: UserId,
    password_hash: &PasswordHash,
) -> StoreResult<u64> {
    sqlx::query(
        r#"
        INSERT INTO credentials (user_id, password_hash)
        VALUES ($1, $2)
        ON CONFLICT (user_id) DO UPDATE SET password_hash = EXCLUDED.password_hash
        "#,
    )
    .bind(user_id.as_uuid())
    .bind(password_hash.as_str())
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("write_credential", e))?;

    let result = sqlx::query("DELETE FROM sessions WHERE user_id = $1")
        .bind(user_id.as_uuid())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("delete_user_sessions", e))?;
    Ok(result.rows_affected())
}

const USER_COLUMNS: &str =
    "id, email, name, first_name, last_name, email_verified_at, created_at, updated_at";
const ROLE_COLUMNS: &str = "id, name, description, created_at, updated_at";
const SESSION_COLUMNS: &str = "token, user_id, expires_at, ip_address, user_agent, created_at";

fn user_from_row(row: &PgRow) -> Result<User, sqlx::Error> {
    Ok(User {
        id: UserId::from_uuid(row.try_get("id")?),
        email: row.try_get("email")?,
        name: row.try_get("name")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        email_verified_at: row.try_get("email_verified_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn role_from_row(row: &PgRow) -> Result<Role, sqlx::Error> {
    Ok(Role {
        id: RoleId::from_uuid(row.try_get("id")?),
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn session_from_row(row: &PgRow) -> Result<Session, sqlx::Error> {
    Ok(Session {
        token: SessionToken::from_string(row.try_get::<String, _>("token")?),
        user_id: UserId::from_uuid(row.try_get("user_id")?),
        expires_at: row.try_get("expires_at")?,
        ip_address: row.try_get("ip_address")?,
        user_agent: row.try_get("user_agent")?,
        created_at: row.try_get("created_at")?,
    })
}

fn permission_from_row(row: &PgRow) -> Result<Permission, sqlx::Error> {
    Ok(Permission {
        id: permission_id(row, "id")?,
        module: row.try_get("module")?,
        description: row.try_get("description")?,
    })
}

fn assignment_from_row(row: &PgRow) -> Result<RoleAssignment, sqlx::Error> {
    let assigned_by: Option<uuid::Uuid> = row.try_get("assigned_by")?;
    Ok(RoleAssignment {
        user_id: UserId::from_uuid(row.try_get("user_id")?),
        role_id: RoleId::from_uuid(row.try_get("role_id")?),
        assigned_by: assigned_by.map(UserId::from_uuid),
        assigned_at: row.try_get("assigned_at")?,
    })
}

fn reset_token_from_row(row: &PgRow) -> Result<PasswordResetToken, sqlx::Error> {
    Ok(PasswordResetToken {
        token_hash: ResetTokenHash::from_stored(row.try_get::<String, _>("token_hash")?),
        user_id: UserId::from_uuid(row.try_get("user_id")?),
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn permission_id(row: &PgRow, column: &str) -> Result<PermissionId, sqlx::Error> {
    let raw: String = row.try_get(column)?;
    PermissionId::parse(raw).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn permission_ids(rows: &[PgRow]) -> Result<Vec<PermissionId>, sqlx::Error> {
    rows.iter().map(|row| permission_id(row, "permission_id")).collect()
}

fn id_strings(ids: &[PermissionId]) -> Vec<String> {
    ids.iter().map(|id| id.as_str().to_string()).collect()
}

/// Map SQLx errors to `StoreError` (see the module docs).
fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
            Some(code @ ("23505" | "23503")) => {
                debug!(operation, code, error = %db_err.message(), "constraint violation");
                constraint_error(operation, code == "23505")
            }
            _ => StoreError::database(operation, db_err.message()),
        },
        sqlx::Error::PoolClosed => StoreError::database(operation, "connection pool closed"),
        _ => StoreError::database(operation, err.to_string()),
    }
}

/// Caller-facing error for a constraint violation. Constraint and table names
/// stay in the logs.
fn constraint_error(operation: &'static str, unique: bool) -> StoreError {
    if unique {
        let msg = match operation {
            "create_user" => "email already registered",
            "create_role" => "role name already exists",
            "insert_session" => "session token collision",
            _ => "record already exists",
        };
        StoreError::Conflict(msg.to_string())
    } else {
        let what = match operation {
            "grant_permission" => "role or permission",
            "assign_role" => "user or role",
            "create_credential" | "write_credential" | "rotate_credential" => "user",
            _ => "referenced record",
        };
        StoreError::NotFound(what.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_errors_carry_fixed_messages() {
        match constraint_error("create_role", true) {
            StoreError::Conflict(msg) => assert_eq!(msg, "role name already exists"),
            other => panic!("expected conflict, got {other:?}"),
        }
        match constraint_error("assign_role", false) {
            StoreError::NotFound(what) => assert_eq!(what, "user or role"),
            other => panic!("expected not found, got {other:?}"),
        }
        for unique in [true, false] {
            let msg = constraint_error("upsert_permission", unique).to_string();
            assert!(!msg.contains("_fkey") && !msg.contains("_key"), "{msg}");
        }
    }
}
