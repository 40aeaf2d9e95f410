//! Hybrid authentication: login, token+session validation, logout and the
//! password-reset sub-flow.
//!
//! The signed token is a client-held convenience. The session record it names
//! is what keeps a login alive, so deleting records (logout, password change,
//! reset completion) ends sessions regardless of outstanding tokens.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use gatehouse_auth::authorize::all_outcome;
use gatehouse_auth::reset::DEFAULT_RESET_TTL_MINUTES;
use gatehouse_auth::{
    AuthzError, NewUser, PasswordHash, PasswordHasher, PasswordResetToken, Principal, RawResetToken,
    Requirement, Session, SessionOrigin, TokenClaims, TokenCodec, User,
    normalize_email, validate_password,
};
use gatehouse_core::{DomainError, UserId};

use crate::notify::{Notifier, ResetNotice};
use crate::permissions::PermissionQuery;
use crate::sessions::{SessionManager, SessionSettings, SessionStatus};
use crate::store::{AuthStore, ResetTokenStore, StoreError, UserStore};

/// Why a reset token was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetTokenRejection {
    Invalid,
    Expired,
}

impl ResetTokenRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResetTokenRejection::Invalid => "invalid",
            ResetTokenRejection::Expired => "expired",
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    /// Never says whether the email or the password was wrong.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// `Unauthenticated` and `PermissionDenied` raised at a guard.
    #[error(transparent)]
    Authz(#[from] AuthzError),

    #[error("reset token {}", .0.as_str())]
    ResetToken(ResetTokenRejection),

    #[error(transparent)]
    Validation(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn unauthenticated() -> Self {
        Self::Authz(AuthzError::Unauthenticated)
    }
}

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub session: SessionSettings,
    pub reset_token_ttl: Duration,
    /// Reset links are `<base>?token=<raw>`.
    pub reset_link_base: String,
    pub bcrypt_cost: u32,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            session: SessionSettings::default(),
            reset_token_ttl: Duration::minutes(DEFAULT_RESET_TTL_MINUTES),
            reset_link_base: "http://localhost:3000/reset-password".to_string(),
            bcrypt_cost: gatehouse_auth::password::DEFAULT_COST_FACTOR,
        }
    }
}

/// Successful login: the signed token plus what it was minted from.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub token: String,
    pub user: User,
    pub session: Session,
    pub claims: TokenClaims,
}

pub struct AuthService {
    store: Arc<dyn AuthStore>,
    permissions: PermissionQuery,
    sessions: SessionManager,
    codec: Arc<dyn TokenCodec>,
    notifier: Arc<dyn Notifier>,
    hasher: PasswordHasher,
    reset_token_ttl: Duration,
    reset_link_base: String,
}

impl AuthService {
    pub fn new(
        store: Arc<dyn AuthStore>,
        codec: Arc<dyn TokenCodec>,
        notifier: Arc<dyn Notifier>,
        settings: AuthSettings,
    ) -> Self {
        Self {
            permissions: PermissionQuery::new(store.clone()),
            sessions: SessionManager::new(store.clone(), settings.session),
            store,
            codec,
            notifier,
            hasher: PasswordHasher::with_cost(settings.bcrypt_cost),
            reset_token_ttl: settings.reset_token_ttl,
            reset_link_base: settings.reset_link_base,
        }
    }

    pub fn store(&self) -> &Arc<dyn AuthStore> {
        &self.store
    }

    pub fn permissions(&self) -> &PermissionQuery {
        &self.permissions
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub async fn login(
        &self,
        email: &str,
        password: &str,
        origin: SessionOrigin,
        now: DateTime<Utc>,
    ) -> AuthResult<LoginOutcome> {
        let email = normalize_email(email);
        let Some(user) = self.store.find_user_by_email(&email).await? else {
            self.burn(password).await?;
            info!("login rejected");
            return Err(AuthError::InvalidCredentials);
        };
        let Some(credential) = self.store.credential(user.id).await? else {
            self.burn(password).await?;
            warn!(user_id = %user.id, "login rejected: user has no credential");
            return Err(AuthError::InvalidCredentials);
        };
        if !self.verify(password, credential.password_hash).await? {
            info!(user_id = %user.id, "login rejected");
            return Err(AuthError::InvalidCredentials);
        }

        let permissions = self.permissions.effective_permissions(user.id).await?;
        let session = self.sessions.create(user.id, origin, now).await?;
        let claims = TokenClaims::for_session(
            &user,
            permissions.into_iter().collect(),
            session.token.clone(),
            now,
            session.expires_at,
        );
        let token = match self.codec.encode(&claims) {
            Ok(token) => token,
            Err(err) => {
                self.sessions.revoke(&session.token).await?;
                return Err(AuthError::Internal(err.to_string()));
            }
        };

        info!(user_id = %user.id, session = %session.token.redacted(), "login succeeded");
        Ok(LoginOutcome {
            token,
            user,
            session,
            claims,
        })
    }

    /// Resolve a signed token to a live identity.
    ///
    /// The signature and time window must verify, and the session record it
    /// names must exist, be unexpired and belong to the token's user.
    pub async fn authenticate(&self, token: &str, now: DateTime<Utc>) -> AuthResult<Principal> {
        let claims = match self.codec.decode(token, now) {
            Ok(claims) => claims,
            Err(err) => {
                debug!(error = %err, "signed token rejected");
                return Err(AuthError::unauthenticated());
            }
        };

        match self.sessions.validate(&claims.session_token, now).await? {
            SessionStatus::Active(session) if session.user_id == claims.id => {
                Ok(Principal::from_claims(claims))
            }
            SessionStatus::Active(_) => {
                warn!(user_id = %claims.id, "session owner does not match token subject");
                Err(AuthError::unauthenticated())
            }
            SessionStatus::Expired(_) => {
                debug!(user_id = %claims.id, "session expired");
                Err(AuthError::unauthenticated())
            }
            SessionStatus::Missing => {
                debug!(user_id = %claims.id, "session not found");
                Err(AuthError::unauthenticated())
            }
        }
    }

    /// End the session named by `token`, if any. Idempotent.
    ///
    /// Missing, undecodable and already-revoked tokens all succeed.
    pub async fn logout(&self, token: Option<&str>, now: DateTime<Utc>) -> AuthResult<()> {
        let Some(token) = token else {
            return Ok(());
        };
        let Ok(claims) = self.codec.decode(token, now) else {
            debug!("logout with an unverifiable token; nothing to revoke");
            return Ok(());
        };
        if self.sessions.revoke(&claims.session_token).await? {
            info!(user_id = %claims.id, session = %claims.session_token.redacted(), "logged out");
        }
        Ok(())
    }

    /// Issue a reset token and notify the owner.
    ///
    /// Looks the same to the caller whether or not the email is registered:
    /// a token is generated and digested either way, and both paths return
    /// after the email lookup. Storing the token and sending the link happen
    /// in a background task whose failures are only logged.
    pub async fn request_password_reset(&self, email: &str, now: DateTime<Utc>) {
        let email = normalize_email(email);
        let user = match self.store.find_user_by_email(&email).await {
            Ok(user) => user,
            Err(err) => {
                error!(error = %err, "password reset lookup failed");
                None
            }
        };

        let Some(user) = user else {
            let _ = RawResetToken::generate().digest();
            debug!("password reset requested for an unknown email");
            return;
        };

        let (record, raw) = PasswordResetToken::issue(user.id, now, self.reset_token_ttl);
        let notice = ResetNotice {
            to: user.email.clone(),
            reset_link: self.reset_link(&raw),
        };
        let store = self.store.clone();
        let notifier = self.notifier.clone();
        let user_id = user.id;
        tokio::spawn(async move {
            if let Err(err) = store.replace_reset_token(record).await {
                error!(user_id = %user_id, error = %err, "failed to store reset token");
                return;
            }
            match notifier.send_password_reset(&notice).await {
                Ok(()) => info!(user_id = %user_id, channel = notifier.channel_name(), "reset link sent"),
                Err(err) => error!(user_id = %user_id, error = %err, "reset link delivery failed"),
            }
        });
    }

    /// Consume a reset token and set a new password.
    ///
    /// On success the credential, the user's reset tokens and all of the
    /// user's sessions change in one store transaction. Returns the number of
    /// sessions revoked. An expired token is deleted before it is refused.
    pub async fn complete_password_reset(
        &self,
        raw_token: &str,
        new_password: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<u64> {
        validate_password(new_password)?;

        let hash = RawResetToken::from_string(raw_token.trim()).digest();
        let Some(record) = self.store.find_reset_token(&hash).await? else {
            return Err(AuthError::ResetToken(ResetTokenRejection::Invalid));
        };
        if record.is_expired(now) {
            self.store.delete_reset_token(&hash).await?;
            info!(user_id = %record.user_id, "expired reset token discarded");
            return Err(AuthError::ResetToken(ResetTokenRejection::Expired));
        }

        let new_hash = self.hash(new_password).await?;
        let revoked = match self.store.complete_password_reset(&hash, new_hash, now).await {
            Ok(revoked) => revoked,
            // Consumed concurrently between lookup and update.
            Err(StoreError::NotFound(_)) => {
                return Err(AuthError::ResetToken(ResetTokenRejection::Invalid));
            }
            Err(err) => return Err(err.into()),
        };

        info!(user_id = %record.user_id, revoked, "password reset completed");
        Ok(revoked)
    }

    /// Change a password with knowledge of the current one. Revokes every
    /// session of the user, including the caller's.
    pub async fn change_password(
        &self,
        user_id: UserId,
        current_password: &str,
        new_password: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<u64> {
        validate_password(new_password)?;
        let Some(credential) = self.store.credential(user_id).await? else {
            return Err(AuthError::InvalidCredentials);
        };
        if !self.verify(current_password, credential.password_hash).await? {
            return Err(AuthError::InvalidCredentials);
        }
        let new_hash = self.hash(new_password).await?;
        let revoked = self.store.rotate_credential(user_id, new_hash, now).await?;
        info!(user_id = %user_id, revoked, "password changed");
        Ok(revoked)
    }

    pub async fn register_user(
        &self,
        new_user: NewUser,
        password: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<User> {
        let new_user = new_user.normalized()?;
        validate_password(password)?;
        let hash = self.hash(password).await?;
        let user = self.store.create_user(new_user.into_user(now), hash).await?;
        info!(user_id = %user.id, "user registered");
        Ok(user)
    }

    /// Server-side enforcement of `requirement` for `user_id`.
    ///
    /// Always queries the store; the token's permission snapshot plays no part.
    pub async fn authorize(&self, user_id: UserId, requirement: &Requirement) -> AuthResult<()> {
        let outcome = match requirement {
            Requirement::Authenticated => Ok(()),
            Requirement::One(id) => {
                if self.permissions.has_permission(user_id, id).await? {
                    Ok(())
                } else {
                    Err(AuthzError::denied(vec![id.clone()]))
                }
            }
            Requirement::Any(ids) => {
                if self.permissions.has_any_permission(user_id, ids).await? {
                    Ok(())
                } else {
                    Err(AuthzError::denied(ids.clone()))
                }
            }
            Requirement::All(ids) => {
                all_outcome(ids, self.permissions.has_all_permissions(user_id, ids).await?)
            }
        };
        if let Err(ref denied) = outcome {
            info!(user_id = %user_id, reason = %denied, "permission denied");
        }
        outcome.map_err(AuthError::from)
    }

    fn reset_link(&self, raw: &RawResetToken) -> String {
        let separator = if self.reset_link_base.contains('?') { '&' } else { '?' };
        format!("{}{}token={}", self.reset_link_base, separator, raw.as_str())
    }

    async fn hash(&self, plain: &str) -> AuthResult<PasswordHash> {
        let hasher = self.hasher;
        let plain = plain.to_string();
        tokio::task::spawn_blocking(move || hasher.hash(&plain))
            .await
            .map_err(|e| AuthError::Internal(e.to_string()))?
            .map_err(|e| AuthError::Internal(e.to_string()))
    }

    async fn verify(&self, plain: &str, hash: PasswordHash) -> AuthResult<bool> {
        let hasher = self.hasher;
        let plain = plain.to_string();
        tokio::task::spawn_blocking(move || hasher.verify(&plain, &hash))
            .await
            .map_err(|e| AuthError::Internal(e.to_string()))
    }

    async fn burn(&self, plain: &str) -> AuthResult<()> {
        let hasher = self.hasher;
        let plain = plain.to_string();
        tokio::task::spawn_blocking(move || hasher.burn(&plain))
            .await
            .map_err(|e| AuthError::Internal(e.to_string()))
    }
}

impl core::fmt::Debug for AuthService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AuthService")
            .field("backend", &self.store.backend_name())
            .field("notifier", &self.notifier.channel_name())
            .field("sessions", &self.sessions.settings())
            .finish()
    }
}
