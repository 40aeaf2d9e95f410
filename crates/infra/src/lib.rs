//! Infrastructure layer: store adapters, session and permission services,
//! notification channels, configuration.

pub mod auth_service;
pub mod config;
pub mod notify;
pub mod permissions;
pub mod seed;
pub mod sessions;
pub mod store;

pub use auth_service::{AuthError, AuthResult, AuthService, AuthSettings, LoginOutcome, ResetTokenRejection};
pub use config::{BootstrapAdmin, Config};
pub use notify::{LogNotifier, Notifier, NotifierConfig, OutboxNotifier, ResetNotice, WebhookNotifier};
pub use permissions::PermissionQuery;
pub use sessions::{SessionManager, SessionSettings, SessionStatus};
pub use store::{AuthStore, InMemoryAuthStore, PostgresAuthStore, StoreError, StoreResult};
