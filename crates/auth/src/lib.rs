//! `gatehouse-auth`: authentication/authorization domain types.
//!
//! This crate is intentionally decoupled from HTTP and storage: it holds the
//! records, the credential verifier, the signed-token codec and the in-memory
//! permission evaluator.

pub mod authorize;
pub mod claims;
pub mod evaluate;
pub mod password;
pub mod permissions;
pub mod principal;
pub mod reset;
pub mod roles;
pub mod session;
pub mod token;
pub mod user;

pub use authorize::{AuthzError, Requirement};
pub use claims::{TokenClaims, TokenValidationError, validate_claims};
pub use evaluate::{PermissionCheck, check_all_permissions, check_any_permission, check_permission};
pub use password::{PasswordError, PasswordHash, PasswordHasher, validate_password};
pub use permissions::{Permission, PermissionId};
pub use principal::Principal;
pub use reset::{PasswordResetToken, RawResetToken, ResetTokenHash};
pub use roles::{NewRole, Role, RoleAssignment};
pub use session::{Session, SessionOrigin, SessionState, SessionToken};
pub use token::{Hs256TokenCodec, TokenCodec, TokenError};
pub use user::{Credential, NewUser, User, normalize_email};
