//! `gatehouse-core`: shared building blocks.
//!
//! This crate contains identifiers and the domain error model only (no
//! infrastructure concerns).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{RoleId, UserId};
