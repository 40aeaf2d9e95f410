use thiserror::Error;

use crate::PermissionId;
use crate::evaluate::{PermissionCheck, check_all_permissions, check_any_permission, check_permission};

/// Authorization failure raised at an operation boundary.
///
/// Transport layers map `Unauthenticated` to 401 and `PermissionDenied` to 403.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("authentication required")]
    Unauthenticated,

    /// `missing` is only populated by all-of requirements.
    #[error("forbidden: requires {}", display_ids(.required))]
    PermissionDenied {
        required: Vec<PermissionId>,
        missing: Option<Vec<PermissionId>>,
    },
}

impl AuthzError {
    pub fn denied(required: Vec<PermissionId>) -> Self {
        Self::PermissionDenied {
            required,
            missing: None,
        }
    }

    pub fn denied_missing(required: Vec<PermissionId>, missing: Vec<PermissionId>) -> Self {
        Self::PermissionDenied {
            required,
            missing: Some(missing),
        }
    }
}

fn display_ids(ids: &[PermissionId]) -> String {
    ids.iter().map(|p| p.as_str()).collect::<Vec<_>>().join(", ")
}

/// What a protected operation requires of its caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    /// Any authenticated identity.
    Authenticated,
    One(PermissionId),
    Any(Vec<PermissionId>),
    All(Vec<PermissionId>),
}

impl Requirement {
    pub fn one(id: PermissionId) -> Self {
        Self::One(id)
    }

    pub fn any(ids: impl IntoIterator<Item = PermissionId>) -> Self {
        Self::Any(ids.into_iter().collect())
    }

    pub fn all(ids: impl IntoIterator<Item = PermissionId>) -> Self {
        Self::All(ids.into_iter().collect())
    }

    /// Permission ids named by the requirement.
    pub fn required(&self) -> Vec<PermissionId> {
        match self {
            Requirement::Authenticated => Vec::new(),
            Requirement::One(id) => vec![id.clone()],
            Requirement::Any(ids) | Requirement::All(ids) => ids.clone(),
        }
    }

    /// Evaluate against a known permission snapshot.
    ///
    /// UX only: the snapshot may be stale, enforcement must re-query the store.
    pub fn check_snapshot(&self, known: &[PermissionId]) -> Result<(), AuthzError> {
        match self {
            Requirement::Authenticated => Ok(()),
            Requirement::One(id) => {
                if check_permission(known, id) {
                    Ok(())
                } else {
                    Err(AuthzError::denied(vec![id.clone()]))
                }
            }
            Requirement::Any(ids) => {
                if check_any_permission(known, ids) {
                    Ok(())
                } else {
                    Err(AuthzError::denied(ids.clone()))
                }
            }
            Requirement::All(ids) => all_outcome(ids, check_all_permissions(known, ids)),
        }
    }
}

/// Turn an all-of check into a guard result.
pub fn all_outcome(required: &[PermissionId], check: PermissionCheck) -> Result<(), AuthzError> {
    if check.has_permission {
        Ok(())
    } else {
        Err(AuthzError::denied_missing(
            required.to_vec(),
            check.missing_permissions.unwrap_or_default(),
        ))
    }
}
