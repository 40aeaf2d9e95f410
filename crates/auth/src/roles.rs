use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use gatehouse_core::{DomainError, RoleId, UserId};

/// Named authorization group.
///
/// Permissions are never granted to users directly, only through roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a role.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewRole {
    pub name: String,
    pub description: Option<String>,
}

impl NewRole {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Trim the name and reject empty ones.
    pub fn normalized(mut self) -> Result<Self, DomainError> {
        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            return Err(DomainError::validation("role name must not be empty"));
        }
        Ok(self)
    }

    pub fn into_role(self, now: DateTime<Utc>) -> Role {
        Role {
            id: RoleId::new(),
            name: self.name,
            description: self.description,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A user↔role association, with who assigned it and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub user_id: UserId,
    pub role_id: RoleId,
    pub assigned_by: Option<UserId>,
    pub assigned_at: DateTime<Utc>,
}
