use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use gatehouse_core::DomainError;

/// Permission identifier of the form `module:action` (e.g. `user:create`).
///
/// Permission ids are the stable contract between code and storage: renaming
/// one is a breaking migration. Comparison is exact and case-sensitive; there
/// is no wildcard or prefix matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PermissionId(Cow<'static, str>);

impl PermissionId {
    /// Build a permission id from a compile-time constant.
    ///
    /// Only for catalog constants known to be well-formed; untrusted input goes
    /// through [`PermissionId::parse`].
    pub const fn from_static(id: &'static str) -> Self {
        Self(Cow::Borrowed(id))
    }

    pub fn parse(id: impl Into<Cow<'static, str>>) -> Result<Self, DomainError> {
        let id = id.into();
        validate(&id)?;
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Grouping key (the part before `:`).
    pub fn module(&self) -> &str {
        self.0.split_once(':').map(|(m, _)| m).unwrap_or(&self.0)
    }

    pub fn action(&self) -> &str {
        self.0.split_once(':').map(|(_, a)| a).unwrap_or("")
    }
}

fn validate(id: &str) -> Result<(), DomainError> {
    let Some((module, action)) = id.split_once(':') else {
        return Err(DomainError::invalid_id(format!(
            "permission '{id}' must have the form module:action"
        )));
    };
    let segment_ok = |s: &str| {
        !s.is_empty()
            && s
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    };
    if !segment_ok(module) || !segment_ok(action) {
        return Err(DomainError::invalid_id(format!(
            "permission '{id}' must use [a-z0-9_-] segments around a single ':'"
        )));
    }
    Ok(())
}

impl core::fmt::Display for PermissionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PermissionId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<PermissionId> for String {
    fn from(value: PermissionId) -> Self {
        value.0.into_owned()
    }
}

impl core::str::FromStr for PermissionId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s.to_string())
    }
}

/// Catalog entry for a permission.
///
/// The catalog is managed by the system (seeded at startup), not created ad hoc
/// through the admin flows that manage roles and users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub id: PermissionId,
    pub module: String,
    pub description: String,
}

impl Permission {
    pub fn new(id: PermissionId, description: impl Into<String>) -> Self {
        Self {
            module: id.module().to_string(),
            id,
            description: description.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_module_and_action() {
        let id = PermissionId::parse("user:create").unwrap();
        assert_eq!(id.module(), "user");
        assert_eq!(id.action(), "create");
    }

    #[test]
    fn rejects_malformed_ids() {
        for bad in ["", "user", "user:", ":create", "a:b:c", "User:create", "user:cre ate"] {
            assert!(PermissionId::parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn deserialization_validates() {
        let ok: PermissionId = serde_json::from_str("\"content:edit\"").unwrap();
        assert_eq!(ok.as_str(), "content:edit");
        assert!(serde_json::from_str::<PermissionId>("\"*\"").is_err());
    }

    #[test]
    fn catalog_entry_derives_module() {
        let p = Permission::new(PermissionId::from_static("role:delete"), "Delete roles");
        assert_eq!(p.module, "role");
    }
}
