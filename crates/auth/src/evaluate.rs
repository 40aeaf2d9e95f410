//! Permission evaluation over an already-known permission list.
//!
//! These checks run against a snapshot (typically the `permissions` claim of a
//! signed token) and are for UX gating only: hiding buttons, pruning menus.
//! The snapshot goes stale as soon as a role changes, so every state-changing
//! operation must be re-checked against the store (see the guard in
//! `gatehouse-api` and `PermissionQuery` in `gatehouse-infra`).
//!
//! Empty requirement lists follow plain set logic and the asymmetry is
//! intentional:
//! - "any" over nothing is `false` (no requirement is ever satisfied by it)
//! - "all" over nothing is `true` (vacuous truth)

use serde::{Deserialize, Serialize};

use crate::PermissionId;

/// Outcome of an "all of these permissions" check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionCheck {
    pub has_permission: bool,
    /// Requested ids that were not held, in request order. Only present when
    /// `has_permission` is false.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub missing_permissions: Option<Vec<PermissionId>>,
}

impl PermissionCheck {
    pub fn granted() -> Self {
        Self {
            has_permission: true,
            missing_permissions: None,
        }
    }

    /// Build the outcome from the list of missing ids.
    pub fn from_missing(missing: Vec<PermissionId>) -> Self {
        if missing.is_empty() {
            Self::granted()
        } else {
            Self {
                has_permission: false,
                missing_permissions: Some(missing),
            }
        }
    }

    pub fn missing(&self) -> &[PermissionId] {
        self.missing_permissions.as_deref().unwrap_or(&[])
    }
}

/// Requested ids not satisfied by `is_held`, in request order, each reported once.
pub fn missing_in_request_order<F>(requested: &[PermissionId], is_held: F) -> Vec<PermissionId>
where
    F: Fn(&PermissionId) -> bool,
{
    let mut missing: Vec<PermissionId> = Vec::new();
    for id in requested {
        if !is_held(id) && !missing.contains(id) {
            missing.push(id.clone());
        }
    }
    missing
}

/// Exact, case-sensitive membership test.
pub fn check_permission(known: &[PermissionId], required: &PermissionId) -> bool {
    known.contains(required)
}

/// True iff at least one required id is known. Empty `required` is `false`.
pub fn check_any_permission(known: &[PermissionId], required: &[PermissionId]) -> bool {
    required.iter().any(|id| check_permission(known, id))
}

/// True iff every required id is known. Empty `required` is granted.
pub fn check_all_permissions(known: &[PermissionId], required: &[PermissionId]) -> PermissionCheck {
    if required.is_empty() {
        return PermissionCheck::granted();
    }
    PermissionCheck::from_missing(missing_in_request_order(required, |id| {
        check_permission(known, id)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &'static str) -> PermissionId {
        PermissionId::from_static(s)
    }

    #[test]
    fn membership_is_exact() {
        let known = vec![p("content:edit")];
        assert!(check_permission(&known, &p("content:edit")));
        assert!(!check_permission(&known, &p("content:edit-all")));
        assert!(!check_permission(&known, &p("content:delete")));
    }

    #[test]
    fn no_wildcard_or_prefix_matching() {
        let known = vec![PermissionId::parse("content:all").unwrap()];
        assert!(!check_permission(&known, &p("content:edit")));
    }

    #[test]
    fn empty_any_is_false_even_with_permissions() {
        let known = vec![p("content:edit")];
        assert!(!check_any_permission(&known, &[]));
        assert!(!check_any_permission(&[], &[]));
    }

    #[test]
    fn empty_all_is_vacuously_true() {
        assert_eq!(check_all_permissions(&[], &[]), PermissionCheck::granted());
        let json = serde_json::to_value(check_all_permissions(&[], &[])).unwrap();
        assert_eq!(json, serde_json::json!({ "hasPermission": true }));
    }

    #[test]
    fn all_reports_missing_in_request_order() {
        let known = vec![p("content:edit")];
        let check = check_all_permissions(
            &known,
            &[p("admin:super"), p("content:edit"), p("content:delete"), p("admin:super")],
        );
        assert!(!check.has_permission);
        assert_eq!(check.missing(), &[p("admin:super"), p("content:delete")]);
    }

    #[test]
    fn editor_scenario() {
        let known = vec![p("content:edit")];
        assert!(check_permission(&known, &p("content:edit")));
        assert!(!check_permission(&known, &p("content:delete")));
        let all = check_all_permissions(&known, &[p("content:edit"), p("content:delete")]);
        assert_eq!(
            serde_json::to_value(&all).unwrap(),
            serde_json::json!({ "hasPermission": false, "missingPermissions": ["content:delete"] })
        );
        assert!(!check_any_permission(&known, &[p("content:delete"), p("admin:super")]));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn perm() -> impl Strategy<Value = PermissionId> {
            ("[a-c]", "[a-c]").prop_map(|(m, a)| PermissionId::parse(format!("{m}:{a}")).unwrap())
        }

        proptest! {
            #[test]
            fn all_granted_iff_nothing_missing(
                known in prop::collection::vec(perm(), 0..6),
                required in prop::collection::vec(perm(), 1..6),
            ) {
                let check = check_all_permissions(&known, &required);
                prop_assert_eq!(check.has_permission, check.missing().is_empty());
                prop_assert_eq!(check.has_permission, check.missing_permissions.is_none());
            }

            #[test]
            fn any_matches_nonempty_intersection(
                known in prop::collection::vec(perm(), 0..6),
                required in prop::collection::vec(perm(), 0..6),
            ) {
                let expected = required.iter().any(|r| known.contains(r));
                prop_assert_eq!(check_any_permission(&known, &required), expected);
            }

            #[test]
            fn missing_ids_are_exactly_the_unknown_ones(
                known in prop::collection::vec(perm(), 0..6),
                required in prop::collection::vec(perm(), 1..6),
            ) {
                let check = check_all_permissions(&known, &required);
                for id in check.missing() {
                    prop_assert!(required.contains(id));
                    prop_assert!(!known.contains(id));
                }
                for id in &required {
                    if !known.contains(id) {
                        prop_assert!(check.missing().contains(id));
                    }
                }
            }
        }
    }
}
