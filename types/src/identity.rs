use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Normalized caller identity derived from a validated bearer token.
///
/// Roles are stored lowercased so that policy checks do not depend on the
/// casing conventions of whichever identity provider issued the token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub subject: String,
    pub roles: BTreeSet<String>,
}

impl Identity {
    /// Build an identity, normalizing every role.
    pub fn new<I, S>(subject: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            subject: subject.into(),
            roles: roles
                .into_iter()
                .filter_map(|r| normalize_role(r.as_ref()))
                .collect(),
        }
    }

    /// Case-insensitive role membership.
    pub fn has_role(&self, role: &str) -> bool {
        normalize_role(role).is_some_and(|r| self.roles.contains(&r))
    }

    /// True when the identity holds at least one of `required`.
    /// An empty requirement is satisfied by any identity.
    pub fn has_any_role<S: AsRef<str>>(&self, required: &[S]) -> bool {
        required.is_empty() || required.iter().any(|r| self.has_role(r.as_ref()))
    }
}

/// Trim and lowercase a role name; blank names are dropped.
pub fn normalize_role(role: &str) -> Option<String> {
    let trimmed = role.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_are_normalized() {
        let id = Identity::new("user-1", ["Nurse", " ADMIN ", ""]);
        assert_eq!(id.roles.len(), 2);
        assert!(id.roles.contains("nurse"));
        assert!(id.roles.contains("admin"));
    }

    #[test]
    fn role_checks_ignore_case() {
        let id = Identity::new("user-1", ["Physician"]);
        assert!(id.has_role("PHYSICIAN"));
        assert!(id.has_role("physician"));
        assert!(!id.has_role("admin"));
    }

    #[test]
    fn empty_requirement_is_satisfied() {
        let id = Identity::new("user-1", Vec::<String>::new());
        assert!(id.roles.is_empty());
        assert!(id.has_any_role::<&str>(&[]));
        assert!(!id.has_any_role(&["admin"]));
    }
}
