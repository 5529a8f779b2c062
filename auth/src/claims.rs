use phos_types::Identity;
use serde_json::Value;

use crate::validator::ValidatedToken;

/// Claim names consulted for roles, in order. The last one is what
/// ASP.NET identity servers emit for `ClaimTypes.Role`.
pub const DEFAULT_ROLE_CLAIMS: &[&str] = &[
    "roles",
    "role",
    "http://schemas.microsoft.com/ws/2008/06/identity/claims/role",
];

/// Maps a validated token to a normalized [`Identity`].
///
/// Pure: no I/O and no failure path. A missing roles claim yields an empty
/// role set, never a default role.
#[derive(Debug, Clone)]
pub struct RoleExtractor {
    role_claims: Vec<String>,
}

impl Default for RoleExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_ROLE_CLAIMS.iter().copied())
    }
}

impl RoleExtractor {
    pub fn new<I, S>(role_claims: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            role_claims: role_claims.into_iter().map(Into::into).collect(),
        }
    }

    pub fn extract(&self, token: &ValidatedToken) -> Identity {
        let roles = self
            .role_claims
            .iter()
            .filter_map(|name| token.raw_claims.get(name))
            .flat_map(role_values);
        Identity::new(token.subject.clone(), roles)
    }
}

/// Roles may arrive as an array of strings or, from some issuers, a single
/// string. Anything else contributes nothing.
fn role_values(value: &Value) -> Vec<&str> {
    match value {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::{json, Map};

    fn token(claims: Value) -> ValidatedToken {
        let raw_claims: Map<String, Value> = serde_json::from_value(claims).unwrap();
        ValidatedToken {
            subject: "user-7".into(),
            issuer: "issuer".into(),
            audience: vec!["aud".into()],
            expires_at: Utc::now(),
            raw_claims,
        }
    }

    #[test]
    fn extracts_and_normalizes_role_array() {
        let identity = RoleExtractor::default().extract(&token(json!({
            "roles": ["Nurse", "MD", "nurse"]
        })));
        assert_eq!(identity.subject, "user-7");
        assert_eq!(
            identity.roles.iter().cloned().collect::<Vec<_>>(),
            vec!["md".to_string(), "nurse".to_string()]
        );
    }

    #[test]
    fn absent_roles_claim_yields_no_roles() {
        let identity = RoleExtractor::default().extract(&token(json!({ "email": "a@b.c" })));
        assert!(identity.roles.is_empty());
    }

    #[test]
    fn accepts_single_string_and_dotnet_claim() {
        let identity = RoleExtractor::default().extract(&token(json!({
            "http://schemas.microsoft.com/ws/2008/06/identity/claims/role": "Admin",
            "role": ["Employer"],
        })));
        assert!(identity.has_role("admin"));
        assert!(identity.has_role("employer"));
    }

    #[test]
    fn ignores_non_string_roles() {
        let identity = RoleExtractor::default().extract(&token(json!({
            "roles": [1, null, "patient", { "x": 1 }]
        })));
        assert_eq!(identity.roles.len(), 1);
        assert!(identity.has_role("Patient"));
    }

    #[test]
    fn custom_claim_names() {
        let extractor = RoleExtractor::new(["https://phos.health/roles"]);
        let identity = extractor.extract(&token(json!({
            "https://phos.health/roles": ["Nurse"],
            "roles": ["Admin"],
        })));
        assert!(identity.has_role("nurse"));
        assert!(!identity.has_role("admin"));
    }
}
