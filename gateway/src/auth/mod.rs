use std::collections::HashSet;

use http::{header, HeaderMap};
use phos_auth::{RoleExtractor, TokenError, TokenValidator};
use phos_types::Identity;
use tracing::{debug, warn};

use crate::error::GatewayError;

/// Paths that bypass authentication, derived once from the enabled route
/// prefixes and the configured sub-path patterns.
#[derive(Debug, Clone, Default)]
pub struct PublicPaths {
    exact: HashSet<String>,
    prefixes: Vec<String>,
}

impl PublicPaths {
    pub fn new<'a>(
        route_prefixes: impl IntoIterator<Item = &'a str>,
        patterns: &[String],
    ) -> Self {
        let mut paths = Self::default();
        for prefix in route_prefixes {
            let base = prefix.trim_end_matches('/');
            for pattern in patterns {
                match pattern.strip_suffix('*') {
                    Some(stem) => paths.prefixes.push(format!("{base}{stem}")),
                    None => {
                        paths.exact.insert(format!("{base}{pattern}"));
                    }
                }
            }
        }
        paths
    }

    pub fn is_public(&self, path: &str) -> bool {
        self.exact.contains(path) || self.prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }
}

/// Verifies the bearer token on a request and derives the caller identity.
#[derive(Debug)]
pub struct Authenticator {
    validator: TokenValidator,
    extractor: RoleExtractor,
}

impl Authenticator {
    pub fn new(validator: TokenValidator, extractor: RoleExtractor) -> Self {
        Self {
            validator,
            extractor,
        }
    }

    pub fn mode(&self) -> &'static str {
        self.validator.mode()
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, GatewayError> {
        let token = bearer_token(headers).ok_or_else(|| {
            debug!("missing bearer token");
            GatewayError::Unauthenticated("missing bearer token".into())
        })?;

        let validated = self.validator.validate(token).await.map_err(|e| {
            log_rejection(&e);
            GatewayError::Unauthenticated(e.kind().to_string())
        })?;

        let identity = self.extractor.extract(&validated);
        debug!(subject = %identity.subject, roles = identity.roles.len(), "token accepted");
        Ok(identity)
    }
}

fn log_rejection(e: &TokenError) {
    match e {
        TokenError::KeysUnavailable(_) => warn!(kind = e.kind(), error = %e, "token rejected"),
        _ => debug!(kind = e.kind(), error = %e, "token rejected"),
    }
}

/// Token from `Authorization: Bearer <token>`; the scheme is
/// case-insensitive.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
