use std::sync::Arc;

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::TokenError;
use crate::jwks::{JwksCache, KeyKind};

/// Tokens larger than this are rejected before any parsing.
pub const MAX_TOKEN_BYTES: usize = 8 * 1024;

const HMAC_ALGORITHMS: &[Algorithm] = &[Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];

/// A token whose signature, issuer, audience and lifetime all checked out.
///
/// Only [`TokenValidator::validate`] constructs one.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedToken {
    pub subject: String,
    pub issuer: String,
    pub audience: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub raw_claims: Map<String, Value>,
}

impl ValidatedToken {
    fn from_claims(raw_claims: Map<String, Value>) -> Result<Self, TokenError> {
        let subject = string_claim(&raw_claims, "sub")?;
        let issuer = string_claim(&raw_claims, "iss")?;
        let audience = match raw_claims.get("aud") {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => return Err(TokenError::Malformed("aud claim missing".into())),
        };
        let expires_at = raw_claims
            .get("exp")
            .and_then(Value::as_i64)
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .ok_or_else(|| TokenError::Malformed("exp claim missing".into()))?;

        Ok(Self {
            subject,
            issuer,
            audience,
            expires_at,
            raw_claims,
        })
    }
}

fn string_claim(claims: &Map<String, Value>, name: &str) -> Result<String, TokenError> {
    claims
        .get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| TokenError::Malformed(format!("{name} claim missing")))
}

/// The single trust root of the process, fixed at startup.
pub enum VerificationStrategy {
    /// Asymmetric keys fetched from the issuer's key set.
    Jwks {
        keys: Arc<JwksCache>,
        issuer: String,
        audience: String,
    },
    /// One HMAC secret, for local and development deployments.
    SharedSecret {
        key: DecodingKey,
        issuer: String,
        audience: String,
    },
}

/// Verifies bearer tokens against the configured strategy.
pub struct TokenValidator {
    strategy: VerificationStrategy,
    leeway_secs: u64,
}

impl std::fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenValidator")
            .field("mode", &self.mode())
            .field("leeway_secs", &self.leeway_secs)
            .finish()
    }
}

impl TokenValidator {
    pub fn jwks(
        keys: Arc<JwksCache>,
        issuer: impl Into<String>,
        audience: impl Into<String>,
        leeway_secs: u64,
    ) -> Self {
        Self {
            strategy: VerificationStrategy::Jwks {
                keys,
                issuer: issuer.into(),
                audience: audience.into(),
            },
            leeway_secs,
        }
    }

    pub fn shared_secret(
        secret: &str,
        issuer: impl Into<String>,
        audience: impl Into<String>,
        leeway_secs: u64,
    ) -> Self {
        Self {
            strategy: VerificationStrategy::SharedSecret {
                key: DecodingKey::from_secret(secret.as_bytes()),
                issuer: issuer.into(),
                audience: audience.into(),
            },
            leeway_secs,
        }
    }

    pub fn mode(&self) -> &'static str {
        match self.strategy {
            VerificationStrategy::Jwks { .. } => "jwks",
            VerificationStrategy::SharedSecret { .. } => "shared-secret",
        }
    }

    /// Validate a raw bearer token.
    pub async fn validate(&self, raw: &str) -> Result<ValidatedToken, TokenError> {
        if raw.is_empty() || raw.len() > MAX_TOKEN_BYTES {
            return Err(TokenError::Malformed("token size out of bounds".into()));
        }
        let header = decode_header(raw).map_err(|e| TokenError::Malformed(e.to_string()))?;

        let claims = match &self.strategy {
            VerificationStrategy::SharedSecret {
                key,
                issuer,
                audience,
            } => {
                if !HMAC_ALGORITHMS.contains(&header.alg) {
                    return Err(TokenError::DisallowedAlgorithm(format!("{:?}", header.alg)));
                }
                let validation = self.validation(header.alg, issuer, audience);
                decode::<Map<String, Value>>(raw, key, &validation)?.claims
            }
            VerificationStrategy::Jwks {
                keys,
                issuer,
                audience,
            } => {
                let Some(kind) = KeyKind::for_algorithm(header.alg) else {
                    return Err(TokenError::DisallowedAlgorithm(format!("{:?}", header.alg)));
                };
                let candidates = keys.keys_for(header.kid.as_deref()).await?;
                let validation = self.validation(header.alg, issuer, audience);

                let mut verified = None;
                let mut last_error = TokenError::UnknownKey;
                for key in candidates.iter().filter(|k| k.kind == kind) {
                    match decode::<Map<String, Value>>(raw, &key.decoding, &validation) {
                        Ok(data) => {
                            verified = Some(data.claims);
                            break;
                        }
                        Err(e) => {
                            let err = TokenError::from(e);
                            // Claim failures only happen after a good signature.
                            if err != TokenError::InvalidSignature {
                                return Err(err);
                            }
                            debug!(kid = ?key.kid, "key did not verify token");
                            last_error = err;
                        }
                    }
                }
                match verified {
                    Some(claims) => claims,
                    None => return Err(last_error),
                }
            }
        };

        ValidatedToken::from_claims(claims)
    }

    fn validation(&self, alg: Algorithm, issuer: &str, audience: &str) -> Validation {
        let mut validation = Validation::new(alg);
        validation.leeway = self.leeway_secs;
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation
    }
}
