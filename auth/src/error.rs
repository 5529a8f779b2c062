use jsonwebtoken::errors::ErrorKind;
use phos_types::ErrorCode;
use thiserror::Error;

/// Errors produced while obtaining the identity provider's key set.
///
/// Cloneable so that callers waiting on a shared refresh all receive the
/// same outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JwksError {
    #[error("key set URL is invalid: {0}")]
    InvalidUrl(String),

    #[error("key set URL must use https: {0}")]
    InsecureUrl(String),

    #[error("key set fetch failed: {0}")]
    Fetch(String),

    #[error("key set endpoint returned status {0}")]
    Status(u16),

    #[error("key set response is not valid JSON: {0}")]
    Parse(String),

    #[error("key set contains no usable signing keys")]
    NoUsableKeys,

    #[error("key set refresh ceiling reached")]
    Throttled,

    #[error("key set refresh suspended after provider errors")]
    Suspended,
}

/// Why a bearer token was rejected.
///
/// The kind is for logs only; every variant surfaces to clients as the same
/// generic 401.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token signature is invalid")]
    InvalidSignature,

    #[error("token has expired")]
    Expired,

    #[error("token is not valid yet")]
    NotYetValid,

    #[error("token issuer does not match")]
    WrongIssuer,

    #[error("token audience does not match")]
    WrongAudience,

    #[error("token algorithm is not permitted: {0}")]
    DisallowedAlgorithm(String),

    #[error("no signing key matches the token")]
    UnknownKey,

    #[error("token is malformed: {0}")]
    Malformed(String),

    #[error("signing keys unavailable: {0}")]
    KeysUnavailable(#[from] JwksError),
}

impl TokenError {
    /// Map to a platform error code.
    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::Unauthenticated
    }

    /// Short machine-readable kind for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TokenError::InvalidSignature => "invalid_signature",
            TokenError::Expired => "expired",
            TokenError::NotYetValid => "not_yet_valid",
            TokenError::WrongIssuer => "wrong_issuer",
            TokenError::WrongAudience => "wrong_audience",
            TokenError::DisallowedAlgorithm(_) => "disallowed_algorithm",
            TokenError::UnknownKey => "unknown_key",
            TokenError::Malformed(_) => "malformed",
            TokenError::KeysUnavailable(_) => "keys_unavailable",
        }
    }
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::InvalidSignature => TokenError::InvalidSignature,
            ErrorKind::ExpiredSignature => TokenError::Expired,
            ErrorKind::ImmatureSignature => TokenError::NotYetValid,
            ErrorKind::InvalidIssuer => TokenError::WrongIssuer,
            ErrorKind::InvalidAudience => TokenError::WrongAudience,
            ErrorKind::InvalidAlgorithm => {
                TokenError::DisallowedAlgorithm("algorithm does not match key".into())
            }
            _ => TokenError::Malformed(err.to_string()),
        }
    }
}
