use serde::{Deserialize, Serialize};
use std::fmt;

/// Gateway-wide error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    // Generic
    Internal,
    InvalidArgument,
    NotFound,

    // Edge
    Unauthenticated,
    PermissionDenied,
    RateLimited,

    // Upstream
    UpstreamUnreachable,
    UpstreamUnavailable,
    UpstreamTimeout,
}

impl ErrorCode {
    /// Returns a short string code suitable for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Internal => "INTERNAL",
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Unauthenticated => "UNAUTHENTICATED",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::UpstreamUnreachable => "UPSTREAM_UNREACHABLE",
            ErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
        }
    }

    /// HTTP status the edge returns for this code.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::Internal => 500,
            ErrorCode::InvalidArgument => 400,
            ErrorCode::NotFound => 404,
            ErrorCode::Unauthenticated => 401,
            ErrorCode::PermissionDenied => 403,
            ErrorCode::RateLimited => 429,
            ErrorCode::UpstreamUnreachable => 502,
            ErrorCode::UpstreamUnavailable => 503,
            ErrorCode::UpstreamTimeout => 504,
        }
    }

    /// The only message a client ever sees for this code.
    pub fn public_message(&self) -> &'static str {
        match self {
            ErrorCode::Internal => "internal server error",
            ErrorCode::InvalidArgument => "bad request",
            ErrorCode::NotFound => "not found",
            ErrorCode::Unauthenticated => "unauthorized",
            ErrorCode::PermissionDenied => "forbidden",
            ErrorCode::RateLimited => "too many requests",
            ErrorCode::UpstreamUnreachable => "bad gateway",
            ErrorCode::UpstreamUnavailable => "service unavailable",
            ErrorCode::UpstreamTimeout => "gateway timeout",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_display() {
        assert_eq!(ErrorCode::Internal.to_string(), "INTERNAL");
        assert_eq!(
            ErrorCode::UpstreamTimeout.to_string(),
            "UPSTREAM_TIMEOUT"
        );
    }

    #[test]
    fn error_code_status() {
        assert_eq!(ErrorCode::Unauthenticated.http_status(), 401);
        assert_eq!(ErrorCode::PermissionDenied.http_status(), 403);
        assert_eq!(ErrorCode::NotFound.http_status(), 404);
        assert_eq!(ErrorCode::RateLimited.http_status(), 429);
        assert_eq!(ErrorCode::UpstreamUnreachable.http_status(), 502);
        assert_eq!(ErrorCode::UpstreamTimeout.http_status(), 504);
    }

    #[test]
    fn public_messages_are_generic() {
        assert_eq!(ErrorCode::Unauthenticated.public_message(), "unauthorized");
        assert!(!ErrorCode::Internal.public_message().contains("panic"));
    }
}
