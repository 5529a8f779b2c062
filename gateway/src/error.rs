use axum::{
    body::Body,
    response::{IntoResponse, Response},
    Json,
};
use http::{header, HeaderValue, StatusCode};
use phos_types::{ErrorCode, ErrorEnvelope};
use thiserror::Error;
use tracing::{error, warn};

use crate::middleware::CorrelationId;
use crate::proxy::ProxyError;

/// Every way the edge can refuse or fail a request.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Reason is for logs; clients only see a generic 401.
    #[error("authentication failed: {0}")]
    Unauthenticated(String),
    #[error("identity lacks a required role")]
    Forbidden,
    #[error("no route for path")]
    NoRoute,
    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Upstream(#[from] ProxyError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            GatewayError::Unauthenticated(_) => ErrorCode::Unauthenticated,
            GatewayError::Forbidden => ErrorCode::PermissionDenied,
            GatewayError::NoRoute => ErrorCode::NotFound,
            GatewayError::RateLimited { .. } => ErrorCode::RateLimited,
            GatewayError::BadRequest(_) => ErrorCode::InvalidArgument,
            GatewayError::Upstream(e) => e.error_code(),
            GatewayError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Render the uniform envelope, tagging it with the request's
    /// correlation id.
    pub fn into_response_with(self, correlation_id: Option<&CorrelationId>) -> Response {
        let code = self.error_code();
        match code {
            ErrorCode::Internal => error!(code = %code, error = %self, "request failed"),
            _ => warn!(code = %code, error = %self, "request rejected"),
        }

        let retry_after = match &self {
            GatewayError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };
        let mut response = envelope_response(code, correlation_id.map(|c| c.0.clone()));
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.into_response_with(None)
    }
}

/// Build the JSON envelope response for a code.
pub fn envelope_response(code: ErrorCode, correlation_id: Option<String>) -> Response {
    let status =
        StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ErrorEnvelope::new(code, correlation_id))).into_response()
}

/// Marks a response rendered by [`panic_response`]; the correlation layer
/// re-renders it with the request's id.
#[derive(Debug, Clone, Copy)]
pub struct PanicRendered;

/// Panic handler for the catch-panic layer: a generic 500, nothing leaked.
pub fn panic_response(_panic: Box<dyn std::any::Any + Send + 'static>) -> Response<Body> {
    error!("handler panicked");
    let mut response = envelope_response(ErrorCode::Internal, None);
    response.extensions_mut().insert(PanicRendered);
    response
}

/// Replace the body of a panic response with an envelope carrying `id`.
pub(crate) fn tag_panic_response(response: &mut Response, id: &CorrelationId) {
    if response.extensions_mut().remove::<PanicRendered>().is_none() {
        return;
    }
    let envelope = ErrorEnvelope::new(ErrorCode::Internal, Some(id.0.clone()));
    match serde_json::to_vec(&envelope) {
        Ok(bytes) => {
            response.headers_mut().remove(header::CONTENT_LENGTH);
            *response.body_mut() = Body::from(bytes);
        }
        Err(e) => error!(error = %e, "failed to encode panic envelope"),
    }
}
