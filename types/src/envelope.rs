use serde::{Deserialize, Serialize};

use crate::ErrorCode;

/// The one JSON error shape every gateway rejection uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl ErrorEnvelope {
    pub fn new(code: ErrorCode, correlation_id: Option<String>) -> Self {
        Self {
            error: code.public_message().to_string(),
            correlation_id,
        }
    }
}
