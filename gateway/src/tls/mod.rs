use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Environment;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TlsError {
    #[error("TLS policy violation: {0}")]
    PolicyViolation(String),
}

/// How the gateway checks certificates presented by upstream services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpstreamTls {
    /// Full chain and hostname validation against the webpki roots.
    Verify,
    /// Skip certificate validation for intra-cluster calls behind the
    /// perimeter. Never permitted in production.
    AcceptInvalidCerts,
}

impl UpstreamTls {
    /// Resolve the policy for an environment. Development defaults to
    /// skipping validation; production always validates and refuses an
    /// explicit request to skip.
    pub fn for_environment(
        environment: Environment,
        insecure_requested: Option<bool>,
    ) -> Result<Self, TlsError> {
        let policy = match (environment, insecure_requested) {
            (Environment::Production, Some(true)) => {
                return Err(TlsError::PolicyViolation(
                    "upstream certificate validation cannot be disabled in production".into(),
                ));
            }
            (Environment::Production, _) => UpstreamTls::Verify,
            (Environment::Development, Some(false)) => UpstreamTls::Verify,
            (Environment::Development, _) => UpstreamTls::AcceptInvalidCerts,
        };

        match policy {
            UpstreamTls::Verify => info!("upstream TLS: certificates verified"),
            UpstreamTls::AcceptInvalidCerts => {
                warn!("upstream TLS: certificate validation disabled (development only)")
            }
        }
        Ok(policy)
    }

    pub fn apply(self, builder: reqwest::ClientBuilder) -> reqwest::ClientBuilder {
        match self {
            UpstreamTls::Verify => builder,
            UpstreamTls::AcceptInvalidCerts => builder.danger_accept_invalid_certs(true),
        }
    }
}
