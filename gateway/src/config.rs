use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use phos_auth::{JwksError, JwksSettings};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::proxy::{ProxyError, RouteError};
use crate::tls::TlsError;

/// Env var naming an optional YAML config file.
pub const CONFIG_PATH_ENV: &str = "GATEWAY__CONFIG";

/// Shared secrets shorter than this are refused at startup.
pub const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
    #[error("JWT__SECRET is required when no identity provider is configured")]
    MissingSecret,
    #[error("JWT__SECRET must be at least 32 characters")]
    WeakSecret,
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("identity provider: {0}")]
    Jwks(#[from] JwksError),
    #[error(transparent)]
    Client(#[from] ProxyError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Development,
}

impl FromStr for Environment {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "development" | "dev" => Ok(Environment::Development),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    pub environment: Environment,
    /// Redirect plaintext requests, as reported by the front proxy's
    /// `X-Forwarded-Proto`, to https.
    pub enforce_https: bool,
    pub upstream_timeout_secs: u64,
    /// `None` leaves the choice to the environment default.
    pub upstream_tls_insecure: Option<bool>,
    pub rate_limit: RateLimitConfig,
    pub auth: AuthConfig,
    pub routes: Vec<RouteConfig>,
    /// Sub-paths under each enabled route that skip authentication.
    /// A trailing `*` matches any suffix.
    pub public_paths: Vec<String>,
    pub service: ServiceInfo,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            environment: Environment::Production,
            enforce_https: false,
            upstream_timeout_secs: 30,
            upstream_tls_insecure: None,
            rate_limit: RateLimitConfig::default(),
            auth: AuthConfig::default(),
            routes: default_routes(),
            public_paths: ["/healthz", "/info", "/api/info", "/swagger*"]
                .into_iter()
                .map(String::from)
                .collect(),
            service: ServiceInfo::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 300,
            window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub idp_issuer: Option<String>,
    pub idp_domain: Option<String>,
    pub idp_audience: Option<String>,
    pub jwt_secret: Option<String>,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub clock_skew_secs: u64,
    pub jwks_requests_per_minute: u32,
    pub jwks_cache_ttl_secs: u64,
    pub role_claims: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            idp_issuer: None,
            idp_domain: None,
            idp_audience: None,
            jwt_secret: None,
            jwt_issuer: "Phos.Identity".into(),
            jwt_audience: "Phos.Client".into(),
            clock_skew_secs: 30,
            jwks_requests_per_minute: 10,
            jwks_cache_ttl_secs: 600,
            role_claims: phos_auth::claims::DEFAULT_ROLE_CLAIMS
                .iter()
                .map(|c| c.to_string())
                .collect(),
        }
    }
}

/// Token verification strategy, fixed for the process lifetime.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMode {
    Jwks {
        issuer: String,
        audience: String,
    },
    SharedSecret {
        secret: String,
        issuer: String,
        audience: String,
    },
}

impl std::fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMode::Jwks { issuer, audience } => f
                .debug_struct("Jwks")
                .field("issuer", issuer)
                .field("audience", audience)
                .finish(),
            AuthMode::SharedSecret {
                issuer, audience, ..
            } => f
                .debug_struct("SharedSecret")
                .field("issuer", issuer)
                .field("audience", audience)
                .finish_non_exhaustive(),
        }
    }
}

impl AuthConfig {
    /// JWKS when an issuer (or domain) and an audience are both present,
    /// shared secret otherwise. There is no built-in fallback secret.
    pub fn mode(&self) -> Result<AuthMode, ConfigError> {
        let issuer = non_blank(&self.idp_issuer).map(str::to_string).or_else(|| {
            non_blank(&self.idp_domain).map(|d| format!("https://{}/", d.trim_end_matches('/')))
        });

        if let (Some(issuer), Some(audience)) = (issuer, non_blank(&self.idp_audience)) {
            return Ok(AuthMode::Jwks {
                issuer,
                audience: audience.to_string(),
            });
        }

        let secret = non_blank(&self.jwt_secret).ok_or(ConfigError::MissingSecret)?;
        if secret.chars().count() < MIN_SECRET_LEN {
            return Err(ConfigError::WeakSecret);
        }
        Ok(AuthMode::SharedSecret {
            secret: secret.to_string(),
            issuer: self.jwt_issuer.clone(),
            audience: self.jwt_audience.clone(),
        })
    }

    pub fn jwks_settings(&self) -> JwksSettings {
        JwksSettings {
            cache_ttl: Duration::from_secs(self.jwks_cache_ttl_secs),
            max_refreshes_per_minute: self.jwks_requests_per_minute,
            ..JwksSettings::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    pub prefix: String,
    pub upstream: Option<String>,
    /// Env var that, when set, supplies the upstream URL.
    pub upstream_env: Option<String>,
    pub required_roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
    pub commit: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            name: "phos-gateway".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            commit: "unknown".into(),
        }
    }
}

fn default_routes() -> Vec<RouteConfig> {
    [
        ("/api/labs", "LAB_INTERPRETER__URL"),
        ("/api/nutrition", "NUTRITION_KIT__URL"),
        ("/api/genome", "GENOME_KIT__URL"),
        ("/api/microbiome", "MICROBIOME_KIT__URL"),
        ("/api/sleep", "SLEEP_KIT__URL"),
        ("/api/core", "PHOS_CORE__URL"),
    ]
    .into_iter()
    .map(|(prefix, env)| RouteConfig {
        prefix: prefix.into(),
        upstream: None,
        upstream_env: Some(env.into()),
        required_roles: Vec::new(),
    })
    .collect()
}

impl GatewayConfig {
    /// Defaults, then the YAML file named by `GATEWAY__CONFIG`, then the
    /// process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim())?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Overlay environment variables read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(port) = parse_env::<u16>(&get, "GATEWAY__PORT")? {
            self.listen_addr.set_port(port);
        }
        if let Some(raw) = get("GATEWAY__ENVIRONMENT") {
            self.environment = raw
                .parse()
                .map_err(|_| invalid("GATEWAY__ENVIRONMENT", &raw))?;
        }
        if let Some(v) = parse_bool(&get, "GATEWAY__ENFORCE_HTTPS")? {
            self.enforce_https = v;
        }
        if let Some(v) = parse_env(&get, "GATEWAY__RATE_LIMIT_MAX")? {
            self.rate_limit.max_requests = v;
        }
        if let Some(v) = parse_env(&get, "GATEWAY__RATE_LIMIT_WINDOW_SECS")? {
            self.rate_limit.window_secs = v;
        }
        if let Some(v) = parse_env(&get, "GATEWAY__UPSTREAM_TIMEOUT_SECS")? {
            self.upstream_timeout_secs = v;
        }
        if let Some(v) = parse_bool(&get, "GATEWAY__UPSTREAM_TLS_INSECURE")? {
            self.upstream_tls_insecure = Some(v);
        }

        let auth = &mut self.auth;
        if let Some(v) = get("IDP__ISSUER") {
            auth.idp_issuer = Some(v);
        }
        if let Some(v) = get("IDP__DOMAIN") {
            auth.idp_domain = Some(v);
        }
        if let Some(v) = get("IDP__AUDIENCE") {
            auth.idp_audience = Some(v);
        }
        if let Some(v) = parse_env(&get, "IDP__CLOCK_SKEW_SECS")? {
            auth.clock_skew_secs = v;
        }
        if let Some(v) = parse_env(&get, "IDP__JWKS_REQUESTS_PER_MINUTE")? {
            auth.jwks_requests_per_minute = v;
        }
        if let Some(v) = parse_env(&get, "IDP__JWKS_CACHE_TTL_SECS")? {
            auth.jwks_cache_ttl_secs = v;
        }
        if let Some(v) = get("JWT__SECRET") {
            auth.jwt_secret = Some(v);
        }
        if let Some(v) = get("JWT__ISSUER") {
            auth.jwt_issuer = v;
        }
        if let Some(v) = get("JWT__AUDIENCE") {
            auth.jwt_audience = v;
        }

        if let Some(v) = get("BUILD_VERSION") {
            self.service.version = v;
        }
        if let Some(v) = get("BUILD_COMMIT") {
            self.service.commit = v;
        }

        for route in &mut self.routes {
            if let Some(url) = route.upstream_env.as_deref().and_then(&get) {
                route.upstream = Some(url);
            }
        }

        self.validate()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit.max_requests == 0 {
            return Err(invalid("rate_limit.max_requests", "0"));
        }
        if self.rate_limit.window_secs == 0 {
            return Err(invalid("rate_limit.window_secs", "0"));
        }
        if self.upstream_timeout_secs == 0 {
            return Err(invalid("upstream_timeout_secs", "0"));
        }
        if self.auth.jwks_requests_per_minute == 0 {
            return Err(invalid("auth.jwks_requests_per_minute", "0"));
        }
        Ok(())
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_env<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    get(key)
        .map(|raw| raw.trim().parse::<T>().map_err(|_| invalid(key, &raw)))
        .transpose()
}

fn parse_bool(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<bool>, ConfigError> {
    get(key)
        .map(|raw| match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(invalid(key, &raw)),
        })
        .transpose()
}
