pub mod auth;
pub mod config;
pub mod error;
pub mod middleware;
pub mod proxy;
pub mod tls;

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use phos_auth::{JwksCache, RoleExtractor, TokenValidator};
use tower_http::catch_panic::CatchPanicLayer;
use tracing::info;

use crate::auth::{Authenticator, PublicPaths};
use crate::config::{AuthMode, ConfigError, GatewayConfig, ServiceInfo};
use crate::middleware::RateLimiter;
use crate::proxy::{ProxyService, RouteTable};
use crate::tls::UpstreamTls;

/// Everything a request needs, built once at startup and shared read-only.
pub struct Gateway {
    pub routes: RouteTable,
    pub public_paths: PublicPaths,
    pub authenticator: Authenticator,
    pub limiter: RateLimiter,
    pub proxy: ProxyService,
    pub enforce_https: bool,
    pub service: ServiceInfo,
}

impl Gateway {
    pub fn from_config(config: &GatewayConfig) -> Result<Self, ConfigError> {
        let mut builder = RouteTable::builder();
        for route in &config.routes {
            builder.register(
                &route.prefix,
                route.upstream.as_deref(),
                route.required_roles.clone(),
            )?;
        }
        let routes = builder.build();

        let public_paths = PublicPaths::new(
            routes.routes().map(|r| r.prefix.as_str()),
            &config.public_paths,
        );

        let auth = &config.auth;
        let validator = match auth.mode()? {
            AuthMode::Jwks { issuer, audience } => {
                let keys = JwksCache::for_issuer(&issuer, auth.jwks_settings())?;
                info!(jwks_url = %keys.url(), issuer = %issuer, "token validation: JWKS");
                TokenValidator::jwks(Arc::new(keys), issuer, audience, auth.clock_skew_secs)
            }
            AuthMode::SharedSecret {
                secret,
                issuer,
                audience,
            } => {
                info!(issuer = %issuer, "token validation: shared secret");
                TokenValidator::shared_secret(&secret, issuer, audience, auth.clock_skew_secs)
            }
        };
        let authenticator =
            Authenticator::new(validator, RoleExtractor::new(auth.role_claims.iter()));

        let tls = UpstreamTls::for_environment(config.environment, config.upstream_tls_insecure)?;
        let proxy = ProxyService::new(config.upstream_timeout(), tls)?;

        let limiter = RateLimiter::new(
            config.rate_limit.max_requests,
            std::time::Duration::from_secs(config.rate_limit.window_secs),
        );

        info!(
            routes = routes.len(),
            enforce_https = config.enforce_https,
            rate_limit = config.rate_limit.max_requests,
            "gateway configured"
        );

        Ok(Self {
            routes,
            public_paths,
            authenticator,
            limiter,
            proxy,
            enforce_https: config.enforce_https,
            service: config.service.clone(),
        })
    }
}

pub fn build_router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(info_endpoint))
        .fallback(middleware::edge_pipeline)
        .layer(CatchPanicLayer::custom(error::panic_response))
        .layer(axum::middleware::from_fn_with_state(
            gateway.clone(),
            middleware::security_headers,
        ))
        .layer(axum::middleware::from_fn(middleware::correlation_middleware))
        .with_state(gateway)
}

async fn health_check(State(gateway): State<Arc<Gateway>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": gateway.service.name,
        "version": gateway.service.version,
        "commit": gateway.service.commit,
        "time": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn info_endpoint(State(gateway): State<Arc<Gateway>>) -> Json<serde_json::Value> {
    let routes: Vec<&str> = gateway.routes.routes().map(|r| r.prefix.as_str()).collect();
    Json(serde_json::json!({
        "service": gateway.service.name,
        "version": gateway.service.version,
        "routes": routes,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouteConfig;
    use axum::body::Body;
    use http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.auth.jwt_secret = Some("0123456789abcdef0123456789abcdef".into());
        config.routes = vec![RouteConfig {
            prefix: "/api/labs".into(),
            upstream: Some("http://127.0.0.1:9".into()),
            ..RouteConfig::default()
        }];
        config
    }

    fn app(config: &GatewayConfig) -> Router {
        build_router(Arc::new(Gateway::from_config(config).unwrap()))
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let response = app(&test_config())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["service"], "phos-gateway");
        assert_eq!(json["commit"], "unknown");
        assert!(json["time"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_info_lists_prefixes_only() {
        let response = app(&test_config())
            .oneshot(Request::builder().uri("/info").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["routes"], serde_json::json!(["/api/labs"]));
        assert!(!json.to_string().contains("127.0.0.1"));
    }

    #[tokio::test]
    async fn test_security_and_correlation_headers() {
        let mut config = test_config();
        config.enforce_https = true;
        let response = app(&config)
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("x-correlation-id", "trace-77")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let headers = response.headers();
        assert_eq!(headers["x-content-type-options"], "nosniff");
        assert_eq!(headers["x-frame-options"], "DENY");
        assert_eq!(headers["referrer-policy"], "no-referrer");
        assert!(headers.contains_key("strict-transport-security"));
        assert_eq!(headers["x-correlation-id"], "trace-77");
    }

    #[tokio::test]
    async fn test_unauthenticated_envelope_carries_correlation_id() {
        let response = app(&test_config())
            .oneshot(
                Request::builder()
                    .uri("/api/labs/interpret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let cid = response.headers()["x-correlation-id"]
            .to_str()
            .unwrap()
            .to_string();
        assert!(response.headers().contains_key("ratelimit-remaining"));
        let json = body_json(response).await;
        assert_eq!(json["error"], "unauthorized");
        assert_eq!(json["correlationId"], cid);
    }

    #[tokio::test]
    async fn test_missing_secret_fails_startup() {
        let mut config = test_config();
        config.auth.jwt_secret = None;
        assert!(matches!(
            Gateway::from_config(&config),
            Err(ConfigError::MissingSecret)
        ));
    }

    #[tokio::test]
    async fn test_insecure_tls_refused_in_production() {
        let mut config = test_config();
        config.upstream_tls_insecure = Some(true);
        assert!(matches!(
            Gateway::from_config(&config),
            Err(ConfigError::Tls(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_prefix_fails_startup() {
        let mut config = test_config();
        config.routes.push(config.routes[0].clone());
        assert!(matches!(
            Gateway::from_config(&config),
            Err(ConfigError::Route(_))
        ));
    }
}
