pub mod routes;

use std::net::IpAddr;
use std::time::Duration;

use axum::body::{Body, HttpBody};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Request, Response};
use phos_types::{ErrorCode, Identity};
use thiserror::Error;
use tracing::{error, info};

use crate::tls::UpstreamTls;

pub use routes::{has_dot_segment, Route, RouteError, RouteMatch, RouteTable, RouteTableBuilder};

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub const X_AUTHENTICATED_SUBJECT: HeaderName =
    HeaderName::from_static("x-authenticated-subject");
pub const X_AUTHENTICATED_ROLES: HeaderName = HeaderName::from_static("x-authenticated-roles");
pub const X_CORRELATION_ID: HeaderName = HeaderName::from_static("x-correlation-id");

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Headers this layer owns on the outbound request; client copies are
/// dropped before the gateway's values are set.
const GATEWAY_OWNED: &[&str] = &[
    "host",
    "forwarded",
    "x-forwarded-for",
    "x-forwarded-proto",
    "x-forwarded-host",
    "x-authenticated-subject",
    "x-authenticated-roles",
    "x-correlation-id",
];

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("upstream connection failed: {0}")]
    ConnectionFailed(String),
    #[error("upstream timeout")]
    Timeout,
    #[error("request error: {0}")]
    RequestError(String),
    #[error("proxy client setup failed: {0}")]
    Client(String),
}

impl ProxyError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ProxyError::ConnectionFailed(_) | ProxyError::RequestError(_) => {
                ErrorCode::UpstreamUnreachable
            }
            ProxyError::Timeout => ErrorCode::UpstreamTimeout,
            ProxyError::Client(_) => ErrorCode::Internal,
        }
    }
}

/// Values the gateway injects into every forwarded request.
#[derive(Debug, Clone)]
pub struct ForwardContext {
    pub client_ip: IpAddr,
    pub proto: &'static str,
    pub correlation_id: String,
}

/// Single-hop reverse proxy. No retries: a failed upstream call is reported
/// to the caller as-is.
pub struct ProxyService {
    client: reqwest::Client,
    timeout: Duration,
}

impl ProxyService {
    pub fn new(timeout: Duration, tls: UpstreamTls) -> Result<Self, ProxyError> {
        let builder = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(64);
        let client = tls
            .apply(builder)
            .build()
            .map_err(|e| ProxyError::Client(e.to_string()))?;
        Ok(Self { client, timeout })
    }

    /// Forward `req` to `target` and stream the upstream response back.
    ///
    /// Dropping the returned body (client went away) drops the upstream
    /// stream and releases its connection.
    pub async fn forward(
        &self,
        target: &str,
        req: Request<Body>,
        ctx: &ForwardContext,
        identity: Option<&Identity>,
    ) -> Result<Response<Body>, ProxyError> {
        let (parts, body) = req.into_parts();
        let headers = outbound_headers(&parts.headers, ctx, identity);

        info!(
            method = %parts.method,
            upstream = %target,
            "forwarding request"
        );

        let mut builder = self
            .client
            .request(parts.method.clone(), target)
            .headers(headers);
        if !body.is_end_stream() {
            builder = builder.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let response = tokio::time::timeout(self.timeout, builder.send())
            .await
            .map_err(|_| ProxyError::Timeout)?
            .map_err(|e| {
                error!(error = %e, upstream = %target, "upstream request failed");
                if e.is_timeout() {
                    ProxyError::Timeout
                } else if e.is_connect() {
                    ProxyError::ConnectionFailed(e.to_string())
                } else {
                    ProxyError::RequestError(e.to_string())
                }
            })?;

        let mut out = Response::builder().status(response.status());
        if let Some(headers) = out.headers_mut() {
            copy_end_to_end(response.headers(), headers);
        }
        out.body(Body::from_stream(response.bytes_stream()))
            .map_err(|e| ProxyError::RequestError(e.to_string()))
    }
}

/// Inbound headers minus hop-by-hop and gateway-owned names, plus the
/// forwarding and identity headers this layer sets.
pub fn outbound_headers(
    inbound: &HeaderMap,
    ctx: &ForwardContext,
    identity: Option<&Identity>,
) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len() + 6);
    copy_end_to_end(inbound, &mut headers);
    for name in GATEWAY_OWNED {
        headers.remove(*name);
    }

    if let Ok(v) = HeaderValue::from_str(&ctx.client_ip.to_string()) {
        headers.insert(X_FORWARDED_FOR, v);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(ctx.proto));
    if let Some(host) = inbound.get(header::HOST) {
        headers.insert(X_FORWARDED_HOST, host.clone());
    }
    if let Ok(v) = HeaderValue::from_str(&ctx.correlation_id) {
        headers.insert(X_CORRELATION_ID, v);
    }

    if let Some(identity) = identity {
        if let Ok(v) = HeaderValue::from_str(&identity.subject) {
            headers.insert(X_AUTHENTICATED_SUBJECT, v);
        }
        let roles = identity.roles.iter().cloned().collect::<Vec<_>>().join(",");
        if let Ok(v) = HeaderValue::from_str(&roles) {
            headers.insert(X_AUTHENTICATED_ROLES, v);
        }
    }
    headers
}

/// Copy every header except hop-by-hop ones and those the `Connection`
/// header nominates.
fn copy_end_to_end(from: &HeaderMap, to: &mut HeaderMap) {
    let nominated: Vec<String> = from
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for (name, value) in from.iter() {
        let name_str = name.as_str();
        if is_hop_by_hop(name_str) || nominated.iter().any(|n| n == name_str) {
            continue;
        }
        to.append(name.clone(), value.clone());
    }
}

/// Check if a header is a hop-by-hop header that must not be forwarded.
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Request as AxumRequest, routing::any, Json, Router};
    use http::{Method, StatusCode};
    use http_body_util::BodyExt;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ctx() -> ForwardContext {
        ForwardContext {
            client_ip: IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)),
            proto: "https",
            correlation_id: "cid-42".into(),
        }
    }

    async fn echo(req: AxumRequest) -> Json<serde_json::Value> {
        let (parts, body) = req.into_parts();
        let body = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        let headers: serde_json::Map<String, serde_json::Value> = parts
            .headers
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    serde_json::Value::String(v.to_str().unwrap_or_default().to_string()),
                )
            })
            .collect();
        Json(serde_json::json!({
            "method": parts.method.as_str(),
            "uri": parts.uri.to_string(),
            "headers": headers,
            "body": String::from_utf8_lossy(&body),
        }))
    }

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("keep-alive"));
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(is_hop_by_hop("Upgrade"));
        assert!(is_hop_by_hop("Proxy-Authorization"));

        assert!(!is_hop_by_hop("Content-Type"));
        assert!(!is_hop_by_hop("Authorization"));
        assert!(!is_hop_by_hop("Host"));
    }

    #[test]
    fn test_outbound_headers_overwrite_client_values() {
        let mut inbound = HeaderMap::new();
        inbound.insert(header::HOST, HeaderValue::from_static("portal.phos.health"));
        inbound.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        inbound.insert(X_FORWARDED_FOR, HeaderValue::from_static("6.6.6.6"));
        inbound.insert(X_AUTHENTICATED_SUBJECT, HeaderValue::from_static("admin"));
        inbound.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-secret"));
        inbound.insert("x-secret", HeaderValue::from_static("1"));
        inbound.insert("x-custom", HeaderValue::from_static("kept"));

        let identity = Identity::new("patient-1", ["Patient", "Employee"]);
        let out = outbound_headers(&inbound, &ctx(), Some(&identity));

        assert_eq!(out[X_FORWARDED_FOR], "10.1.2.3");
        assert_eq!(out[X_FORWARDED_PROTO], "https");
        assert_eq!(out[X_FORWARDED_HOST], "portal.phos.health");
        assert_eq!(out[X_CORRELATION_ID], "cid-42");
        assert_eq!(out[X_AUTHENTICATED_SUBJECT], "patient-1");
        assert_eq!(out[X_AUTHENTICATED_ROLES], "employee,patient");
        assert_eq!(out[header::AUTHORIZATION], "Bearer abc");
        assert_eq!(out["x-custom"], "kept");
        assert!(out.get(header::HOST).is_none());
        assert!(out.get(header::CONNECTION).is_none());
        assert!(out.get("x-secret").is_none());
    }

    #[test]
    fn test_anonymous_requests_carry_no_identity() {
        let mut inbound = HeaderMap::new();
        inbound.insert(X_AUTHENTICATED_ROLES, HeaderValue::from_static("admin"));
        let out = outbound_headers(&inbound, &ctx(), None);
        assert!(out.get(X_AUTHENTICATED_ROLES).is_none());
        assert!(out.get(X_AUTHENTICATED_SUBJECT).is_none());
    }

    #[tokio::test]
    async fn test_forward_preserves_method_path_and_body() {
        let base = spawn(Router::new().fallback(echo)).await;
        let proxy = ProxyService::new(Duration::from_secs(5), UpstreamTls::Verify).unwrap();

        let req = Request::builder()
            .method(Method::POST)
            .uri("/labs/interpret?x=1")
            .header(header::HOST, "gateway.local")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"panel":"lipid"}"#))
            .unwrap();

        let target = format!("{base}/interpret?x=1");
        let response = proxy.forward(&target, req, &ctx(), None).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let echoed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(echoed["method"], "POST");
        assert_eq!(echoed["uri"], "/interpret?x=1");
        assert_eq!(echoed["body"], r#"{"panel":"lipid"}"#);
        assert_eq!(echoed["headers"]["content-type"], "application/json");
        assert_eq!(echoed["headers"]["x-forwarded-host"], "gateway.local");
        assert_ne!(echoed["headers"]["host"], "gateway.local");
    }

    #[tokio::test]
    async fn test_upstream_error_status_passes_through() {
        let app = Router::new().fallback(|| async {
            (StatusCode::UNPROCESSABLE_ENTITY, "bad panel")
        });
        let base = spawn(app).await;
        let proxy = ProxyService::new(Duration::from_secs(5), UpstreamTls::Verify).unwrap();

        let req = Request::builder().uri("/x").body(Body::empty()).unwrap();
        let response = proxy
            .forward(&format!("{base}/x"), req, &ctx(), None)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"bad panel");
    }

    #[tokio::test]
    async fn test_connection_refused() {
        // Bind then drop to get a port with nothing listening.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let proxy = ProxyService::new(Duration::from_secs(5), UpstreamTls::Verify).unwrap();
        let req = Request::builder().uri("/x").body(Body::empty()).unwrap();
        let err = proxy
            .forward(&format!("http://{addr}/x"), req, &ctx(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::ConnectionFailed(_)));
        assert_eq!(err.error_code(), ErrorCode::UpstreamUnreachable);
    }

    #[tokio::test]
    async fn test_slow_upstream_times_out() {
        let started = Arc::new(AtomicUsize::new(0));
        let app = Router::new().route(
            "/slow",
            any({
                let started = started.clone();
                move || {
                    let started = started.clone();
                    async move {
                        started.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        "late"
                    }
                }
            }),
        );
        let base = spawn(app).await;
        let proxy = ProxyService::new(Duration::from_millis(300), UpstreamTls::Verify).unwrap();

        let req = Request::builder().uri("/slow").body(Body::empty()).unwrap();
        let begin = std::time::Instant::now();
        let err = proxy
            .forward(&format!("{base}/slow"), req, &ctx(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Timeout));
        assert!(begin.elapsed() < Duration::from_secs(5));
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }
}
