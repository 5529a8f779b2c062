pub mod rate_limit;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use phos_types::Identity;
use tracing::{debug, info, info_span, Instrument};

use crate::error::{tag_panic_response, GatewayError};
use crate::proxy::{
    has_dot_segment, ForwardContext, Route, X_CORRELATION_ID, X_FORWARDED_PROTO,
};
use crate::Gateway;

pub use rate_limit::{Decision, Quota, RateLimiter};

const MAX_CORRELATION_ID_LEN: usize = 64;

/// Request-scoped id carried in extensions, logs, upstream calls and error
/// envelopes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn generate() -> Self {
        Self(format!("{:032x}", rand::random::<u128>()))
    }

    /// Reuse a caller-supplied id only if it is a short printable token.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .get(X_CORRELATION_ID)
            .and_then(|v| v.to_str().ok())
            .filter(|v| is_acceptable_id(v))
            .map(|v| Self(v.to_string()))
            .unwrap_or_else(Self::generate)
    }
}

fn is_acceptable_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_CORRELATION_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

/// Outermost layer: assigns the correlation id, opens the request span and
/// logs completion.
pub async fn correlation_middleware(mut req: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let correlation_id = CorrelationId::from_headers(req.headers());
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    req.extensions_mut().insert(correlation_id.clone());

    let span = info_span!("request", correlation_id = %correlation_id.0);
    let mut response = next.run(req).instrument(span.clone()).await;
    tag_panic_response(&mut response, &correlation_id);

    if let Ok(v) = HeaderValue::from_str(&correlation_id.0) {
        response.headers_mut().insert(X_CORRELATION_ID, v);
    }

    info!(
        parent: &span,
        method = %method,
        path = %path,
        status = %response.status().as_u16(),
        duration_ms = %start.elapsed().as_millis(),
        "request completed"
    );
    response
}

const SECURITY_HEADERS: &[(&str, &str)] = &[
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "DENY"),
    ("referrer-policy", "no-referrer"),
    ("cross-origin-resource-policy", "same-origin"),
    ("x-dns-prefetch-control", "off"),
];

const HSTS: &str = "max-age=15552000; includeSubDomains";

/// Adds browser hardening headers unless the upstream already set them.
pub async fn security_headers(
    State(gateway): State<Arc<Gateway>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    for (name, value) in SECURITY_HEADERS {
        headers
            .entry(HeaderName::from_static(*name))
            .or_insert(HeaderValue::from_static(*value));
    }
    if gateway.enforce_https {
        headers
            .entry(header::STRICT_TRANSPORT_SECURITY)
            .or_insert(HeaderValue::from_static(HSTS));
    }
    response
}

/// Outcome of one pipeline stage.
pub enum Flow<T> {
    Continue(T),
    Respond(Response),
}

macro_rules! proceed {
    ($stage:expr) => {
        match $stage {
            Flow::Continue(value) => value,
            Flow::Respond(response) => return response,
        }
    };
}

fn reject<T>(err: GatewayError, correlation_id: Option<&CorrelationId>) -> Flow<T> {
    Flow::Respond(err.into_response_with(correlation_id))
}

/// Everything not served by the gateway's own endpoints:
/// https gate, rate gate, path check, authentication, routing, authorization,
/// dispatch.
pub async fn edge_pipeline(State(gateway): State<Arc<Gateway>>, req: Request<Body>) -> Response {
    let correlation_id = req.extensions().get::<CorrelationId>().cloned();
    let cid = correlation_id.as_ref();

    proceed!(https_gate(gateway.enforce_https, &req, cid));

    let client_ip = client_ip(&req);
    let quota = proceed!(rate_gate(&gateway.limiter, client_ip, cid));

    let mut response = protected_dispatch(&gateway, req, client_ip, correlation_id).await;
    quota.write_headers(response.headers_mut());
    response
}

async fn protected_dispatch(
    gateway: &Gateway,
    req: Request<Body>,
    client_ip: IpAddr,
    correlation_id: Option<CorrelationId>,
) -> Response {
    let cid = correlation_id.as_ref();
    let path = req.uri().path().to_string();

    // Public-path and route decisions are made on the raw path, so it must
    // already be the path the upstream will resolve.
    if has_dot_segment(&path) {
        debug!(path = %path, "rejecting path with dot segments");
        return GatewayError::BadRequest("non-canonical path".into()).into_response_with(cid);
    }

    let identity = if gateway.public_paths.is_public(&path) {
        debug!(path = %path, "public path, skipping authentication");
        None
    } else {
        match gateway.authenticator.authenticate(req.headers()).await {
            Ok(identity) => Some(identity),
            Err(e) => return e.into_response_with(cid),
        }
    };

    let (route, target) = proceed!(route_stage(gateway, &path, req.uri().query(), cid));
    proceed!(authorize(route, identity.as_ref(), cid));

    let ctx = ForwardContext {
        client_ip,
        proto: forwarded_proto(gateway.enforce_https, req.headers()),
        correlation_id: correlation_id
            .as_ref()
            .map(|c| c.0.clone())
            .unwrap_or_default(),
    };

    match gateway
        .proxy
        .forward(&target, req, &ctx, identity.as_ref())
        .await
    {
        Ok(response) => response,
        Err(e) => GatewayError::from(e).into_response_with(cid),
    }
}

/// Permanent redirect to https when the trusted front proxy reports a
/// plaintext request.
fn https_gate(enforce: bool, req: &Request<Body>, cid: Option<&CorrelationId>) -> Flow<()> {
    let plaintext =
        front_proxy_proto(req.headers()).is_some_and(|p| p.eq_ignore_ascii_case("http"));
    if !enforce || !plaintext {
        return Flow::Continue(());
    }

    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().host());
    let Some(host) = host else {
        return reject(GatewayError::BadRequest("missing host".into()), cid);
    };
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    match HeaderValue::from_str(&format!("https://{host}{path_and_query}")) {
        Ok(location) => {
            debug!(location = ?location, "redirecting plaintext request");
            Flow::Respond(
                (StatusCode::PERMANENT_REDIRECT, [(header::LOCATION, location)]).into_response(),
            )
        }
        Err(_) => reject(GatewayError::BadRequest("invalid host".into()), cid),
    }
}

fn rate_gate(
    limiter: &RateLimiter,
    client_ip: IpAddr,
    cid: Option<&CorrelationId>,
) -> Flow<Quota> {
    match limiter.check(client_ip) {
        Decision::Allowed(quota) => Flow::Continue(quota),
        Decision::Limited(quota) => {
            let err = GatewayError::RateLimited {
                retry_after_secs: quota.reset_secs(),
            };
            let mut response = err.into_response_with(cid);
            quota.write_headers(response.headers_mut());
            Flow::Respond(response)
        }
    }
}

fn route_stage<'a>(
    gateway: &'a Gateway,
    path: &'a str,
    query: Option<&str>,
    cid: Option<&CorrelationId>,
) -> Flow<(&'a Route, String)> {
    match gateway.routes.match_path(path) {
        Some(m) => Flow::Continue((m.route, m.route.target(m.forward_path, query))),
        None => reject(GatewayError::NoRoute, cid),
    }
}

fn authorize(route: &Route, identity: Option<&Identity>, cid: Option<&CorrelationId>) -> Flow<()> {
    match identity {
        Some(identity) if !identity.has_any_role(&route.required_roles) => {
            debug!(
                subject = %identity.subject,
                prefix = %route.prefix,
                "identity lacks required role"
            );
            reject(GatewayError::Forbidden, cid)
        }
        _ => Flow::Continue(()),
    }
}

/// First value of `X-Forwarded-Proto` as set by the front proxy.
fn front_proxy_proto(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(X_FORWARDED_PROTO)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
}

/// Scheme reported upstream. The client's header is only believed when a
/// TLS-terminating front proxy is asserted by enabling enforcement.
fn forwarded_proto(enforce: bool, headers: &HeaderMap) -> &'static str {
    if enforce && front_proxy_proto(headers).is_some_and(|p| p.eq_ignore_ascii_case("https")) {
        "https"
    } else {
        "http"
    }
}

/// TCP peer address; forwarded headers are never used here.
fn client_ip(req: &Request<Body>) -> IpAddr {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}
