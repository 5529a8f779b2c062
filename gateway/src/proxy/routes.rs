use std::collections::HashSet;

use reqwest::Url;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("route prefix must start with '/': {0:?}")]
    InvalidPrefix(String),
    #[error("duplicate route prefix: {0}")]
    DuplicatePrefix(String),
    #[error("invalid upstream URL for {prefix}: {reason}")]
    InvalidUpstream { prefix: String, reason: String },
}

/// An enabled route: a path prefix and the upstream it forwards to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub prefix: String,
    pub upstream: Url,
    pub required_roles: Vec<String>,
}

impl Route {
    /// Upstream URL for a request path already stripped of the prefix.
    pub fn target(&self, forward_path: &str, query: Option<&str>) -> String {
        let base = self.upstream.as_str().trim_end_matches('/');
        match query {
            Some(q) if !q.is_empty() => format!("{base}{forward_path}?{q}"),
            _ => format!("{base}{forward_path}"),
        }
    }
}

/// Result of a successful lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteMatch<'a> {
    pub route: &'a Route,
    /// The request path relative to the upstream's root.
    pub forward_path: &'a str,
}

#[derive(Debug, Clone)]
struct Entry {
    prefix: String,
    /// `None` marks a prefix whose service is not deployed here.
    route: Option<Route>,
}

/// Collects routes at startup; see [`RouteTable`].
#[derive(Debug, Default)]
pub struct RouteTableBuilder {
    entries: Vec<Entry>,
    seen: HashSet<String>,
}

impl RouteTableBuilder {
    /// Register a prefix. An absent or blank upstream disables the prefix:
    /// it is never matched, and requests under it do not fall through to a
    /// shorter enabled prefix.
    pub fn register(
        &mut self,
        prefix: &str,
        upstream: Option<&str>,
        required_roles: Vec<String>,
    ) -> Result<&mut Self, RouteError> {
        let prefix = normalize_prefix(prefix)?;
        if self.seen.contains(&prefix) {
            return Err(RouteError::DuplicatePrefix(prefix));
        }

        let upstream = upstream.map(str::trim).filter(|u| !u.is_empty());
        let route = match upstream {
            Some(raw) => {
                let url = parse_upstream(&prefix, raw)?;
                info!(prefix = %prefix, upstream = %url, "route enabled");
                Some(Route {
                    prefix: prefix.clone(),
                    upstream: url,
                    required_roles,
                })
            }
            None => {
                info!(prefix = %prefix, "route disabled: no upstream configured");
                None
            }
        };

        self.seen.insert(prefix.clone());
        self.entries.push(Entry { prefix, route });
        Ok(self)
    }

    pub fn build(mut self) -> RouteTable {
        // Longest prefix first so the first hit is the most specific.
        self.entries
            .sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()).then(a.prefix.cmp(&b.prefix)));
        RouteTable {
            entries: self.entries,
        }
    }
}

/// Immutable prefix -> upstream table, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    entries: Vec<Entry>,
}

impl RouteTable {
    pub fn builder() -> RouteTableBuilder {
        RouteTableBuilder::default()
    }

    /// Longest-prefix match on path-segment boundaries.
    pub fn match_path<'a>(&'a self, path: &'a str) -> Option<RouteMatch<'a>> {
        let entry = self
            .entries
            .iter()
            .find(|e| strip_segment_prefix(path, &e.prefix).is_some())?;

        match &entry.route {
            Some(route) => {
                let forward_path = strip_segment_prefix(path, &entry.prefix)?;
                Some(RouteMatch {
                    route,
                    forward_path,
                })
            }
            None => {
                debug!(prefix = %entry.prefix, path = %path, "matched disabled route");
                None
            }
        }
    }

    /// Enabled routes, most specific first.
    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.entries.iter().filter_map(|e| e.route.as_ref())
    }

    pub fn len(&self) -> usize {
        self.routes().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn normalize_prefix(prefix: &str) -> Result<String, RouteError> {
    let trimmed = prefix.trim();
    if !trimmed.starts_with('/') {
        return Err(RouteError::InvalidPrefix(prefix.to_string()));
    }
    let normalized = trimmed.trim_end_matches('/');
    Ok(if normalized.is_empty() {
        "/".to_string()
    } else {
        normalized.to_string()
    })
}

fn parse_upstream(prefix: &str, raw: &str) -> Result<Url, RouteError> {
    let invalid = |reason: String| RouteError::InvalidUpstream {
        prefix: prefix.to_string(),
        reason,
    };
    let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme {}", url.scheme())));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host".into()));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(invalid("query and fragment are not allowed".into()));
    }
    Ok(url)
}

/// True when any segment is `.` or `..`, literally or percent-encoded, or
/// when the path carries a backslash. Upstream URL parsing would resolve
/// these and move the request out of the prefix it was authorized under.
pub fn has_dot_segment(path: &str) -> bool {
    if path.contains('\\') || contains_ignore_ascii_case(path, "%5c") {
        return true;
    }
    path.split('/').any(|segment| {
        let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
        decoded == "." || decoded == ".."
    })
}

fn contains_ignore_ascii_case(haystack: &str, needle: &str) -> bool {
    haystack
        .as_bytes()
        .windows(needle.len())
        .any(|w| w.eq_ignore_ascii_case(needle.as_bytes()))
}

/// Remainder of `path` under `prefix`, always starting with '/'.
fn strip_segment_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix == "/" {
        return Some(path);
    }
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() {
        Some("/")
    } else if rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(routes: &[(&str, Option<&str>)]) -> RouteTable {
        let mut builder = RouteTable::builder();
        for (prefix, upstream) in routes {
            builder.register(prefix, *upstream, Vec::new()).unwrap();
        }
        builder.build()
    }

    #[test]
    fn test_longest_prefix_wins() {
        let routes = table(&[
            ("/labs", Some("http://lab-svc:8094")),
            ("/labs/internal", Some("http://lab-internal:9000")),
        ]);

        let m = routes.match_path("/labs/internal/x").unwrap();
        assert_eq!(m.route.prefix, "/labs/internal");
        assert_eq!(m.forward_path, "/x");

        let m = routes.match_path("/labs/interpret").unwrap();
        assert_eq!(m.route.prefix, "/labs");
        assert_eq!(m.forward_path, "/interpret");

        assert!(routes.match_path("/other").is_none());
    }

    #[test]
    fn test_matches_on_segment_boundary() {
        let routes = table(&[("/labs", Some("http://lab-svc:8094"))]);
        assert_eq!(routes.match_path("/labs").unwrap().forward_path, "/");
        assert_eq!(routes.match_path("/labs/").unwrap().forward_path, "/");
        assert!(routes.match_path("/labsfoo").is_none());
    }

    #[test]
    fn test_disabled_route_is_never_matched() {
        let routes = table(&[
            ("/api", Some("http://core:8080")),
            ("/api/genome", None),
            ("/api/sleep", Some("  ")),
        ]);
        assert_eq!(routes.len(), 1);
        assert!(routes.match_path("/api/genome/analyze").is_none());
        assert!(routes.match_path("/api/sleep").is_none());
        assert_eq!(
            routes.match_path("/api/patients").unwrap().route.prefix,
            "/api"
        );
    }

    #[test]
    fn test_duplicate_prefix_rejected() {
        let mut builder = RouteTable::builder();
        builder.register("/labs", None, Vec::new()).unwrap();
        let err = builder
            .register("/labs/", Some("http://lab-svc"), Vec::new())
            .unwrap_err();
        assert_eq!(err, RouteError::DuplicatePrefix("/labs".into()));
    }

    #[test]
    fn test_invalid_registrations() {
        let mut builder = RouteTable::builder();
        assert!(matches!(
            builder.register("labs", Some("http://x"), Vec::new()),
            Err(RouteError::InvalidPrefix(_))
        ));
        assert!(matches!(
            builder.register("/labs", Some("ftp://lab-svc"), Vec::new()),
            Err(RouteError::InvalidUpstream { .. })
        ));
        assert!(matches!(
            builder.register("/sleep", Some("not a url"), Vec::new()),
            Err(RouteError::InvalidUpstream { .. })
        ));
    }

    #[test]
    fn test_target_keeps_query_and_base_path() {
        let routes = table(&[
            ("/labs", Some("http://lab-svc:8094")),
            ("/core", Some("https://core.internal/v1/")),
        ]);

        let m = routes.match_path("/labs/interpret").unwrap();
        assert_eq!(
            m.route.target(m.forward_path, Some("x=1")),
            "http://lab-svc:8094/interpret?x=1"
        );

        let m = routes.match_path("/core/patients/7").unwrap();
        assert_eq!(
            m.route.target(m.forward_path, None),
            "https://core.internal/v1/patients/7"
        );
    }

    #[test]
    fn test_dot_segments_detected() {
        for path in [
            "/api/labs/swagger/../interpret",
            "/api/labs/swagger/%2e%2e/admin/users",
            "/api/labs/swagger/%2E./admin",
            "/api/labs/./interpret",
            "/api/labs/%2e",
            "/api/labs/..",
            "/api/labs/swagger\\..\\admin",
            "/api/labs/swagger%5C..%5cadmin",
        ] {
            assert!(has_dot_segment(path), "{path}");
        }
        for path in [
            "/api/labs/interpret",
            "/api/labs/v1.2/report.pdf",
            "/api/labs/...",
            "/api/labs/..hidden",
            "/",
        ] {
            assert!(!has_dot_segment(path), "{path}");
        }
    }

    #[test]
    fn test_root_prefix_is_catch_all() {
        let routes = table(&[("/", Some("http://fallback")), ("/labs", Some("http://lab"))]);
        assert_eq!(routes.match_path("/anything").unwrap().route.prefix, "/");
        assert_eq!(routes.match_path("/labs/x").unwrap().route.prefix, "/labs");
    }
}
