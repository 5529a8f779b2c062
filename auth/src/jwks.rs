use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey};
use reqwest::Url;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::JwksError;

const REFRESH_WINDOW: Duration = Duration::from_secs(60);

/// Tuning for the key set cache.
#[derive(Debug, Clone)]
pub struct JwksSettings {
    /// How long a fetched key set is considered fresh.
    pub cache_ttl: Duration,
    /// Ceiling on outbound key set fetches per rolling minute.
    pub max_refreshes_per_minute: u32,
    /// Bound on a single fetch.
    pub fetch_timeout: Duration,
    /// First suspension after a provider error; doubles per consecutive failure.
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for JwksSettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(600),
            max_refreshes_per_minute: 10,
            fetch_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Asymmetric key families accepted from a key set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Rsa,
    EllipticCurve,
    Edwards,
}

impl KeyKind {
    /// Family a token header algorithm belongs to. Symmetric algorithms have
    /// no family here and can never be verified from a key set.
    pub fn for_algorithm(alg: Algorithm) -> Option<Self> {
        match alg {
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512 => Some(KeyKind::Rsa),
            Algorithm::ES256 | Algorithm::ES384 => Some(KeyKind::EllipticCurve),
            Algorithm::EdDSA => Some(KeyKind::Edwards),
            _ => None,
        }
    }
}

/// One verification key taken from the provider's key set.
#[derive(Clone)]
pub struct SigningKey {
    pub kid: Option<String>,
    pub kind: KeyKind,
    pub(crate) decoding: DecodingKey,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl SigningKey {
    fn from_jwk(jwk: &Jwk) -> Option<Self> {
        if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
            return None;
        }
        let kind = match &jwk.algorithm {
            AlgorithmParameters::RSA(_) => KeyKind::Rsa,
            AlgorithmParameters::EllipticCurve(_) => KeyKind::EllipticCurve,
            AlgorithmParameters::OctetKeyPair(_) => KeyKind::Edwards,
            // Symmetric secrets are never accepted from a key set.
            AlgorithmParameters::OctetKey(_) => return None,
        };
        let decoding = DecodingKey::from_jwk(jwk).ok()?;
        Some(Self {
            kid: jwk.common.key_id.clone(),
            kind,
            decoding,
        })
    }
}

/// A fetched key set with the instant it was fetched.
#[derive(Debug)]
pub struct KeySet {
    keys: Vec<SigningKey>,
    fetched_at: Instant,
}

impl KeySet {
    /// Parse a JWKS document, skipping entries that are not usable
    /// asymmetric signing keys instead of rejecting the whole set.
    pub fn from_document(doc: &serde_json::Value) -> Result<Self, JwksError> {
        let entries = doc
            .get("keys")
            .and_then(|k| k.as_array())
            .ok_or_else(|| JwksError::Parse("missing \"keys\" array".into()))?;

        let keys: Vec<SigningKey> = entries
            .iter()
            .filter_map(|entry| match serde_json::from_value::<Jwk>(entry.clone()) {
                Ok(jwk) => SigningKey::from_jwk(&jwk),
                Err(e) => {
                    debug!(error = %e, "skipping unparseable JWK");
                    None
                }
            })
            .collect();

        if keys.is_empty() {
            return Err(JwksError::NoUsableKeys);
        }
        Ok(Self {
            keys,
            fetched_at: Instant::now(),
        })
    }

    /// Keys eligible to verify a token with the given `kid`. Without a kid
    /// every key is a candidate. A kid that names no key falls back to the
    /// keys published without one.
    pub fn select(&self, kid: Option<&str>) -> Vec<SigningKey> {
        let Some(kid) = kid else {
            return self.keys.clone();
        };
        let named: Vec<SigningKey> = self
            .keys
            .iter()
            .filter(|k| k.kid.as_deref() == Some(kid))
            .cloned()
            .collect();
        if !named.is_empty() {
            return named;
        }
        self.keys.iter().filter(|k| k.kid.is_none()).cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }
}

#[derive(Default)]
struct RefreshState {
    recent: VecDeque<Instant>,
    consecutive_failures: u32,
    suspended_until: Option<Instant>,
    last_outcome: Option<Result<Arc<KeySet>, JwksError>>,
}

/// In-memory cache of the identity provider's signing keys.
///
/// Refreshes are single-flight: the refresh lock is held for the duration
/// of the fetch, and callers that queued behind an in-flight fetch take its
/// outcome instead of fetching again. Fetches are additionally capped per
/// rolling minute and suspended with exponential backoff after provider
/// errors, independent of request volume.
pub struct JwksCache {
    jwks_url: Url,
    client: reqwest::Client,
    settings: JwksSettings,
    current: RwLock<Option<Arc<KeySet>>>,
    refresh: Mutex<RefreshState>,
    attempts: AtomicU64,
    fetches: AtomicU64,
}

impl JwksCache {
    /// Build a cache for `{issuer}/.well-known/jwks.json`.
    pub fn for_issuer(issuer: &str, settings: JwksSettings) -> Result<Self, JwksError> {
        let url = format!("{}/.well-known/jwks.json", issuer.trim_end_matches('/'));
        Self::new(&url, settings)
    }

    /// Build a cache for an explicit key set URL.
    ///
    /// Plain http is only accepted for loopback hosts.
    pub fn new(jwks_url: &str, settings: JwksSettings) -> Result<Self, JwksError> {
        let url = Url::parse(jwks_url).map_err(|e| JwksError::InvalidUrl(e.to_string()))?;
        match url.scheme() {
            "https" => {}
            "http" => {
                let host = url.host_str().unwrap_or_default();
                if host != "localhost" && host != "127.0.0.1" && host != "[::1]" {
                    return Err(JwksError::InsecureUrl(jwks_url.to_string()));
                }
            }
            _ => return Err(JwksError::InvalidUrl(jwks_url.to_string())),
        }

        let client = reqwest::Client::builder()
            .timeout(settings.fetch_timeout)
            .build()
            .map_err(|e| JwksError::Fetch(e.to_string()))?;

        Ok(Self {
            jwks_url: url,
            client,
            settings,
            current: RwLock::new(None),
            refresh: Mutex::new(RefreshState::default()),
            attempts: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
        })
    }

    pub fn url(&self) -> &str {
        self.jwks_url.as_str()
    }

    /// Number of outbound fetches issued so far.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Candidate verification keys for a token.
    ///
    /// Served from cache while fresh. A stale set, or a `kid` absent from the
    /// cached set (key rotation), triggers a refresh subject to the ceiling.
    /// An empty result means no key matches.
    pub async fn keys_for(&self, kid: Option<&str>) -> Result<Vec<SigningKey>, JwksError> {
        let observed = self.attempts.load(Ordering::Acquire);

        if let Some(set) = self.current.read().await.clone() {
            let fresh = set.fetched_at.elapsed() < self.settings.cache_ttl;
            let selected = set.select(kid);
            if fresh && !selected.is_empty() {
                return Ok(selected);
            }
        }

        let set = self.refresh(observed).await?;
        Ok(set.select(kid))
    }

    async fn refresh(&self, observed: u64) -> Result<Arc<KeySet>, JwksError> {
        let mut state = self.refresh.lock().await;

        // A fetch completed while this caller was queued; share its result.
        if self.attempts.load(Ordering::Acquire) != observed {
            if let Some(outcome) = &state.last_outcome {
                return outcome.clone();
            }
        }

        let now = Instant::now();
        if let Some(until) = state.suspended_until {
            if now < until {
                debug!(url = %self.jwks_url, "key set refresh suspended");
                return self.stale_or(JwksError::Suspended).await;
            }
        }

        while let Some(oldest) = state.recent.front() {
            if now.duration_since(*oldest) >= REFRESH_WINDOW {
                state.recent.pop_front();
            } else {
                break;
            }
        }
        if state.recent.len() >= self.settings.max_refreshes_per_minute as usize {
            warn!(
                url = %self.jwks_url,
                limit = self.settings.max_refreshes_per_minute,
                "key set refresh ceiling reached"
            );
            return self.stale_or(JwksError::Throttled).await;
        }
        state.recent.push_back(now);

        let outcome = match self.fetch().await {
            Ok(set) => {
                *self.current.write().await = Some(set.clone());
                state.consecutive_failures = 0;
                state.suspended_until = None;
                info!(url = %self.jwks_url, keys = set.len(), "key set refreshed");
                Ok(set)
            }
            Err(e) => {
                state.consecutive_failures += 1;
                let backoff = self.backoff(state.consecutive_failures);
                state.suspended_until = Some(Instant::now() + backoff);
                warn!(
                    url = %self.jwks_url,
                    error = %e,
                    failures = state.consecutive_failures,
                    backoff_ms = backoff.as_millis() as u64,
                    "key set refresh failed"
                );
                self.stale_or(e).await
            }
        };

        state.last_outcome = Some(outcome.clone());
        self.attempts.fetch_add(1, Ordering::Release);
        outcome
    }

    async fn fetch(&self) -> Result<Arc<KeySet>, JwksError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);

        let response = self
            .client
            .get(self.jwks_url.clone())
            .send()
            .await
            .map_err(|e| JwksError::Fetch(e.to_string()))?;

        if !response.status().is_success() {
            return Err(JwksError::Status(response.status().as_u16()));
        }

        let doc: serde_json::Value = response
            .json()
            .await
            .map_err(|e| JwksError::Parse(e.to_string()))?;

        KeySet::from_document(&doc).map(Arc::new)
    }

    /// Serve the previous key set when a refresh cannot happen.
    async fn stale_or(&self, err: JwksError) -> Result<Arc<KeySet>, JwksError> {
        self.current.read().await.clone().ok_or(err)
    }

    fn backoff(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.settings
            .initial_backoff
            .saturating_mul(factor)
            .min(self.settings.max_backoff)
    }
}
