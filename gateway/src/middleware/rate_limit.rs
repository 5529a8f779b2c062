use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use http::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

pub const RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
pub const RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
pub const RATELIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");

/// Idle clients are only swept once the table holds more than this many.
const SWEEP_THRESHOLD: usize = 10_000;

/// One check in this many considers a sweep.
const SWEEP_EVERY: u64 = 1_024;

/// Budget state reported back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub limit: u32,
    pub remaining: u32,
    /// Until the oldest counted request leaves the window.
    pub reset_after: Duration,
}

impl Quota {
    /// Whole seconds until a slot frees up, never less than one.
    pub fn reset_secs(&self) -> u64 {
        let secs = self.reset_after.as_secs();
        let secs = if self.reset_after.subsec_nanos() > 0 { secs + 1 } else { secs };
        secs.max(1)
    }

    pub fn write_headers(&self, headers: &mut HeaderMap) {
        headers.insert(RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(RATELIMIT_RESET, HeaderValue::from(self.reset_secs()));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed(Quota),
    Limited(Quota),
}

/// Sliding-log limiter: at most `limit` requests per client address in any
/// `window`. Each client's log is locked on its own shard entry, so clients
/// do not contend with each other.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    clients: DashMap<IpAddr, VecDeque<Instant>>,
    checks: AtomicU64,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            clients: DashMap::new(),
            checks: AtomicU64::new(0),
        }
    }

    pub fn check(&self, client: IpAddr) -> Decision {
        self.check_at(client, Instant::now())
    }

    pub(crate) fn check_at(&self, client: IpAddr, now: Instant) -> Decision {
        // Must run before the entry guard below is taken; retain locks every shard.
        let n = self.checks.fetch_add(1, Ordering::Relaxed);
        if n % SWEEP_EVERY == SWEEP_EVERY - 1 && self.clients.len() > SWEEP_THRESHOLD {
            self.sweep(now);
        }

        let mut log = self.clients.entry(client).or_default();
        while let Some(oldest) = log.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                log.pop_front();
            } else {
                break;
            }
        }

        let limited = log.len() >= self.limit as usize;
        if !limited {
            log.push_back(now);
        }

        let reset_after = log
            .front()
            .map(|oldest| self.window.saturating_sub(now.saturating_duration_since(*oldest)))
            .unwrap_or(self.window);
        let quota = Quota {
            limit: self.limit,
            remaining: self.limit.saturating_sub(log.len() as u32),
            reset_after,
        };

        if limited {
            Decision::Limited(quota)
        } else {
            Decision::Allowed(quota)
        }
    }

    /// Drop clients whose most recent request has left the window.
    fn sweep(&self, now: Instant) {
        let window = self.window;
        self.clients.retain(|_, log| {
            log.back()
                .is_some_and(|last| now.saturating_duration_since(*last) < window)
        });
        debug!(clients = self.clients.len(), "rate limiter swept idle clients");
    }
}
