//! Sliding-window + burst + fingerprint-anomaly rate limiting.
//!
//! Grounded on `original_source/core/rate_limiter.py`'s `RateLimiter` and
//! `AdvancedRateLimiter`: a per-client sliding one-minute window combined
//! with a five-second burst window, a temporary blacklist on violation, and
//! header-fingerprint anomaly detection. The bounded-map-with-FIFO-eviction
//! idiom (`MAX_TRACKED_CLIENTS`, evict-100-oldest) mirrors `crate::cache`'s
//! `IndexMap`-backed eviction. The `RouterRateLimitExt` hoop-wiring idiom
//! from `utils/limiter.rs` is kept for the salvo side; `pingora_limits`'
//! count-min sketch is dropped since it can't express a blacklist or
//! per-client burst window (see DESIGN.md).

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use ahash::RandomState;
use indexmap::IndexMap;
use salvo::oapi::ToSchema;
use tokio::sync::Mutex;
use tokio::time::Instant;

const MAX_TRACKED_CLIENTS: usize = 10_000;
const EVICTION_BATCH: usize = 100;
const BURST_WINDOW: Duration = Duration::from_secs(5);
const SLIDING_WINDOW: Duration = Duration::from_secs(60);
const STALE_AFTER: Duration = Duration::from_secs(3600);
const MAX_FINGERPRINTS_PER_CLIENT: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub burst_size: u32,
    pub cleanup_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            burst_size: 10,
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

/// Per-endpoint overrides; unlisted endpoints fall back to the config
/// default. Matched against the full mounted path (routes live under
/// `Router::with_path("api")`, see `crate::routers`), not the route's
/// relative sub-path.
fn endpoint_limit(endpoint: &str, default: u32) -> u32 {
    match endpoint {
        "/api/chat" => 30,
        "/api/health" => 120,
        "/api/sessions" => 60,
        _ => default,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Denied {
    pub retry_after_seconds: u64,
    pub reason: DenyReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    Blacklisted,
    RateLimitExceeded,
    BurstLimitExceeded,
    SuspiciousFingerprints,
}

struct ClientState {
    requests: VecDeque<Instant>,
    fingerprints: HashSet<String>,
    blacklisted_until: Option<Instant>,
}

impl ClientState {
    fn new() -> Self {
        Self {
            requests: VecDeque::new(),
            fingerprints: HashSet::new(),
            blacklisted_until: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub blacklisted_events: u64,
}

struct Inner {
    clients: IndexMap<String, ClientState, RandomState>,
    stats: RateLimiterStats,
    last_cleanup: Instant,
}

/// Header fields consulted for fingerprinting. Borrowed rather than owned so
/// callers can pass straight through from `Request::header`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FingerprintHeaders<'a> {
    pub user_agent: Option<&'a str>,
    pub accept: Option<&'a str>,
    pub accept_encoding: Option<&'a str>,
    pub accept_language: Option<&'a str>,
}

fn fingerprint(headers: FingerprintHeaders<'_>) -> String {
    let ua_category = headers
        .user_agent
        .and_then(|ua| woothee::parser::Parser::new().parse(ua))
        .map(|r| format!("{}/{}", r.category, r.name))
        .unwrap_or_default();

    let canonical = format!(
        "ua={}|cat={}|accept={}|enc={}|lang={}",
        headers.user_agent.unwrap_or_default(),
        ua_category,
        headers.accept.unwrap_or_default(),
        headers.accept_encoding.unwrap_or_default(),
        headers.accept_language.unwrap_or_default(),
    );
    blake3::hash(canonical.as_bytes()).to_hex().to_string()
}

/// Sliding-window rate limiter with burst protection, a temporary
/// blacklist, and header-fingerprint anomaly detection. One instance is
/// shared across the process; clients are keyed by remote IP (or any other
/// opaque string identity the caller chooses).
pub struct RateLimiter {
    config: RateLimitConfig,
    whitelist: HashSet<String>,
    inner: Mutex<Inner>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            whitelist: ["127.0.0.1", "localhost", "::1"]
                .into_iter()
                .map(String::from)
                .collect(),
            inner: Mutex::new(Inner {
                clients: IndexMap::with_hasher(RandomState::new()),
                stats: RateLimiterStats::default(),
                last_cleanup: Instant::now(),
            }),
        }
    }

    pub async fn is_allowed(
        &self,
        client_id: &str,
        endpoint: &str,
        headers: FingerprintHeaders<'_>,
    ) -> Result<(), Denied> {
        if self.whitelist.contains(client_id) {
            return Ok(());
        }

        let mut inner = self.inner.lock().await;

        if inner.last_cleanup.elapsed() > self.config.cleanup_interval {
            Self::cleanup(&mut inner);
        }

        if inner.clients.len() > MAX_TRACKED_CLIENTS {
            for _ in 0..EVICTION_BATCH {
                if inner.clients.shift_remove_index(0).is_none() {
                    break;
                }
            }
        }

        let now = Instant::now();

        if !inner.clients.contains_key(client_id) {
            inner
                .clients
                .insert(client_id.to_string(), ClientState::new());
        }
        let state = inner.clients.get_mut(client_id).expect("just inserted");

        if let Some(until) = state.blacklisted_until {
            if now < until {
                inner.stats.blocked_requests += 1;
                return Err(Denied {
                    retry_after_seconds: (until - now).as_secs().max(1),
                    reason: DenyReason::Blacklisted,
                });
            }
            state.blacklisted_until = None;
        }

        if headers.user_agent.is_some() {
            let fp = fingerprint(headers);
            state.fingerprints.insert(fp);
            if state.fingerprints.len() > MAX_FINGERPRINTS_PER_CLIENT {
                state.blacklisted_until = Some(now + Duration::from_secs(300));
                inner.stats.blocked_requests += 1;
                inner.stats.blacklisted_events += 1;
                return Err(Denied {
                    retry_after_seconds: 300,
                    reason: DenyReason::SuspiciousFingerprints,
                });
            }
        }

        while matches!(state.requests.front(), Some(t) if now.duration_since(*t) > SLIDING_WINDOW)
        {
            state.requests.pop_front();
        }

        let limit = endpoint_limit(endpoint, self.config.requests_per_minute);
        if state.requests.len() >= limit as usize {
            state.blacklisted_until = Some(now + Duration::from_secs(60));
            inner.stats.blocked_requests += 1;
            inner.stats.blacklisted_events += 1;
            return Err(Denied {
                retry_after_seconds: 60,
                reason: DenyReason::RateLimitExceeded,
            });
        }

        let recent = state
            .requests
            .iter()
            .filter(|t| now.duration_since(**t) <= BURST_WINDOW)
            .count();
        if recent >= self.config.burst_size as usize {
            state.blacklisted_until = Some(now + Duration::from_secs(30));
            inner.stats.blocked_requests += 1;
            inner.stats.blacklisted_events += 1;
            return Err(Denied {
                retry_after_seconds: 30,
                reason: DenyReason::BurstLimitExceeded,
            });
        }

        state.requests.push_back(now);
        inner.stats.total_requests += 1;
        Ok(())
    }

    fn cleanup(inner: &mut Inner) {
        let now = Instant::now();
        inner.clients.retain(|_, state| {
            state
                .requests
                .back()
                .map(|t| now.duration_since(*t) < STALE_AFTER)
                .unwrap_or(false)
                || state.blacklisted_until.is_some_and(|until| until > now)
        });
        inner.last_cleanup = now;
    }

    pub async fn reset_client(&self, client_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.clients.shift_remove(client_id);
    }

    pub async fn remaining_quota(&self, client_id: &str) -> (u32, u32) {
        let inner = self.inner.lock().await;
        let Some(state) = inner.clients.get(client_id) else {
            return (self.config.requests_per_minute, self.config.burst_size);
        };
        let now = Instant::now();
        let valid = state
            .requests
            .iter()
            .filter(|t| now.duration_since(**t) <= SLIDING_WINDOW)
            .count();
        let recent = state
            .requests
            .iter()
            .filter(|t| now.duration_since(**t) <= BURST_WINDOW)
            .count();
        (
            self.config.requests_per_minute.saturating_sub(valid as u32),
            self.config.burst_size.saturating_sub(recent as u32),
        )
    }

    pub async fn stats(&self) -> RateLimiterSnapshot {
        let inner = self.inner.lock().await;
        RateLimiterSnapshot {
            total_requests: inner.stats.total_requests,
            blocked_requests: inner.stats.blocked_requests,
            active_clients: inner.clients.len(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, ToSchema)]
pub struct RateLimiterSnapshot {
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub active_clients: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(rpm: u32, burst: u32) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_minute: rpm,
            burst_size: burst,
            cleanup_interval: Duration::from_secs(300),
        }
    }

    #[tokio::test]
    async fn allows_requests_under_limit() {
        let limiter = RateLimiter::new(config(60, 10));
        for _ in 0..5 {
            assert!(
                limiter
                    .is_allowed("1.2.3.4", "/x", FingerprintHeaders::default())
                    .await
                    .is_ok()
            );
        }
    }

    #[tokio::test]
    async fn blocks_after_per_minute_limit() {
        let limiter = RateLimiter::new(config(3, 100));
        for _ in 0..3 {
            limiter
                .is_allowed("1.2.3.4", "/x", FingerprintHeaders::default())
                .await
                .unwrap();
        }
        let err = limiter
            .is_allowed("1.2.3.4", "/x", FingerprintHeaders::default())
            .await
            .unwrap_err();
        assert_eq!(err.reason, DenyReason::RateLimitExceeded);
    }

    #[tokio::test]
    async fn blocks_after_burst_limit() {
        let limiter = RateLimiter::new(config(1000, 2));
        limiter
            .is_allowed("1.2.3.4", "/x", FingerprintHeaders::default())
            .await
            .unwrap();
        limiter
            .is_allowed("1.2.3.4", "/x", FingerprintHeaders::default())
            .await
            .unwrap();
        let err = limiter
            .is_allowed("1.2.3.4", "/x", FingerprintHeaders::default())
            .await
            .unwrap_err();
        assert_eq!(err.reason, DenyReason::BurstLimitExceeded);
    }

    #[tokio::test]
    async fn whitelisted_client_always_allowed() {
        let limiter = RateLimiter::new(config(1, 1));
        for _ in 0..5 {
            assert!(
                limiter
                    .is_allowed("127.0.0.1", "/x", FingerprintHeaders::default())
                    .await
                    .is_ok()
            );
        }
    }

    #[tokio::test]
    async fn endpoint_override_applies_stricter_limit() {
        let limiter = RateLimiter::new(config(1000, 1000));
        for _ in 0..30 {
            limiter
                .is_allowed("1.2.3.4", "/api/chat", FingerprintHeaders::default())
                .await
                .unwrap();
        }
        let err = limiter
            .is_allowed("1.2.3.4", "/api/chat", FingerprintHeaders::default())
            .await
            .unwrap_err();
        assert_eq!(err.reason, DenyReason::RateLimitExceeded);
    }

    #[tokio::test]
    async fn distinct_clients_tracked_independently() {
        let limiter = RateLimiter::new(config(1, 100));
        limiter
            .is_allowed("a", "/x", FingerprintHeaders::default())
            .await
            .unwrap();
        assert!(
            limiter
                .is_allowed("b", "/x", FingerprintHeaders::default())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn reset_client_clears_tracked_state() {
        let limiter = RateLimiter::new(config(1, 100));
        limiter
            .is_allowed("a", "/x", FingerprintHeaders::default())
            .await
            .unwrap();
        limiter.reset_client("a").await;
        assert!(
            limiter
                .is_allowed("a", "/x", FingerprintHeaders::default())
                .await
                .is_ok()
        );
    }
}
