//! Health & Metrics: a single aggregate snapshot of every resilience
//! component, served at `GET /health`.
//!
//! Grounded on `original_source/routes/health.py`'s health endpoint, which
//! assembles per-subsystem status (pool, sessions, cache, rate limiter,
//! circuit breakers, memory store) into one response rather than exposing
//! each subsystem's own probe separately.

use std::sync::Arc;
use std::time::Instant;

use salvo::oapi::ToSchema;
use serde::Serialize;

use crate::cache::{Cache, CacheStats};
use crate::circuit::{CircuitBreakerManager, CircuitStatus};
use crate::errors::{ClassifierSnapshot, ClassifierStats};
use crate::memory::MemoryIntegration;
use crate::pool::Pool;
use crate::rate_limit::{RateLimiter, RateLimiterSnapshot};
use crate::session::{SessionRegistry, SessionRegistryHealth};

mod handler;
pub use handler::health;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthReport {
    pub status: Status,
    pub uptime_seconds: u64,
    pub pool_size: usize,
    pub sessions: SessionRegistryHealth,
    pub cache: CacheStats,
    pub rate_limiter: RateLimiterSnapshot,
    pub circuits: Vec<CircuitStatus>,
    pub memory_enabled: bool,
    pub errors: ClassifierSnapshot,
}

/// Pulls a point-in-time snapshot from every resilience component. Cheap to
/// clone; constructed once at startup and shared via `AppState`.
pub struct HealthAggregator {
    pool: Arc<Pool>,
    sessions: Arc<SessionRegistry>,
    cache: Arc<Cache>,
    rate_limiter: Arc<RateLimiter>,
    circuits: Arc<CircuitBreakerManager>,
    memory: Arc<MemoryIntegration>,
    error_stats: Arc<ClassifierStats>,
    started_at: Instant,
}

impl HealthAggregator {
    pub fn new(
        pool: Arc<Pool>,
        sessions: Arc<SessionRegistry>,
        cache: Arc<Cache>,
        rate_limiter: Arc<RateLimiter>,
        circuits: Arc<CircuitBreakerManager>,
        memory: Arc<MemoryIntegration>,
        error_stats: Arc<ClassifierStats>,
        started_at: Instant,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            sessions,
            cache,
            rate_limiter,
            circuits,
            memory,
            error_stats,
            started_at,
        })
    }

    /// Any circuit stuck open, or the session registry sitting at capacity,
    /// downgrades the aggregate status; nothing here is ever fatal to the
    /// process itself.
    pub async fn report(&self) -> HealthReport {
        let sessions = self.sessions.health_report();
        let circuits = self.circuits.all_status().await;
        let rate_limiter = self.rate_limiter.stats().await;
        let cache = self.cache.stats();
        let pool_size = self.pool.size().await;
        let errors = self.error_stats.snapshot().await;

        let any_circuit_open = circuits
            .iter()
            .any(|c| c.state == crate::circuit::CircuitState::Open);
        let sessions_full = sessions.active_sessions >= sessions.max_sessions;

        let status = if any_circuit_open {
            Status::Degraded
        } else if sessions_full {
            Status::Degraded
        } else {
            Status::Healthy
        };

        HealthReport {
            status,
            uptime_seconds: self.started_at.elapsed().as_secs(),
            pool_size,
            sessions,
            cache,
            rate_limiter,
            circuits,
            memory_enabled: self.memory.enabled(),
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::agent::scripted::ScriptedAgentFactory;
    use crate::circuit::CircuitConfig;
    use crate::config::{Neo4jConfig, PoolConfig};
    use crate::rate_limit::RateLimitConfig;

    use super::*;

    #[tokio::test]
    async fn reports_healthy_with_no_open_circuits() {
        let error_stats = ClassifierStats::new();
        let pool = Pool::new(
            Arc::new(ScriptedAgentFactory(|| Vec::new())),
            PoolConfig {
                max_size: 5,
                min_size: 0,
                max_age_minutes: 60,
                max_uses: 100,
                health_interval_s: 300,
            },
            Arc::clone(&error_stats),
        );
        let sessions = Arc::new(SessionRegistry::new(10));
        let cache = Cache::new(10, Duration::from_secs(60), 1024);
        let memory = Arc::new(MemoryIntegration::connect(&Neo4jConfig::default(), Arc::clone(&cache)).await);
        let rate_limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            requests_per_minute: 60,
            burst_size: 10,
            cleanup_interval: Duration::from_secs(300),
        }));
        let circuits = Arc::new(CircuitBreakerManager::new(CircuitConfig {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
        }));

        let aggregator = HealthAggregator::new(
            pool, sessions, cache, rate_limiter, circuits, memory, error_stats, Instant::now(),
        );
        let report = aggregator.report().await;
        assert_eq!(report.status, Status::Healthy);
        assert!(!report.memory_enabled);
    }

    #[tokio::test]
    async fn open_circuit_degrades_status() {
        let error_stats = ClassifierStats::new();
        let pool = Pool::new(
            Arc::new(ScriptedAgentFactory(|| Vec::new())),
            PoolConfig {
                max_size: 5,
                min_size: 0,
                max_age_minutes: 60,
                max_uses: 100,
                health_interval_s: 300,
            },
            Arc::clone(&error_stats),
        );
        let sessions = Arc::new(SessionRegistry::new(10));
        let cache = Cache::new(10, Duration::from_secs(60), 1024);
        let memory = Arc::new(MemoryIntegration::connect(&Neo4jConfig::default(), Arc::clone(&cache)).await);
        let rate_limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            requests_per_minute: 60,
            burst_size: 10,
            cleanup_interval: Duration::from_secs(300),
        }));
        let circuits = Arc::new(CircuitBreakerManager::new(CircuitConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
        }));
        circuits.get_or_create("agent").record_failure().await;

        let aggregator = HealthAggregator::new(
            pool, sessions, cache, rate_limiter, circuits, memory, error_stats, Instant::now(),
        );
        let report = aggregator.report().await;
        assert_eq!(report.status, Status::Degraded);
    }
}
