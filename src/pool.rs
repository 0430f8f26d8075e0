//! Connection Pool: bounded reuse of upstream agent connections.
//!
//! Generalizes the single-connection-per-user registry in
//! `stream::stream_manager` (see the teacher crate this was adapted from)
//! into a pool of `N` interchangeable upstream agent connections, evicted by
//! age, use-count, and health rather than by user identity.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::agent::{AgentConnection, AgentConnectionFactory, AgentError};
use crate::config::PoolConfig;
use crate::errors::{classify_with_context, ClassifierStats};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("upstream connect failed: {0}")]
    Connect(#[from] AgentError),
    #[error("connection pool exhausted")]
    Exhausted,
}

pub struct PooledConnection {
    id: u64,
    conn: Box<dyn AgentConnection>,
    created_at: Instant,
    last_used_at: Instant,
    use_count: u64,
    healthy: bool,
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn conn_mut(&mut self) -> &mut (dyn AgentConnection + 'static) {
        &mut *self.conn
    }

    pub fn healthy(&self) -> bool {
        self.healthy
    }

    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }
}

struct PoolInner {
    idle: Vec<PooledConnection>,
    checked_out: HashSet<u64>,
    /// Slots reserved for in-flight `connect()` calls, counted toward
    /// `max_size` so concurrent acquires can't overshoot it.
    reserved: usize,
}

pub struct Pool {
    inner: Mutex<PoolInner>,
    factory: Arc<dyn AgentConnectionFactory>,
    next_id: AtomicU64,
    config: PoolConfig,
    error_stats: Arc<ClassifierStats>,
}

impl Pool {
    pub fn new(
        factory: Arc<dyn AgentConnectionFactory>,
        config: PoolConfig,
        error_stats: Arc<ClassifierStats>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PoolInner {
                idle: Vec::new(),
                checked_out: HashSet::new(),
                reserved: 0,
            }),
            factory,
            next_id: AtomicU64::new(1),
            config,
            error_stats,
        })
    }

    fn expired(conn: &PooledConnection, cfg: &PoolConfig) -> bool {
        conn.created_at.elapsed()
            > Duration::from_secs(cfg.max_age_minutes * 60)
            || conn.use_count > cfg.max_uses
            || !conn.healthy
    }

    /// Returns a healthy idle connection if one exists; otherwise creates a
    /// new one provided the pool has room. A `connect` failure propagates to
    /// the caller.
    pub async fn acquire(&self) -> Result<PooledConnection, PoolError> {
        {
            let mut inner = self.inner.lock().await;
            if let Some(pos) = inner
                .idle
                .iter()
                .position(|c| !Self::expired(c, &self.config))
            {
                let mut c = inner.idle.remove(pos);
                c.last_used_at = Instant::now();
                c.use_count += 1;
                inner.checked_out.insert(c.id);
                return Ok(c);
            }
            let size =
                inner.idle.len() + inner.checked_out.len() + inner.reserved;
            if size >= self.config.max_size {
                return Err(PoolError::Exhausted);
            }
            inner.reserved += 1;
        }

        let result = self.connect_new().await;

        let mut inner = self.inner.lock().await;
        inner.reserved -= 1;
        match result {
            Ok(mut conn) => {
                inner.checked_out.insert(conn.id);
                conn.use_count = 1;
                Ok(conn)
            }
            Err(e) => Err(e),
        }
    }

    async fn connect_new(&self) -> Result<PooledConnection, PoolError> {
        let mut conn = self.factory.create().await?;
        conn.connect().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(PooledConnection {
            id,
            conn,
            created_at: Instant::now(),
            last_used_at: Instant::now(),
            use_count: 0,
            healthy: true,
        })
    }

    /// Returns a connection to the idle set if it's still healthy and room
    /// remains; otherwise disconnects and discards it. Double-release is
    /// detected and logged rather than double-inserted.
    pub async fn release(&self, mut conn: PooledConnection) {
        conn.last_used_at = Instant::now();
        let mut inner = self.inner.lock().await;
        if !inner.checked_out.remove(&conn.id) {
            tracing::warn!(
                connection_id = conn.id,
                "double release of pooled connection ignored"
            );
            return;
        }
        let discard = inner.idle.len() >= self.config.max_size
            || Self::expired(&conn, &self.config);
        if discard {
            drop(inner);
            if let Err(e) = conn.conn.disconnect().await {
                tracing::debug!(error = %e, "discarding connection after failed disconnect");
            }
        } else {
            inner.idle.push(conn);
        }
    }

    /// Explicitly discards a connection regardless of health (used by the
    /// Turn Pipeline's RELEASE step when it already knows the connection is
    /// unhealthy).
    pub async fn discard(&self, mut conn: PooledConnection) {
        {
            let mut inner = self.inner.lock().await;
            if !inner.checked_out.remove(&conn.id) {
                tracing::warn!(
                    connection_id = conn.id,
                    "double release (discard) of pooled connection ignored"
                );
                return;
            }
        }
        if let Err(e) = conn.conn.disconnect().await {
            tracing::debug!(error = %e, "error disconnecting discarded connection");
        }
    }

    pub async fn size(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.idle.len() + inner.checked_out.len()
    }

    /// Spawns the background maintenance task; call once at startup.
    pub fn spawn_maintenance(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(
                pool.config.health_interval_s.max(1),
            ));
            loop {
                ticker.tick().await;
                pool.maintain().await;
            }
        });
    }

    async fn maintain(&self) {
        let mut inner = self.inner.lock().await;
        let cfg = &self.config;
        let before = inner.idle.len();
        inner.idle.retain(|c| !Self::expired(c, cfg));
        let aged_out = before - inner.idle.len();

        for c in inner.idle.iter_mut() {
            c.healthy = c.conn.health_check().await;
            if !c.healthy {
                let classified = classify_with_context(
                    &format!("connection {} failed liveness probe", c.id),
                    Some("health-check"),
                );
                tracing::debug!(
                    connection_id = c.id,
                    category = ?classified.category,
                    severity = ?classified.severity,
                    "pool connection failed health check"
                );
                self.error_stats.record(&classified).await;
            }
        }
        let before_probe = inner.idle.len();
        inner.idle.retain(|c| c.healthy);
        let probe_failed = before_probe - inner.idle.len();

        if aged_out > 0 || probe_failed > 0 {
            tracing::info!(
                aged_out,
                probe_failed,
                remaining = inner.idle.len(),
                "pool maintenance pass complete"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::scripted::{ScriptedAgent, ScriptedAgentFactory};
    use crate::config::PoolConfig;

    fn small_pool(max_size: usize) -> Arc<Pool> {
        let factory = Arc::new(ScriptedAgentFactory(|| Vec::new()));
        Pool::new(
            factory,
            PoolConfig {
                max_size,
                min_size: 0,
                max_age_minutes: 60,
                max_uses: 100,
                health_interval_s: 300,
            },
            crate::errors::ClassifierStats::new(),
        )
    }

    #[tokio::test]
    async fn acquire_creates_then_reuses() {
        let pool = small_pool(10);
        let conn = pool.acquire().await.unwrap();
        let id = conn.id();
        pool.release(conn).await;
        let conn2 = pool.acquire().await.unwrap();
        assert_eq!(conn2.id(), id, "released connection should be reused");
        pool.release(conn2).await;
    }

    #[tokio::test]
    async fn acquire_respects_max_size() {
        let pool = small_pool(1);
        let conn = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted));
        pool.release(conn).await;
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn unhealthy_connection_is_discarded_not_reused() {
        let pool = small_pool(10);
        let mut conn = pool.acquire().await.unwrap();
        conn.mark_unhealthy();
        let id = conn.id();
        pool.release(conn).await;
        let conn2 = pool.acquire().await.unwrap();
        assert_ne!(conn2.id(), id, "unhealthy connection must not be handed out");
    }

    #[tokio::test]
    async fn released_connection_is_tracked_exactly_once() {
        let pool = small_pool(10);
        let conn = pool.acquire().await.unwrap();
        let id = conn.id();
        pool.release(conn).await;

        let inner = pool.inner.lock().await;
        assert!(!inner.checked_out.contains(&id));
        assert_eq!(inner.idle.iter().filter(|c| c.id == id).count(), 1);
    }
}
