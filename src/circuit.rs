//! Circuit breaker: protects the gateway from cascading upstream failures.
//!
//! Grounded on `original_source/core/circuit_breaker.py`'s `CircuitBreaker`
//! and `CircuitBreakerManager`, re-rendered in the idiom of
//! `examples/Wandalen-api_llm/api/xai/src/circuit_breaker.rs` (the lazy
//! OPEN -> HALF_OPEN transition happens inside the call guard rather than on
//! a timer) but with a `tokio::sync::Mutex` to match this crate's async
//! lock usage elsewhere.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use salvo::oapi::ToSchema;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitOpen {
    pub retry_after_seconds: u64,
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
}

/// A single named circuit breaker. One instance typically guards one
/// upstream dependency (the agent pool, the memory graph store).
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_at: None,
            }),
        }
    }

    /// Checks (and lazily applies) the current state, rejecting the call if
    /// the circuit is open. Call this before attempting the protected
    /// operation; follow with [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure).
    pub async fn is_call_permitted(&self) -> Result<(), CircuitOpen> {
        let mut inner = self.inner.lock().await;
        if inner.state == CircuitState::Open {
            let elapsed = inner
                .last_failure_at
                .map(|t| t.elapsed())
                .unwrap_or_default();
            if elapsed >= self.config.recovery_timeout {
                self.transition(&mut inner, CircuitState::HalfOpen);
            } else {
                let retry_after_seconds =
                    (self.config.recovery_timeout - elapsed).as_secs().max(1);
                return Err(CircuitOpen {
                    retry_after_seconds,
                });
            }
        }
        Ok(())
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.failure_count += 1;
        inner.last_failure_at = Some(Instant::now());

        tracing::warn!(
            circuit = %self.name,
            failures = inner.failure_count,
            threshold = self.config.failure_threshold,
            "circuit breaker recorded a failure"
        );

        match inner.state {
            CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Open),
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn transition(&self, inner: &mut Inner, new_state: CircuitState) {
        if inner.state == new_state {
            return;
        }
        tracing::info!(
            circuit = %self.name,
            from = ?inner.state,
            to = ?new_state,
            "circuit breaker state change"
        );
        inner.state = new_state;
        match new_state {
            CircuitState::Closed | CircuitState::HalfOpen => {
                inner.failure_count = 0;
                inner.success_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        self.transition(&mut inner, CircuitState::Closed);
    }

    pub async fn status(&self) -> CircuitStatus {
        let inner = self.inner.lock().await;
        CircuitStatus {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
        }
    }

    /// Runs `f`, recording the outcome against this breaker. Rejects before
    /// running `f` at all if the circuit is open.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.is_call_permitted()
            .await
            .map_err(CallError::CircuitOpen)?;
        match f().await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(e) => {
                self.record_failure().await;
                Err(CallError::Inner(e))
            }
        }
    }
}

#[derive(Debug)]
pub enum CallError<E> {
    CircuitOpen(CircuitOpen),
    Inner(E),
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CircuitStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
}

/// A registry of named circuit breakers, keyed by the dependency they
/// guard (`"agent"`, `"memory"`, ...).
pub struct CircuitBreakerManager {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitConfig,
}

impl CircuitBreakerManager {
    pub fn new(default_config: CircuitConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(&existing);
        }
        let breaker = Arc::new(CircuitBreaker::new(name, self.default_config));
        self.breakers
            .insert(name.to_string(), Arc::clone(&breaker));
        breaker
    }

    pub async fn all_status(&self) -> Vec<CircuitStatus> {
        let breakers: Vec<_> = self
            .breakers
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        let mut statuses = Vec::with_capacity(breakers.len());
        for breaker in breakers {
            statuses.push(breaker.status().await);
        }
        statuses
    }

    pub async fn reset_all(&self) {
        let breakers: Vec<_> = self
            .breakers
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        for breaker in breakers {
            breaker.reset().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> CircuitConfig {
        CircuitConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_millis(20),
            success_threshold: 2,
        }
    }

    #[tokio::test]
    async fn opens_after_failure_threshold() {
        let breaker = CircuitBreaker::new("test", test_config());
        breaker.record_failure().await;
        assert_eq!(breaker.status().await.state, CircuitState::Closed);
        breaker.record_failure().await;
        assert_eq!(breaker.status().await.state, CircuitState::Open);
        assert!(breaker.is_call_permitted().await.is_err());
    }

    #[tokio::test]
    async fn half_opens_after_recovery_timeout() {
        let breaker = CircuitBreaker::new("test", test_config());
        breaker.record_failure().await;
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(breaker.is_call_permitted().await.is_ok());
        assert_eq!(breaker.status().await.state, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_circuit() {
        let breaker = CircuitBreaker::new("test", test_config());
        breaker.record_failure().await;
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        breaker.is_call_permitted().await.unwrap();
        breaker.record_failure().await;
        assert_eq!(breaker.status().await.state, CircuitState::Open);
    }

    #[tokio::test]
    async fn half_open_closes_after_success_threshold() {
        let breaker = CircuitBreaker::new("test", test_config());
        breaker.record_failure().await;
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        breaker.is_call_permitted().await.unwrap();
        breaker.record_success().await;
        assert_eq!(breaker.status().await.state, CircuitState::HalfOpen);
        breaker.record_success().await;
        assert_eq!(breaker.status().await.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn manager_returns_same_breaker_for_same_name() {
        let manager = CircuitBreakerManager::new(test_config());
        let a = manager.get_or_create("agent");
        let b = manager.get_or_create("agent");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn call_short_circuits_when_open() {
        let breaker = CircuitBreaker::new("test", test_config());
        breaker.record_failure().await;
        breaker.record_failure().await;
        let result: Result<(), CallError<&str>> =
            breaker.call(|| async { Err("boom") }).await;
        assert!(matches!(result, Err(CallError::CircuitOpen(_))));
    }
}
