//! Session Registry: live logical sessions, their config, and their
//! cumulative history/metrics.
//!
//! Grounded on the DashMap-keyed registry idiom in `stream::stream_manager`,
//! generalized from "one WebTransport connection per user_id" to "one
//! logical chat session per opaque session id".

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use salvo::oapi::ToSchema;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub project_id: String,
    pub model: String,
    pub temperature: f64,
    pub system_prompt: Option<String>,
    pub tool_allow_list: Option<Vec<String>>,
    pub permission_mode: String,
    pub cwd: Option<String>,
    pub max_turns: Option<u32>,
    pub neo4j_enabled: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            project_id: "default".into(),
            model: "claude-3-5-sonnet-20241022".into(),
            temperature: 0.7,
            system_prompt: None,
            tool_allow_list: None,
            permission_mode: "default".into(),
            cwd: None,
            max_turns: None,
            neo4j_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionHistory {
    pub message_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionMetrics {
    pub connection_errors: u64,
    pub last_error_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// A live session record. Cheaply cloned (`Arc`-backed) so the pipeline and
/// a concurrent WebSocket command handler can both hold a reference.
pub struct SessionEntry {
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub config: Mutex<SessionConfig>,
    pub history: Mutex<SessionHistory>,
    pub metrics: Mutex<SessionMetrics>,
    /// Serializes turns on this session: a second `query` waits for the
    /// first to reach COMMIT or a terminal error before starting.
    pub turn_lock: Mutex<()>,
    /// Signaled by a WebSocket `interrupt` command; observed by the Turn
    /// Pipeline's STREAM loop at its next suspension point.
    pub interrupt: Arc<Notify>,
    pub last_activity: Mutex<Instant>,
}

impl SessionEntry {
    fn new(config: SessionConfig) -> Self {
        Self {
            created_at: chrono::Utc::now(),
            config: Mutex::new(config),
            history: Mutex::new(SessionHistory::default()),
            metrics: Mutex::new(SessionMetrics::default()),
            turn_lock: Mutex::new(()),
            interrupt: Arc::new(Notify::new()),
            last_activity: Mutex::new(Instant::now()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryFull;

pub struct SessionRegistry {
    sessions: DashMap<String, Arc<SessionEntry>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_sessions,
        }
    }

    /// Registers a new session id with the given config. Rejects when the
    /// registry is already at `max_sessions`. A no-op (success) if the
    /// session already exists.
    pub fn register(
        &self,
        session_id: &str,
        config: SessionConfig,
    ) -> Result<Arc<SessionEntry>, RegistryFull> {
        if let Some(existing) = self.sessions.get(session_id) {
            return Ok(Arc::clone(&existing));
        }
        if self.sessions.len() >= self.max_sessions {
            return Err(RegistryFull);
        }
        let entry = Arc::new(SessionEntry::new(config));
        self.sessions
            .insert(session_id.to_string(), Arc::clone(&entry));
        Ok(entry)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.get(session_id).map(|e| Arc::clone(&e))
    }

    pub fn unregister(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub async fn touch(&self, session_id: &str) {
        if let Some(entry) = self.sessions.get(session_id) {
            *entry.last_activity.lock().await = Instant::now();
        }
    }

    pub async fn update_history(
        &self,
        session_id: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: f64,
    ) {
        if let Some(entry) = self.sessions.get(session_id) {
            let mut history = entry.history.lock().await;
            history.message_count += 1;
            history.input_tokens += input_tokens;
            history.output_tokens += output_tokens;
            history.cost_usd += cost_usd;
        }
    }

    pub async fn record_error(&self, session_id: &str) {
        if let Some(entry) = self.sessions.get(session_id) {
            let mut metrics = entry.metrics.lock().await;
            metrics.connection_errors += 1;
            metrics.last_error_at = Some(chrono::Utc::now());
        }
    }

    pub async fn get_metrics(
        &self,
        session_id: &str,
    ) -> Option<(SessionHistory, SessionMetrics)> {
        let entry = self.sessions.get(session_id)?;
        let history = entry.history.lock().await.clone();
        let metrics = entry.metrics.lock().await.clone();
        Some((history, metrics))
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        let entries: Vec<_> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        let mut summaries = Vec::with_capacity(entries.len());
        for (session_id, entry) in entries {
            let project_id = entry.config.lock().await.project_id.clone();
            let messages_count = entry.history.lock().await.message_count;
            summaries.push(SessionSummary {
                session_id,
                project_id,
                created_at: entry.created_at,
                messages_count,
            });
        }
        summaries
    }

    pub fn health_report(&self) -> SessionRegistryHealth {
        SessionRegistryHealth {
            active_sessions: self.sessions.len(),
            max_sessions: self.max_sessions,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SessionRegistryHealth {
    pub active_sessions: usize,
    pub max_sessions: usize,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SessionSummary {
    pub session_id: String,
    pub project_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub messages_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_rejects_past_capacity() {
        let registry = SessionRegistry::new(1);
        assert!(registry.register("a", SessionConfig::default()).is_ok());
        assert_eq!(
            registry.register("b", SessionConfig::default()),
            Err(RegistryFull)
        );
    }

    #[test]
    fn register_is_idempotent_for_existing_session() {
        let registry = SessionRegistry::new(1);
        let first = registry.register("a", SessionConfig::default()).unwrap();
        let second = registry.register("a", SessionConfig::default()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn history_is_monotonically_non_decreasing() {
        let registry = SessionRegistry::new(10);
        registry.register("a", SessionConfig::default()).unwrap();
        registry.update_history("a", 10, 20, 0.01).await;
        registry.update_history("a", 5, 5, 0.005).await;
        let (history, _) = registry.get_metrics("a").await.unwrap();
        assert_eq!(history.message_count, 2);
        assert_eq!(history.input_tokens, 15);
        assert_eq!(history.output_tokens, 25);
    }
}
