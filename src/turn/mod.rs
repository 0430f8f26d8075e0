//! Turn Pipeline: the per-turn state machine.
//!
//! Grounded on `original_source/core/claude_handler.py`'s `send_message`
//! async generator: ENSURE_SESSION -> ENRICH -> EMIT_PROCESSING -> DISPATCH
//! -> STREAM -> COMMIT -> RELEASE, the event coercion rules for
//! AssistantText/ToolUse/ToolResult payloads, and the history/metrics
//! bookkeeping on the terminal `Result` event. The explicit-state,
//! no-decorator-wrapping shape follows the design notes carried into
//! SPEC_FULL §9.
//!
//! A connection is acquired fresh from the pool for every turn rather than
//! pinned to a session: `AgentConnection::query` already takes the session
//! id, so the upstream multiplexes by id and any pool connection is
//! interchangeable. This matches `crate::pool`, which has no per-session
//! affinity hooks.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::agent::AgentEvent;
use crate::circuit::{CallError, CircuitBreakerManager};
use crate::errors::{classify, ClassifierStats};
use crate::memory::MemoryIntegration;
use crate::pool::Pool;
use crate::session::{SessionConfig, SessionRegistry};

/// One event emitted to the transport layer over the course of a turn.
/// Serializes to the shapes required by SPEC_FULL §6; the transport layer
/// wraps this with `session_created`/`done`/`heartbeat` framing (see
/// `crate::transport`).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    Processing {
        session_id: String,
    },
    Content {
        content: String,
        session_id: String,
    },
    ToolUse {
        name: String,
        id: String,
        session_id: String,
    },
    ToolResult {
        tool_id: String,
        content: String,
        session_id: String,
    },
    Result {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        input_tokens: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        output_tokens: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cost_usd: Option<f64>,
    },
    Error {
        error: String,
        session_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl TurnEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnEvent::Result { .. } | TurnEvent::Error { .. })
    }
}

/// Splits `text` into chunks of `words_per_chunk` whitespace-joined words,
/// each with a trailing space, preserving arrival order. Used to fan
/// AssistantText payloads out as small `content` events rather than one
/// event per raw chunk from the upstream.
fn word_chunks(text: &str, words_per_chunk: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return Vec::new();
    }
    words
        .chunks(words_per_chunk.max(1))
        .map(|chunk| format!("{} ", chunk.join(" ")))
        .collect()
}

/// Coerces a possibly list-shaped JSON payload to a single string, joining
/// array members with spaces; object/scalar payloads other than strings
/// fall back to their JSON rendering.
pub(crate) fn coerce_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => items
            .iter()
            .map(coerce_to_string)
            .collect::<Vec<_>>()
            .join(" "),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Orchestrates a single user-message turn. One instance is shared process
/// wide; construct once at startup with the composition root.
pub struct Pipeline {
    pool: Arc<Pool>,
    sessions: Arc<SessionRegistry>,
    memory: Arc<MemoryIntegration>,
    circuit: Arc<CircuitBreakerManager>,
    deadline: Duration,
    error_stats: Arc<ClassifierStats>,
}

impl Pipeline {
    pub fn new(
        pool: Arc<Pool>,
        sessions: Arc<SessionRegistry>,
        memory: Arc<MemoryIntegration>,
        circuit: Arc<CircuitBreakerManager>,
        deadline: Duration,
        error_stats: Arc<ClassifierStats>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            sessions,
            memory,
            circuit,
            deadline,
            error_stats,
        })
    }

    /// Classifies a raw failure string, logs it as a structured `tracing`
    /// event, and folds it into the process-wide error stats before it is
    /// turned into a `TurnEvent::Error` for the client.
    async fn classify_and_record(&self, reason: &str) {
        let classified = classify(reason);
        tracing::warn!(
            category = ?classified.category,
            severity = ?classified.severity,
            fingerprint = %classified.fingerprint,
            remediation = ?classified.remediation,
            "turn failed: {reason}"
        );
        self.error_stats.record(&classified).await;
    }

    /// Runs one turn to completion, emitting events on `tx` in arrival
    /// order. Emits exactly one `processing` event followed by exactly one
    /// of {`Result`, `Error`} — unless the receiver is dropped first (client
    /// disconnect), in which case emission simply stops; RELEASE is still
    /// attempted.
    ///
    /// `session_id` is registered here if unknown; the id observed on every
    /// emitted event is always the one passed in, never one the upstream
    /// might report.
    pub async fn run_turn(
        self: Arc<Self>,
        session_id: String,
        config: SessionConfig,
        raw_message: String,
        tx: mpsc::Sender<TurnEvent>,
    ) {
        // ENSURE_SESSION
        let entry = match self.sessions.register(&session_id, config) {
            Ok(entry) => entry,
            Err(_) => {
                let reason = "session registry is full".to_string();
                self.classify_and_record(&reason).await;
                let _ = tx
                    .send(TurnEvent::Error {
                        error: reason,
                        session_id: session_id.clone(),
                        timestamp: chrono::Utc::now(),
                    })
                    .await;
                return;
            }
        };
        self.sessions.touch(&session_id).await;

        // Sessions are single-writer: a second turn on the same session
        // waits here for the first to reach COMMIT or a terminal error.
        let _turn_guard = entry.turn_lock.lock().await;

        // ENRICH
        let context = self
            .memory
            .get_user_context(&session_id, Some(&raw_message))
            .await;
        let prefix = self.memory.format_context_for_prompt(&context);
        let enriched_prompt = format!("{prefix}{raw_message}");

        // EMIT_PROCESSING
        if tx
            .send(TurnEvent::Processing {
                session_id: session_id.clone(),
            })
            .await
            .is_err()
        {
            return;
        }

        // DISPATCH: acquire a connection outside the breaker (PoolExhausted
        // is a distinct failure kind from circuit-open), then run the query
        // itself through the breaker with a wall-clock deadline.
        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                self.sessions.record_error(&session_id).await;
                let reason = format!("connection pool exhausted: {e}");
                self.classify_and_record(&reason).await;
                let _ = tx
                    .send(TurnEvent::Error {
                        error: reason,
                        session_id: session_id.clone(),
                        timestamp: chrono::Utc::now(),
                    })
                    .await;
                return;
            }
        };

        let breaker = self.circuit.get_or_create("agent");
        let deadline = self.deadline;
        let prompt = enriched_prompt.as_str();
        let sid = session_id.as_str();
        let dispatch = breaker
            .call(|| async {
                tokio::time::timeout(deadline, conn.conn_mut().query(prompt, sid))
                    .await
                    .map_err(|_| "upstream dispatch timed out".to_string())
                    .and_then(|r| r.map_err(|e| e.to_string()))
            })
            .await;

        if let Err(err) = dispatch {
            self.sessions.record_error(&session_id).await;
            match err {
                CallError::CircuitOpen(open) => {
                    self.pool.release(conn).await;
                    let reason = format!("circuit open, retry after {}s", open.retry_after_seconds);
                    self.classify_and_record(&reason).await;
                    let _ = tx
                        .send(TurnEvent::Error {
                            error: reason,
                            session_id: session_id.clone(),
                            timestamp: chrono::Utc::now(),
                        })
                        .await;
                }
                CallError::Inner(reason) => {
                    conn.mark_unhealthy();
                    self.pool.discard(conn).await;
                    self.classify_and_record(&reason).await;
                    let _ = tx
                        .send(TurnEvent::Error {
                            error: reason,
                            session_id: session_id.clone(),
                            timestamp: chrono::Utc::now(),
                        })
                        .await;
                }
            }
            return;
        }

        // STREAM
        let mut full_response = String::new();
        let mut input_tokens = None;
        let mut output_tokens = None;
        let mut cost_usd = None;
        let mut stream_error = None;
        let mut client_gone = false;

        {
            let interrupt_handle = conn.conn_mut().interrupt_handle();
            let mut stream = conn.conn_mut().receive_response();
            loop {
                tokio::select! {
                    _ = entry.interrupt.notified() => {
                        if let Err(e) = interrupt_handle.interrupt().await {
                            tracing::debug!(error = %e, "interrupt request failed");
                        }
                    }
                    next = stream.next() => {
                        match next {
                            None => break,
                            Some(Err(e)) => {
                                stream_error = Some(e.to_string());
                                break;
                            }
                            Some(Ok(AgentEvent::AssistantText(text))) => {
                                full_response.push_str(&text);
                                for chunk in word_chunks(&text, 2) {
                                    if tx
                                        .send(TurnEvent::Content {
                                            content: chunk,
                                            session_id: session_id.clone(),
                                        })
                                        .await
                                        .is_err()
                                    {
                                        client_gone = true;
                                        break;
                                    }
                                }
                                if client_gone {
                                    break;
                                }
                            }
                            Some(Ok(AgentEvent::ToolUse { id, name, input: _ })) => {
                                if tx
                                    .send(TurnEvent::ToolUse {
                                        name,
                                        id,
                                        session_id: session_id.clone(),
                                    })
                                    .await
                                    .is_err()
                                {
                                    client_gone = true;
                                    break;
                                }
                            }
                            Some(Ok(AgentEvent::ToolResult { tool_use_id, content })) => {
                                if tx
                                    .send(TurnEvent::ToolResult {
                                        tool_id: tool_use_id,
                                        content,
                                        session_id: session_id.clone(),
                                    })
                                    .await
                                    .is_err()
                                {
                                    client_gone = true;
                                    break;
                                }
                            }
                            Some(Ok(AgentEvent::Result { input_tokens: it, output_tokens: ot, total_cost })) => {
                                input_tokens = it;
                                output_tokens = ot;
                                cost_usd = total_cost;
                                break;
                            }
                        }
                    }
                }
                if client_gone {
                    break;
                }
            }
        }

        if let Some(reason) = stream_error {
            conn.mark_unhealthy();
            self.sessions.record_error(&session_id).await;
            self.pool.discard(conn).await;
            self.classify_and_record(&reason).await;
            if !client_gone {
                let _ = tx
                    .send(TurnEvent::Error {
                        error: reason,
                        session_id: session_id.clone(),
                        timestamp: chrono::Utc::now(),
                    })
                    .await;
            }
            return;
        }

        if client_gone {
            // Cancelled: no terminal event, but RELEASE still happens.
            self.release(conn).await;
            return;
        }

        // emit the single terminal `result` event before COMMIT/RELEASE so
        // the client sees it as soon as possible.
        let cost = cost_usd.unwrap_or(0.0);
        let sent = tx
            .send(TurnEvent::Result {
                session_id: session_id.clone(),
                input_tokens,
                output_tokens,
                cost_usd,
            })
            .await
            .is_ok();

        self.sessions
            .update_history(
                &session_id,
                input_tokens.unwrap_or(0),
                output_tokens.unwrap_or(0),
                cost,
            )
            .await;

        // COMMIT: best-effort, never surfaced to the client.
        if !full_response.is_empty() && self.memory.enabled() {
            self.memory
                .save_interaction(&session_id, &raw_message, &full_response)
                .await;
        }

        // RELEASE
        self.release(conn).await;

        let _ = sent;
    }

    async fn release(&self, conn: crate::pool::PooledConnection) {
        if conn.healthy() {
            self.pool.release(conn).await;
        } else {
            self.pool.discard(conn).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::agent::scripted::ScriptedAgentFactory;
    use crate::cache::Cache;
    use crate::circuit::{CircuitBreakerManager, CircuitConfig};
    use crate::config::{Neo4jConfig, PoolConfig};
    use crate::memory::MemoryIntegration;
    use crate::session::SessionRegistry;

    use super::*;

    async fn test_pipeline(
        script: Vec<AgentEvent>,
    ) -> (Arc<Pipeline>, Arc<SessionRegistry>) {
        let factory = Arc::new(ScriptedAgentFactory(move || script.clone()));
        let pool = Pool::new(
            factory,
            PoolConfig {
                max_size: 5,
                min_size: 0,
                max_age_minutes: 60,
                max_uses: 100,
                health_interval_s: 300,
            },
            crate::errors::ClassifierStats::new(),
        );
        let sessions = Arc::new(SessionRegistry::new(10));
        let cache = Cache::new(100, Duration::from_secs(60), 1024);
        let memory = Arc::new(MemoryIntegration::connect(&Neo4jConfig::default(), cache).await);
        let circuit = Arc::new(CircuitBreakerManager::new(CircuitConfig {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
        }));
        let pipeline = Pipeline::new(
            pool,
            Arc::clone(&sessions),
            memory,
            circuit,
            Duration::from_secs(5),
            crate::errors::ClassifierStats::new(),
        );
        (pipeline, sessions)
    }

    #[tokio::test]
    async fn happy_path_emits_processing_then_content_then_result() {
        let (pipeline, _sessions) = test_pipeline(vec![
            AgentEvent::AssistantText("hi there friend".to_string()),
            AgentEvent::Result {
                input_tokens: Some(3),
                output_tokens: Some(5),
                total_cost: Some(0.002),
            },
        ])
        .await;

        let (tx, mut rx) = mpsc::channel(16);
        pipeline
            .run_turn(
                "s1".to_string(),
                SessionConfig::default(),
                "hello".to_string(),
                tx,
            )
            .await;

        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }

        assert!(matches!(events[0], TurnEvent::Processing { .. }));
        assert!(events.iter().any(|e| matches!(e, TurnEvent::Content { .. })));
        let last = events.last().unwrap();
        assert!(matches!(last, TurnEvent::Result { .. }));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn session_id_on_events_matches_caller_supplied_id() {
        let (pipeline, _sessions) = test_pipeline(vec![AgentEvent::Result {
            input_tokens: Some(1),
            output_tokens: Some(1),
            total_cost: None,
        }])
        .await;

        let (tx, mut rx) = mpsc::channel(16);
        pipeline
            .run_turn(
                "caller-chosen".to_string(),
                SessionConfig::default(),
                "hi".to_string(),
                tx,
            )
            .await;

        while let Some(ev) = rx.recv().await {
            let sid = match &ev {
                TurnEvent::Processing { session_id }
                | TurnEvent::Content { session_id, .. }
                | TurnEvent::ToolUse { session_id, .. }
                | TurnEvent::ToolResult { session_id, .. }
                | TurnEvent::Result { session_id, .. }
                | TurnEvent::Error { session_id, .. } => session_id,
            };
            assert_eq!(sid, "caller-chosen");
        }
    }

    #[tokio::test]
    async fn history_updated_exactly_once_per_successful_turn() {
        let (pipeline, sessions) = test_pipeline(vec![AgentEvent::Result {
            input_tokens: Some(10),
            output_tokens: Some(20),
            total_cost: Some(0.01),
        }])
        .await;

        let (tx, mut rx) = mpsc::channel(16);
        pipeline
            .run_turn(
                "s1".to_string(),
                SessionConfig::default(),
                "hi".to_string(),
                tx,
            )
            .await;
        while rx.recv().await.is_some() {}

        let (history, _) = sessions.get_metrics("s1").await.unwrap();
        assert_eq!(history.message_count, 1);
        assert_eq!(history.input_tokens, 10);
        assert_eq!(history.output_tokens, 20);
    }
}
