//! Upstream Agent Connection contract.
//!
//! The gateway never speaks to the upstream LLM agent process directly; it
//! speaks to this trait. The Pool owns instances of it, the Turn Pipeline
//! drives it through the Circuit Breaker, and tests substitute
//! [`ScriptedAgent`] for the real process actor.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("agent protocol error: {0}")]
    Protocol(String),
    #[error("disconnect failed: {0}")]
    Disconnect(String),
}

/// One event in the stream produced by [`AgentConnection::receive_response`].
///
/// `AssistantText`/`ToolUse`/`ToolResult` payloads are already coerced to
/// canonical string shapes by the driver binding — the duck-typed
/// `msg.content` blocks of the upstream's wire format never leak past here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AgentEvent {
    AssistantText(String),
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
    Result {
        input_tokens: Option<u64>,
        output_tokens: Option<u64>,
        total_cost: Option<f64>,
    },
}

/// An owned, independently-usable handle that cancels whatever query is
/// in flight on the connection it was cut from.
///
/// `receive_response` borrows `&mut self` for the lifetime of its returned
/// stream, so nothing else can call back into the connection while that
/// stream is alive. A handle is obtained before the stream is created and
/// carries its own path to the connection's control channel, so the Turn
/// Pipeline's STREAM loop can still interrupt mid-iteration.
#[async_trait]
pub trait InterruptHandle: Send + Sync {
    async fn interrupt(&self) -> Result<(), AgentError>;
}

/// A single connection to the upstream agent process.
///
/// Implementors are not required to be `Clone`; the Pool hands out exclusive
/// ownership of one connection per checkout (see `crate::pool`).
#[async_trait]
pub trait AgentConnection: Send + Sync {
    /// Establishes the underlying connection. Bounded by a 20s caller-side
    /// deadline (see `crate::pool`'s use of it).
    async fn connect(&mut self) -> Result<(), AgentError>;

    /// Enqueues one user turn. Does not itself return the response; call
    /// `receive_response` afterwards.
    async fn query(
        &mut self,
        prompt: &str,
        session_id: &str,
    ) -> Result<(), AgentError>;

    /// Streams the events produced by the most recent `query`, terminated by
    /// exactly one `AgentEvent::Result`.
    fn receive_response(
        &mut self,
    ) -> BoxStream<'_, Result<AgentEvent, AgentError>>;

    /// Returns a handle that can cancel the in-flight query independently of
    /// `receive_response`'s borrow. Call this before `receive_response`.
    fn interrupt_handle(&self) -> Arc<dyn InterruptHandle>;

    /// Side-effect-free liveness probe used by the Pool's maintenance loop.
    async fn health_check(&mut self) -> bool;

    /// Tears down the connection. A failure here is swallowed by the caller.
    async fn disconnect(&mut self) -> Result<(), AgentError>;
}

/// A factory the Pool uses to create fresh connections on demand.
#[async_trait]
pub trait AgentConnectionFactory: Send + Sync {
    async fn create(
        &self,
    ) -> Result<Box<dyn AgentConnection>, AgentError>;
}

#[cfg(test)]
pub mod scripted {
    //! An in-memory [`AgentConnection`] that replays a fixed event script,
    //! used to drive Turn Pipeline tests without a real upstream process.
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use futures::stream::{self, BoxStream, StreamExt};

    use super::{AgentConnection, AgentConnectionFactory, AgentError, AgentEvent, InterruptHandle};

    pub struct ScriptedAgent {
        script: VecDeque<AgentEvent>,
        healthy: bool,
        interrupted: Arc<AtomicBool>,
        pub queried: Vec<(String, String)>,
    }

    impl ScriptedAgent {
        pub fn new(script: Vec<AgentEvent>) -> Self {
            Self {
                script: script.into(),
                healthy: true,
                interrupted: Arc::new(AtomicBool::new(false)),
                queried: Vec::new(),
            }
        }

        pub fn unhealthy(mut self) -> Self {
            self.healthy = false;
            self
        }

        pub fn was_interrupted(&self) -> bool {
            self.interrupted.load(Ordering::SeqCst)
        }
    }

    struct ScriptedInterruptHandle {
        interrupted: Arc<AtomicBool>,
    }

    #[async_trait]
    impl InterruptHandle for ScriptedInterruptHandle {
        async fn interrupt(&self) -> Result<(), AgentError> {
            self.interrupted.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl AgentConnection for ScriptedAgent {
        async fn connect(&mut self) -> Result<(), AgentError> {
            Ok(())
        }

        async fn query(
            &mut self,
            prompt: &str,
            session_id: &str,
        ) -> Result<(), AgentError> {
            self.queried.push((prompt.to_string(), session_id.to_string()));
            Ok(())
        }

        fn receive_response(
            &mut self,
        ) -> BoxStream<'_, Result<AgentEvent, AgentError>> {
            let events: Vec<_> =
                self.script.drain(..).map(Ok).collect();
            stream::iter(events).boxed()
        }

        fn interrupt_handle(&self) -> Arc<dyn InterruptHandle> {
            Arc::new(ScriptedInterruptHandle {
                interrupted: Arc::clone(&self.interrupted),
            })
        }

        async fn health_check(&mut self) -> bool {
            self.healthy
        }

        async fn disconnect(&mut self) -> Result<(), AgentError> {
            Ok(())
        }
    }

    pub struct ScriptedAgentFactory<F>(pub F)
    where
        F: Fn() -> Vec<AgentEvent> + Send + Sync;

    #[async_trait]
    impl<F> AgentConnectionFactory for ScriptedAgentFactory<F>
    where
        F: Fn() -> Vec<AgentEvent> + Send + Sync,
    {
        async fn create(
            &self,
        ) -> Result<Box<dyn AgentConnection>, AgentError> {
            Ok(Box::new(ScriptedAgent::new((self.0)())))
        }
    }

    mod tests {
        use super::*;

        #[tokio::test]
        async fn interrupt_handle_is_independent_of_receive_response_borrow() {
            let mut agent = ScriptedAgent::new(vec![AgentEvent::Result {
                input_tokens: None,
                output_tokens: None,
                total_cost: None,
            }]);

            let handle = agent.interrupt_handle();
            let stream = agent.receive_response();

            // `handle` holds no borrow of `agent`, so it can be invoked while
            // `stream` still holds the only live `&mut` borrow.
            handle.interrupt().await.unwrap();
            drop(stream);

            assert!(agent.was_interrupted());
        }
    }
}
