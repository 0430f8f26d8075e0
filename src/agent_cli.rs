//! Subprocess-backed [`AgentConnection`]: the real upstream, as opposed to
//! the `#[cfg(test)]` [`crate::agent::scripted`] double.
//!
//! Grounded on `original_source/core/claude_handler.py`'s `ClaudeSDKClient`,
//! which spawns the upstream CLI once per pooled connection and drives it
//! with `ClaudeAgentOptions` (`model`/`permission_mode`), then reads a
//! newline-delimited JSON event stream back over stdout
//! (`AssistantMessage`/`UserMessage`/`ResultMessage` with their
//! `TextBlock`/`ToolUseBlock`/`ToolResultBlock` children). This binding
//! speaks the same wire shape over a child process's stdio pipes instead of
//! an in-process SDK call.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;

use crate::agent::{AgentConnection, AgentConnectionFactory, AgentError, AgentEvent, InterruptHandle};
use crate::config::AgentConfig;
use crate::turn::coerce_to_string;

pub struct CliAgentFactory {
    config: AgentConfig,
}

impl CliAgentFactory {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl AgentConnectionFactory for CliAgentFactory {
    async fn create(&self) -> Result<Box<dyn AgentConnection>, AgentError> {
        let mut agent = CliAgent {
            config: self.config.clone(),
            child: None,
            stdin: None,
            lines: None,
        };
        agent.connect().await?;
        Ok(Box::new(agent))
    }
}

/// One live child process plus its stdio pipes. `None` fields mean
/// "not connected yet" or "torn down"; the pool never calls `query` without
/// calling `connect` first (see `crate::pool::Pool::acquire`).
struct CliAgent {
    config: AgentConfig,
    child: Option<Child>,
    stdin: Option<Arc<Mutex<ChildStdin>>>,
    lines: Option<Lines<BufReader<tokio::process::ChildStdout>>>,
}

/// Holds its own `Arc` clone of the child's stdin so it outlives the
/// `receive_response` borrow of the connection it was cut from.
struct CliInterruptHandle {
    stdin: Arc<Mutex<ChildStdin>>,
}

#[async_trait]
impl InterruptHandle for CliInterruptHandle {
    async fn interrupt(&self) -> Result<(), AgentError> {
        let payload = serde_json::json!({"type": "control", "subtype": "interrupt"});
        let mut line = payload.to_string();
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| AgentError::Query(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| AgentError::Query(e.to_string()))
    }
}

/// Returned when `interrupt_handle` is requested before `connect` has run;
/// the Pool never does this in practice (see `crate::pool::Pool::acquire`).
struct NotConnectedInterruptHandle;

#[async_trait]
impl InterruptHandle for NotConnectedInterruptHandle {
    async fn interrupt(&self) -> Result<(), AgentError> {
        Err(AgentError::Query("not connected".into()))
    }
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<WireInner>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    total_cost_usd: Option<f64>,
}

#[derive(Deserialize)]
struct WireInner {
    #[serde(default)]
    content: Vec<WireBlock>,
}

#[derive(Deserialize)]
struct WireBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<Value>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<Value>,
    #[serde(default)]
    tool_use_id: Option<String>,
    #[serde(default)]
    content: Option<Value>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

/// Parses one newline-delimited JSON event into zero or more [`AgentEvent`]s.
/// `system`-type lines (session handshake, not part of the original spec's
/// event surface) are silently skipped, matching the original's
/// `isinstance` dispatch that only recognizes three message classes.
fn parse_line(line: &str) -> Result<Vec<AgentEvent>, AgentError> {
    let wire: WireMessage = serde_json::from_str(line)
        .map_err(|e| AgentError::Protocol(format!("malformed event line: {e}")))?;

    let mut events = Vec::new();
    match wire.kind.as_str() {
        "assistant" => {
            for block in wire.message.map(|m| m.content).unwrap_or_default() {
                match block.kind.as_str() {
                    "text" => {
                        let text = block
                            .text
                            .as_ref()
                            .map(coerce_to_string)
                            .unwrap_or_default();
                        events.push(AgentEvent::AssistantText(text));
                    }
                    "tool_use" => {
                        events.push(AgentEvent::ToolUse {
                            id: block.id.unwrap_or_default(),
                            name: block
                                .name
                                .as_ref()
                                .map(coerce_to_string)
                                .unwrap_or_else(|| "unknown".to_string()),
                            input: block.content.unwrap_or(Value::Null),
                        });
                    }
                    _ => {}
                }
            }
        }
        "user" => {
            for block in wire.message.map(|m| m.content).unwrap_or_default() {
                if block.kind == "tool_result" {
                    events.push(AgentEvent::ToolResult {
                        tool_use_id: block.tool_use_id.unwrap_or_default(),
                        content: block
                            .content
                            .as_ref()
                            .map(coerce_to_string)
                            .unwrap_or_default(),
                    });
                }
            }
        }
        "result" => {
            events.push(AgentEvent::Result {
                input_tokens: wire.usage.as_ref().and_then(|u| u.input_tokens),
                output_tokens: wire.usage.as_ref().and_then(|u| u.output_tokens),
                total_cost: wire.total_cost_usd,
            });
        }
        _ => {}
    }
    Ok(events)
}

#[async_trait]
impl AgentConnection for CliAgent {
    async fn connect(&mut self) -> Result<(), AgentError> {
        let mut command = Command::new(&self.config.command);
        command
            .arg("--print")
            .arg("--input-format")
            .arg("stream-json")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--model")
            .arg(&self.config.model)
            .arg("--permission-mode")
            .arg(&self.config.permission_mode)
            .arg("--setting-sources")
            .arg("project")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = tokio::time::timeout(
            std::time::Duration::from_secs(self.config.connect_timeout_s),
            async { command.spawn() },
        )
        .await
        .map_err(|_| AgentError::Connect("spawn timed out".into()))?
        .map_err(|e| AgentError::Connect(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Connect("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Connect("child stdout unavailable".into()))?;

        self.lines = Some(BufReader::new(stdout).lines());
        self.stdin = Some(Arc::new(Mutex::new(stdin)));
        self.child = Some(child);
        Ok(())
    }

    async fn query(&mut self, prompt: &str, session_id: &str) -> Result<(), AgentError> {
        let stdin = self
            .stdin
            .as_ref()
            .ok_or_else(|| AgentError::Query("not connected".into()))?;

        let payload = serde_json::json!({
            "type": "user",
            "session_id": session_id,
            "message": {"role": "user", "content": prompt},
        });
        let mut line = payload.to_string();
        line.push('\n');
        let mut stdin = stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| AgentError::Query(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| AgentError::Query(e.to_string()))
    }

    fn receive_response(&mut self) -> BoxStream<'_, Result<AgentEvent, AgentError>> {
        let Some(lines) = self.lines.as_mut() else {
            return stream::iter(vec![Err(AgentError::Protocol("not connected".into()))]).boxed();
        };

        let pending: std::collections::VecDeque<AgentEvent> = std::collections::VecDeque::new();
        stream::unfold((lines, pending, false), |(lines, mut pending, done)| async move {
            if let Some(event) = pending.pop_front() {
                let terminal = matches!(event, AgentEvent::Result { .. });
                return Some((Ok(event), (lines, pending, terminal || done)));
            }
            if done {
                return None;
            }
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => match parse_line(&line) {
                        Ok(events) if events.is_empty() => continue,
                        Ok(events) => {
                            pending.extend(events);
                            let event = pending.pop_front().expect("just extended from non-empty events");
                            let terminal = matches!(event, AgentEvent::Result { .. });
                            return Some((Ok(event), (lines, pending, terminal)));
                        }
                        Err(e) => return Some((Err(e), (lines, pending, true))),
                    },
                    Ok(None) => {
                        return Some((
                            Err(AgentError::Protocol("upstream closed the stream".into())),
                            (lines, pending, true),
                        ));
                    }
                    Err(e) => {
                        return Some((Err(AgentError::Protocol(e.to_string())), (lines, pending, true)));
                    }
                }
            }
        })
        .boxed()
    }

    fn interrupt_handle(&self) -> Arc<dyn InterruptHandle> {
        match self.stdin.as_ref() {
            Some(stdin) => Arc::new(CliInterruptHandle {
                stdin: Arc::clone(stdin),
            }),
            None => Arc::new(NotConnectedInterruptHandle),
        }
    }

    async fn health_check(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn disconnect(&mut self) -> Result<(), AgentError> {
        self.stdin = None;
        self.lines = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
        }
        Ok(())
    }
}
