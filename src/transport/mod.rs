//! Streaming Transport Adapter: the single wire-level event shape shared by
//! the SSE (`POST /chat`) and WebSocket (`/ws/advanced/{session_id}`)
//! endpoints.
//!
//! Grounded on `original_source/routes/chat.py` (SSE framing: a
//! `session_created` preamble, then the turn's own events, then a final
//! `done`) and `original_source/core/websocket_handler.py` /
//! `routes/websocket.py` (the richer bidirectional command surface, which
//! adds `pong`/`command_result` on top of the same turn events). Kept as
//! one flat, internally-tagged enum rather than nesting `TurnEvent` inside
//! it: serde's internal tagging inserts one `type` key per value, so a
//! nested tagged enum would fight the outer one for that key.
//!
//! The single-connection-per-identity bookkeeping in `stream::stream_manager`
//! is generalized here into a per-session-id WebSocket registry
//! (`ws::ConnectionRegistry`) so a stray second connection for the same
//! session is rejected rather than silently replacing the first.

pub mod sse;
pub mod sessions;
pub mod ws;

use rand::RngCore;
use serde::Serialize;

use crate::turn::TurnEvent;

/// One event written to the wire, in either transport.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    SessionCreated {
        session_id: String,
    },
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
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Heartbeat,
    Done {
        session_id: String,
    },
    Pong,
    CommandResult {
        command: String,
        result: serde_json::Value,
    },
}

impl From<TurnEvent> for OutboundEvent {
    fn from(event: TurnEvent) -> Self {
        match event {
            TurnEvent::Processing { session_id } => OutboundEvent::Processing { session_id },
            TurnEvent::Content { content, session_id } => {
                OutboundEvent::Content { content, session_id }
            }
            TurnEvent::ToolUse { name, id, session_id } => {
                OutboundEvent::ToolUse { name, id, session_id }
            }
            TurnEvent::ToolResult { tool_id, content, session_id } => {
                OutboundEvent::ToolResult { tool_id, content, session_id }
            }
            TurnEvent::Result { session_id, input_tokens, output_tokens, cost_usd } => {
                OutboundEvent::Result { session_id, input_tokens, output_tokens, cost_usd }
            }
            TurnEvent::Error { error, session_id, .. } => OutboundEvent::Error {
                error,
                session_id: Some(session_id),
            },
        }
    }
}

impl OutboundEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OutboundEvent::Result { .. } | OutboundEvent::Error { .. } | OutboundEvent::Done { .. }
        )
    }

    pub fn protocol_error(message: impl Into<String>) -> Self {
        OutboundEvent::Error {
            error: message.into(),
            session_id: None,
        }
    }
}

/// Generates a UUIDv4-shaped session id without pulling in a dedicated
/// `uuid` dependency: 16 random bytes with the RFC4122 version/variant bits
/// set, hex-encoded with dashes in the standard positions.
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let hex = hex::encode(bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_session_id_matches_uuid_shape() {
        let id = generate_session_id();
        assert!(crate::validate::session_id(&id).is_ok());
    }

    #[test]
    fn generated_session_ids_are_unique() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_ne!(a, b);
    }

    #[test]
    fn turn_error_carries_session_id_through() {
        let turn_err = TurnEvent::Error {
            error: "boom".into(),
            session_id: "s1".into(),
            timestamp: chrono::Utc::now(),
        };
        let outbound: OutboundEvent = turn_err.into();
        match outbound {
            OutboundEvent::Error { session_id, .. } => assert_eq!(session_id.as_deref(), Some("s1")),
            _ => panic!("expected Error variant"),
        }
    }
}
