//! `/ws/advanced/{session_id}`: the richer bidirectional WebSocket surface.
//!
//! Grounded on `original_source/core/websocket_handler.py` /
//! `routes/websocket.py`: a single socket per session id multiplexes
//! `query`/`command`/`interrupt`/`ping` inbound messages against the
//! pipeline's streamed events, generalized from the one-WebTransport-
//! connection-per-user_id bookkeeping in `stream::stream_manager` into a
//! one-WebSocket-per-session-id registry (a second connection for an
//! already-connected session is rejected, not silently swapped in).
//!
//! Commands unrecognized by this gateway produce an `error` message without
//! closing the socket, per the original's behavior of treating unknown
//! commands as a soft client error.

use std::sync::Arc;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use salvo::prelude::*;
use salvo::websocket::{Message, WebSocket, WebSocketUpgrade};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::hoops::state::StateDepotExt;
use crate::prelude::*;
use crate::session::SessionConfig;
use crate::transport::OutboundEvent;
use crate::validate;

/// Tracks which session ids currently have a live WebSocket attached, so a
/// second connection attempt for the same id is rejected cleanly instead of
/// the Turn Pipeline's single-writer lock silently queuing it forever.
pub struct ConnectionRegistry {
    active: DashMap<String, ()>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            active: DashMap::new(),
        })
    }

    fn try_claim(&self, session_id: &str) -> bool {
        self.active.insert(session_id.to_string(), ()).is_none()
    }

    fn release(&self, session_id: &str) {
        self.active.remove(session_id);
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundMessage {
    Query {
        message: String,
        #[serde(default)]
        project_id: Option<String>,
    },
    Command {
        command: String,
        #[serde(default)]
        params: Option<serde_json::Value>,
    },
    Interrupt,
    Ping,
}

#[endpoint]
pub async fn ws_advanced(
    req: &mut Request,
    depot: &mut Depot,
    res: &mut Response,
) -> AppResult<()> {
    let raw_session_id = req
        .param::<String>("session_id")
        .ok_or_else(|| GatewayError::Validation("missing session_id".into()))?;
    let session_id = validate::session_id(&raw_session_id)
        .map_err(|e| GatewayError::Validation(e.to_string()))?;

    let state = depot.app_state().clone();
    let connections = state.connections.clone();

    if !connections.try_claim(&session_id) {
        return Err(GatewayError::Validation(
            "a connection for this session is already active".into(),
        ));
    }

    WebSocketUpgrade::new()
        .upgrade(req, res, move |ws| async move {
            handle_socket(ws, session_id.clone(), state).await;
            connections.release(&session_id);
        })
        .await
        .map_err(|_| GatewayError::UpstreamProtocol("websocket upgrade failed".into()))
}

async fn handle_socket(ws: WebSocket, session_id: String, state: crate::app::AppState) {
    let (mut sink, mut stream) = ws.split();
    let mut turn_rx: Option<mpsc::Receiver<crate::turn::TurnEvent>> = None;

    loop {
        tokio::select! {
            biased;

            Some(event) = recv_turn_event(&mut turn_rx) => {
                let event: OutboundEvent = event.into();
                let terminal = event.is_terminal();
                if send(&mut sink, &event).await.is_err() {
                    break;
                }
                if terminal {
                    turn_rx = None;
                    if send(&mut sink, &OutboundEvent::Done { session_id: session_id.clone() }).await.is_err() {
                        break;
                    }
                }
            }

            incoming = stream.next() => {
                let Some(Ok(msg)) = incoming else { break };
                if !msg.is_text() {
                    continue;
                }
                let Ok(text) = msg.to_str() else { continue };
                let parsed: Result<InboundMessage, _> = serde_json::from_str(text);
                match parsed {
                    Ok(InboundMessage::Ping) => {
                        if send(&mut sink, &OutboundEvent::Pong).await.is_err() {
                            break;
                        }
                    }
                    Ok(InboundMessage::Interrupt) => {
                        if let Some(entry) = state.sessions.get(&session_id) {
                            entry.interrupt.notify_waiters();
                        }
                    }
                    Ok(InboundMessage::Command { command, params }) => {
                        let result = run_command(&state, &session_id, &command, params).await;
                        let outbound = match result {
                            Ok(value) => OutboundEvent::CommandResult { command, result: value },
                            Err(e) => OutboundEvent::protocol_error(e),
                        };
                        if send(&mut sink, &outbound).await.is_err() {
                            break;
                        }
                    }
                    Ok(InboundMessage::Query { message, project_id }) => {
                        if turn_rx.is_some() {
                            let _ = send(
                                &mut sink,
                                &OutboundEvent::protocol_error("a turn is already in progress on this session"),
                            )
                            .await;
                            continue;
                        }
                        let Ok(message) = validate::chat_message(&message) else {
                            let _ = send(&mut sink, &OutboundEvent::protocol_error("invalid message")).await;
                            continue;
                        };
                        let mut config = SessionConfig::default();
                        if let Some(project_id) = project_id {
                            match validate::project_id(&project_id) {
                                Ok(p) => config.project_id = p,
                                Err(e) => {
                                    let _ = send(&mut sink, &OutboundEvent::protocol_error(e.to_string())).await;
                                    continue;
                                }
                            }
                        }
                        let (tx, rx) = mpsc::channel(32);
                        turn_rx = Some(rx);
                        let pipeline = state.pipeline.clone();
                        let sid = session_id.clone();
                        tokio::spawn(async move {
                            pipeline.run_turn(sid, config, message, tx).await;
                        });
                    }
                    Err(e) => {
                        let _ = send(&mut sink, &OutboundEvent::protocol_error(format!("unrecognized message: {e}"))).await;
                    }
                }
            }
        }
    }
}

async fn recv_turn_event(
    rx: &mut Option<mpsc::Receiver<crate::turn::TurnEvent>>,
) -> Option<crate::turn::TurnEvent> {
    match rx {
        Some(r) => r.recv().await,
        None => std::future::pending().await,
    }
}

async fn send(
    sink: &mut (impl futures::Sink<Message, Error = salvo::Error> + Unpin),
    msg: &OutboundEvent,
) -> Result<(), salvo::Error> {
    let text = serde_json::to_string(msg).unwrap_or_else(|_| r#"{"type":"error","error":"encoding failure"}"#.into());
    sink.send(Message::text(text)).await
}

/// Dispatches a `command` message against session state. Unknown commands
/// return an error string rather than a hard failure, so the caller can
/// surface it as an `error` message without dropping the connection.
async fn run_command(
    state: &crate::app::AppState,
    session_id: &str,
    command: &str,
    params: Option<serde_json::Value>,
) -> Result<serde_json::Value, String> {
    let Some(entry) = state.sessions.get(session_id) else {
        return Err("unknown session".into());
    };

    match command {
        "clear_history" => {
            let mut history = entry.history.lock().await;
            *history = Default::default();
            Ok(serde_json::json!({"cleared": true}))
        }
        "get_status" => {
            let history = entry.history.lock().await.clone();
            let metrics = entry.metrics.lock().await.clone();
            Ok(serde_json::json!({"history": history, "metrics": metrics}))
        }
        "set_model" => {
            let model = params
                .as_ref()
                .and_then(|p| p.get("model"))
                .and_then(|m| m.as_str())
                .ok_or("set_model requires a \"model\" string param")?;
            entry.config.lock().await.model = model.to_string();
            Ok(serde_json::json!({"model": model}))
        }
        "toggle_neo4j" => {
            let mut config = entry.config.lock().await;
            config.neo4j_enabled = !config.neo4j_enabled;
            Ok(serde_json::json!({"neo4j_enabled": config.neo4j_enabled}))
        }
        "add_context" => {
            let note = params
                .as_ref()
                .and_then(|p| p.get("note"))
                .and_then(|n| n.as_str())
                .ok_or("add_context requires a \"note\" string param")?;
            if state.memory.enabled() {
                state.memory.save_interaction(session_id, note, "").await;
            }
            Ok(serde_json::json!({"added": true}))
        }
        "export_session" => {
            let config = entry.config.lock().await.clone();
            let history = entry.history.lock().await.clone();
            Ok(serde_json::json!({
                "session_id": session_id,
                "project_id": config.project_id,
                "model": config.model,
                "history": history,
            }))
        }
        other => Err(format!("unrecognized command: {other}")),
    }
}
