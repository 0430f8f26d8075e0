//! `POST /chat`: Server-Sent Events streaming of a single turn.
//!
//! Grounded on `original_source/routes/chat.py`'s SSE endpoint: a
//! `session_created` preamble (only for a freshly minted session id), the
//! turn's own events in arrival order, and heartbeats interleaved so
//! intermediaries don't time out the connection during a long tool call.

use std::time::Duration;

use futures::stream::{self, StreamExt};
use salvo::prelude::*;
use salvo::sse::{self, SseEvent};

use crate::hoops::state::StateDepotExt;
use crate::prelude::*;
use crate::session::SessionConfig;
use crate::transport::{generate_session_id, OutboundEvent};
use crate::validate;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Drives the SSE body through the turn's own events, then appends the
/// mandatory terminal `done` frame before the stream ends.
enum SseStreamState {
    Active(tokio::sync::mpsc::Receiver<crate::turn::TurnEvent>, tokio::time::Interval),
    Finishing,
    Done,
}

#[derive(Debug, serde::Deserialize, ToSchema)]
pub struct ChatRequest {
    pub session_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub project_id: Option<String>,
}

/// Streams one turn's events as SSE. The response stays open until the
/// turn reaches a terminal event or the client disconnects.
#[endpoint]
pub async fn chat(
    req: JsonBody<ChatRequest>,
    depot: &mut Depot,
    res: &mut Response,
) -> AppResult<()> {
    let body = req.0;
    let state = depot.app_state().clone();

    let message = validate::chat_message(&body.message)
        .map_err(|e| GatewayError::Validation(e.to_string()))?;

    let (session_id, freshly_created) = match body.session_id {
        Some(raw) => (
            validate::session_id(&raw).map_err(|e| GatewayError::Validation(e.to_string()))?,
            false,
        ),
        None => (generate_session_id(), true),
    };

    let mut config = SessionConfig::default();
    if let Some(project_id) = &body.project_id {
        config.project_id = validate::project_id(project_id)
            .map_err(|e| GatewayError::Validation(e.to_string()))?;
    }

    let (tx, rx) = tokio::sync::mpsc::channel(32);
    let pipeline = state.pipeline.clone();
    let sid_for_task = session_id.clone();
    tokio::spawn(async move {
        pipeline.run_turn(sid_for_task, config, message, tx).await;
    });

    let done_session_id = session_id.clone();
    let turn_stream = stream::unfold(
        SseStreamState::Active(rx, tokio::time::interval(HEARTBEAT_INTERVAL)),
        move |state| {
            let done_session_id = done_session_id.clone();
            async move {
                match state {
                    SseStreamState::Active(mut rx, mut ticker) => tokio::select! {
                        biased;
                        event = rx.recv() => match event {
                            Some(ev) => {
                                let next = if ev.is_terminal() {
                                    SseStreamState::Finishing
                                } else {
                                    SseStreamState::Active(rx, ticker)
                                };
                                Some((OutboundEvent::from(ev), next))
                            }
                            None => None,
                        },
                        _ = ticker.tick() => {
                            Some((OutboundEvent::Heartbeat, SseStreamState::Active(rx, ticker)))
                        }
                    },
                    SseStreamState::Finishing => Some((
                        OutboundEvent::Done { session_id: done_session_id },
                        SseStreamState::Done,
                    )),
                    SseStreamState::Done => None,
                }
            }
        },
    );

    let preamble = if freshly_created {
        stream::once(futures::future::ready(OutboundEvent::SessionCreated {
            session_id: session_id.clone(),
        }))
        .boxed()
    } else {
        stream::empty().boxed()
    };

    let events = preamble.chain(turn_stream).map(|event| {
        SseEvent::default()
            .json(&event)
            .map_err(|e| salvo::Error::other(e.to_string()))
    });

    sse::streaming(res, events).map_err(|_| GatewayError::Cancelled)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_deserializes_with_optional_fields() {
        let json = r#"{"message": "hi"}"#;
        let req: ChatRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.message, "hi");
        assert!(req.session_id.is_none());
    }
}
