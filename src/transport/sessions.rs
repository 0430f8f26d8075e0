//! `POST /sessions`, `GET /sessions`, `DELETE /sessions/{id}`: session
//! lifecycle management outside of an active turn.
//!
//! Grounded on `original_source/routes/sessions.py`: create accepts an
//! optional client-supplied id and a free-form config dict, list returns a
//! summary per active session, delete is idempotent.

use serde::Serialize;

use crate::hoops::state::StateDepotExt;
use crate::prelude::*;
use crate::session::SessionConfig;
use crate::transport::generate_session_id;
use crate::validate;

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateSessionRequest {
    pub session_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub project_id: String,
    pub status: &'static str,
}

#[endpoint]
pub async fn create_session(
    req: JsonBody<CreateSessionRequest>,
    depot: &mut Depot,
) -> JsonResult<CreateSessionResponse> {
    let body = req.0;
    let state = depot.app_state();

    let session_id = match body.session_id {
        Some(raw) => validate::session_id(&raw).map_err(|e| GatewayError::Validation(e.to_string()))?,
        None => generate_session_id(),
    };

    let mut config = SessionConfig::default();
    if let Some(project_id) = &body.project_id {
        config.project_id =
            validate::project_id(project_id).map_err(|e| GatewayError::Validation(e.to_string()))?;
    }
    if let Some(model) = body.model {
        config.model = model;
    }
    if let Some(prompt) = body.system_prompt {
        config.system_prompt = Some(prompt);
    }

    let project_id = config.project_id.clone();
    state
        .sessions
        .register(&session_id, config)
        .map_err(|_| GatewayError::Validation("session registry is full".into()))?;

    json_ok(CreateSessionResponse {
        session_id,
        project_id,
        status: "created",
    })
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ListSessionsResponse {
    pub sessions: Vec<crate::session::SessionSummary>,
    pub total: usize,
}

#[endpoint]
pub async fn list_sessions(depot: &mut Depot) -> JsonResult<ListSessionsResponse> {
    let state = depot.app_state();
    let sessions = state.sessions.list().await;
    let total = sessions.len();
    json_ok(ListSessionsResponse { sessions, total })
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DeleteSessionResponse {
    pub session_id: String,
    pub status: &'static str,
}

#[endpoint]
pub async fn delete_session(req: &mut Request, depot: &mut Depot) -> JsonResult<DeleteSessionResponse> {
    let raw_session_id = req
        .param::<String>("session_id")
        .ok_or_else(|| GatewayError::Validation("missing session_id".into()))?;
    let session_id =
        validate::session_id(&raw_session_id).map_err(|e| GatewayError::Validation(e.to_string()))?;

    let state = depot.app_state();
    state.sessions.unregister(&session_id);

    json_ok(DeleteSessionResponse {
        session_id,
        status: "deleted",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_session_request_defaults_are_all_optional() {
        let req: CreateSessionRequest = serde_json::from_str("{}").unwrap();
        assert!(req.session_id.is_none());
        assert!(req.project_id.is_none());
    }
}
