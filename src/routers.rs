//! Top-level router: wires every transport endpoint behind the shared
//! composition-root and rate-limiting hoops.
//!
//! Grounded on the teacher's own `routers.rs` (`hoop()`-chained API router,
//! an OpenAPI doc generated from it and mounted alongside) minus the
//! auth/game/profile/friends/static-asset routers and the WebTransport
//! route, which have no counterpart in this gateway.

use salvo::oapi::OpenApi;
use salvo::prelude::*;

use crate::app::AppState;
use crate::health;
use crate::hoops::{inject_state, rate_limit_hoop};
use crate::transport::{sessions, sse, ws};

const OPENAPI_JSON: &str = "/api-doc/openapi.json";

/// Builds the full route tree for `state`. Called once at startup; `state`
/// is cloned into every request's `Depot` by the `inject_state` hoop.
pub fn root(state: AppState) -> Router {
    let api_routes = Router::with_path("api")
        .hoop(crate::utils::logger::Logger)
        .hoop(inject_state(state))
        .hoop(rate_limit_hoop())
        .push(Router::with_path("chat").post(sse::chat))
        .push(
            Router::with_path("sessions")
                .post(sessions::create_session)
                .get(sessions::list_sessions),
        )
        .push(Router::with_path("sessions/{session_id}").delete(sessions::delete_session))
        .push(Router::with_path("ws/advanced/{session_id}").get(ws::ws_advanced))
        .push(Router::with_path("health").get(health::health));

    let doc = openapi_doc(&api_routes);

    Router::new()
        .push(api_routes)
        .unshift(doc.into_router(OPENAPI_JSON))
        .unshift(SwaggerUi::new(OPENAPI_JSON).into_router("swagger-ui"))
}

fn openapi_doc(to_document: &Router) -> OpenApi {
    OpenApi::new("turnstile-gateway", env!("CARGO_PKG_VERSION")).merge_router(to_document)
}
