//! `GET /health`: renders the aggregator's snapshot as JSON.

use crate::hoops::state::StateDepotExt;
use crate::prelude::*;

use super::HealthReport;

#[endpoint]
pub async fn health(depot: &mut Depot) -> JsonResult<HealthReport> {
    let state = depot.app_state();
    json_ok(state.health.report().await)
}
