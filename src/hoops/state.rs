//! Injects the composition root's [`AppState`] into every request's
//! [`Depot`], replacing the teacher's per-module global statics
//! (`crate::db::get`, `crate::utils::ARGON2`) with one explicit value
//! threaded through the router.

use salvo::{Depot, FlowCtrl, Handler, Request, Response, async_trait};

use crate::app::AppState;

pub trait StateDepotExt {
    fn app_state(&self) -> &AppState;
}

impl StateDepotExt for Depot {
    fn app_state(&self) -> &AppState {
        self.obtain::<AppState>()
            .expect("AppState must be injected before any handler runs")
    }
}

/// Stashes a clone of the composition root in the Depot for every request.
/// `AppState` is a bundle of `Arc`s, so the clone is cheap.
pub struct InjectState(pub AppState);

#[async_trait]
impl Handler for InjectState {
    async fn handle(
        &self,
        _req: &mut Request,
        depot: &mut Depot,
        _res: &mut Response,
        _ctrl: &mut FlowCtrl,
    ) {
        depot.inject(self.0.clone());
    }
}

pub fn inject_state(state: AppState) -> InjectState {
    InjectState(state)
}
