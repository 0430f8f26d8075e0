//! Rate-limiting hoop: the salvo-side wiring for [`crate::rate_limit`].
//!
//! Grounded on `utils/limiter.rs`'s hoop-wiring idiom (a `Handler` that
//! checks a limiter and short-circuits with `ctrl.skip_rest()` on denial),
//! retargeted from the teacher's per-user token-bucket onto the gateway's
//! sliding-window limiter keyed by remote address.

use salvo::http::StatusCode;
use salvo::writing::Json;
use salvo::{Depot, FlowCtrl, Handler, Request, Response, async_trait};
use serde::Serialize;

use crate::hoops::state::StateDepotExt;
use crate::rate_limit::{DenyReason, FingerprintHeaders};

#[derive(Serialize)]
struct RateLimitBody {
    error: String,
    code: &'static str,
    retry_after_seconds: u64,
}

fn deny_message(reason: DenyReason) -> &'static str {
    match reason {
        DenyReason::Blacklisted => "client is temporarily blacklisted",
        DenyReason::RateLimitExceeded => "rate limit exceeded",
        DenyReason::BurstLimitExceeded => "burst rate limit exceeded",
        DenyReason::SuspiciousFingerprints => "too many distinct client fingerprints",
    }
}

pub struct RateLimitHoop;

#[async_trait]
impl Handler for RateLimitHoop {
    async fn handle(
        &self,
        req: &mut Request,
        depot: &mut Depot,
        res: &mut Response,
        ctrl: &mut FlowCtrl,
    ) {
        let state = depot.app_state();
        let client_id = req.remote_addr().to_string();
        let endpoint = req.uri().path().to_string();

        let headers = FingerprintHeaders {
            user_agent: req.header::<&str>("user-agent"),
            accept: req.header::<&str>("accept"),
            accept_encoding: req.header::<&str>("accept-encoding"),
            accept_language: req.header::<&str>("accept-language"),
        };

        if let Err(denied) = state.rate_limiter.is_allowed(&client_id, &endpoint, headers).await {
            res.status_code(StatusCode::TOO_MANY_REQUESTS);
            res.headers_mut().insert(
                "retry-after",
                denied.retry_after_seconds.to_string().parse().expect("numeric header value is valid"),
            );
            res.render(Json(RateLimitBody {
                error: deny_message(denied.reason).to_string(),
                code: "RATE_LIMIT_EXCEEDED",
                retry_after_seconds: denied.retry_after_seconds,
            }));
            ctrl.skip_rest();
        }
    }
}

pub fn rate_limit_hoop() -> RateLimitHoop {
    RateLimitHoop
}
