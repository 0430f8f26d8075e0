use salvo::http::{StatusCode, StatusError};
use salvo::oapi::{self, EndpointOutRegister, ToSchema};
use salvo::prelude::*;
use thiserror::Error;

/// The gateway's single error currency at module boundaries.
///
/// Most variants never reach an HTTP response directly: inside the Turn
/// Pipeline they are folded into a single streamed `error` event instead
/// (see `crate::turn`). `Scribe` is still implemented for every variant so
/// the few paths that run before a transport is established (validation at
/// `POST /sessions`, `POST /chat`) can render a plain HTTP error.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("rate limit exceeded, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },
    #[error("circuit open, retry after {retry_after_seconds}s")]
    CircuitOpen { retry_after_seconds: u64 },
    #[error("upstream agent timed out")]
    UpstreamTimeout,
    #[error("upstream agent protocol error: {0}")]
    UpstreamProtocol(String),
    #[error("memory store unavailable")]
    MemoryUnavailable,
    #[error("connection pool exhausted")]
    PoolExhausted,
    #[error("turn cancelled")]
    Cancelled,
}

impl Scribe for GatewayError {
    fn render(self, res: &mut Response) {
        let status_error = match &self {
            Self::Validation(reason) => {
                StatusError::bad_request().brief(reason.clone())
            }
            Self::RateLimited {
                retry_after_seconds,
            } => {
                res.headers_mut().insert(
                    "Retry-After",
                    (*retry_after_seconds).to_string().parse().unwrap(),
                );
                StatusError::too_many_requests().brief(format!(
                    "rate limit exceeded, retry after {retry_after_seconds}s"
                ))
            }
            Self::CircuitOpen {
                retry_after_seconds,
            } => StatusError::service_unavailable().brief(format!(
                "upstream unavailable, retry after {retry_after_seconds}s"
            )),
            Self::UpstreamTimeout => {
                tracing::warn!("upstream agent timed out");
                StatusError::gateway_timeout().brief("upstream agent timed out")
            }
            Self::UpstreamProtocol(reason) => {
                tracing::error!(error = %reason, "upstream agent protocol error");
                StatusError::bad_gateway().brief(reason.clone())
            }
            Self::MemoryUnavailable => {
                tracing::warn!("memory store unavailable, degrading silently");
                StatusError::internal_server_error()
            }
            Self::PoolExhausted => {
                tracing::error!("connection pool exhausted");
                StatusError::service_unavailable()
                    .brief("connection pool exhausted")
            }
            Self::Cancelled => {
                // the client is already gone by the time this would render;
                // kept for completeness of the match rather than reachability.
                StatusError::bad_request().brief("request cancelled")
            }
        };

        res.render(status_error);
    }
}

impl EndpointOutRegister for GatewayError {
    fn register(
        components: &mut oapi::Components,
        operation: &mut oapi::Operation,
    ) {
        let responses = [
            (StatusCode::BAD_REQUEST, "Validation error"),
            (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded"),
            (StatusCode::SERVICE_UNAVAILABLE, "Upstream circuit open or pool exhausted"),
            (StatusCode::BAD_GATEWAY, "Upstream protocol error"),
            (StatusCode::GATEWAY_TIMEOUT, "Upstream timed out"),
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"),
        ];

        for (status, description) in responses {
            operation.responses.insert(
                status.as_str(),
                oapi::Response::new(description).add_content(
                    "application/json",
                    StatusError::to_schema(components),
                ),
            );
        }
    }
}
