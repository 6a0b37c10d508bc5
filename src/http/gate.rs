//! Request gate middleware.
//!
//! Turns an admission decision into forward-or-reject. A denial and a store
//! failure are kept apart: the first is always 429, the second follows the
//! configured [`StoreFailureMode`].

use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::server::AppState;
use super::{error_response, ErrorCode};
use crate::config::StoreFailureMode;
use crate::ratelimit::{Admission, Verdict};

pub const LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

const DENIED_MESSAGE: &str =
    "You have reached the maximum number of requests or actions allowed within a certain time frame";

/// Admit or reject a request before it reaches the wrapped routes.
pub async fn admission_gate(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(identity) = state.resolver.resolve(&request) else {
        warn!(path = %request.uri().path(), "Could not resolve request identity");
        return error_response(
            StatusCode::BAD_REQUEST,
            ErrorCode::IdentityUnresolved,
            "Unable to identify the client",
        );
    };

    match state.limiter.check(&identity).await {
        Ok(Admission {
            policy,
            verdict: Verdict::Allowed { remaining, .. },
        }) => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            headers.insert(LIMIT_HEADER, HeaderValue::from(policy.max_requests));
            headers.insert(REMAINING_HEADER, HeaderValue::from(remaining));
            response
        }
        Ok(Admission {
            verdict: Verdict::Denied { reason },
            ..
        }) => {
            debug!(identity = %identity, reason = %reason, "Request rejected");
            error_response(StatusCode::TOO_MANY_REQUESTS, ErrorCode::RateLimited, DENIED_MESSAGE)
        }
        Err(err) if err.is_store_failure() => match state.on_store_error {
            StoreFailureMode::FailClosed => {
                warn!(identity = %identity, error = %err, "Store failure, rejecting request");
                error_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    ErrorCode::StoreUnavailable,
                    "Rate limit state is unavailable",
                )
            }
            StoreFailureMode::FailOpen => {
                warn!(identity = %identity, error = %err, "Store failure, forwarding unchecked");
                next.run(request).await
            }
        },
        Err(err) => {
            error!(identity = %identity, error = %err, "Admission check failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorCode::Internal,
                "Internal server error",
            )
        }
    }
}
