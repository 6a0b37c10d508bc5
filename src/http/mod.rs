//! HTTP surface: the request gate, policy administration and server wiring.

mod admin;
mod gate;
mod identity;
mod server;

pub use gate::{admission_gate, LIMIT_HEADER, REMAINING_HEADER};
pub use identity::{HeaderIdentityResolver, IdentityResolver};
pub use server::{router, AppState, HttpServer};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Machine-readable error class in rejection bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RateLimited,
    StoreUnavailable,
    IdentityUnresolved,
    InvalidPolicy,
    NotFound,
    Internal,
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub message: String,
    pub code: ErrorCode,
}

pub(crate) fn error_response(status: StatusCode, code: ErrorCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            message: message.to_string(),
            code,
        }),
    )
        .into_response()
}
