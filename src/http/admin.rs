//! Policy administration endpoints.
//!
//! Each handler maps onto one repository operation. Patches keep their
//! partial-update meaning: absent fields are left alone.

use axum::extract::{FromRequest, Path, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;
use tracing::warn;

use super::server::AppState;
use super::{error_response, ErrorCode};
use crate::error::GateError;
use crate::ratelimit::{LimitPolicy, PolicyPatch};

/// Repository error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(GateError);

impl From<GateError> for ApiError {
    fn from(err: GateError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            GateError::InvalidPolicy(_) => (StatusCode::BAD_REQUEST, ErrorCode::InvalidPolicy),
            GateError::PolicyNotFound(_) => (StatusCode::NOT_FOUND, ErrorCode::NotFound),
            err if err.is_store_failure() => {
                warn!(error = %err, "Store failure during policy administration");
                (StatusCode::SERVICE_UNAVAILABLE, ErrorCode::StoreUnavailable)
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::Internal),
        };
        error_response(status, code, &self.0.to_string())
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// `GET /admin/policies`
pub async fn list_policies(State(state): State<Arc<AppState>>) -> ApiResult<Vec<LimitPolicy>> {
    Ok(Json(state.limiter.policies().list_policies().await?))
}

/// `GET /admin/policies/{policy_id}`
pub async fn get_policy(
    State(state): State<Arc<AppState>>,
    Path(policy_id): Path<String>,
) -> ApiResult<LimitPolicy> {
    state
        .limiter
        .policies()
        .find_by_policy_id(&policy_id)
        .await?
        .map(Json)
        .ok_or_else(|| GateError::PolicyNotFound(policy_id).into())
}

/// `PATCH /admin/policies/{policy_id}`
pub async fn update_policy(
    State(state): State<Arc<AppState>>,
    Path(policy_id): Path<String>,
    Json(patch): Json<PolicyPatch>,
) -> ApiResult<LimitPolicy> {
    let policies = state.limiter.policies();
    let current = policies
        .find_by_policy_id(&policy_id)
        .await?
        .ok_or(GateError::PolicyNotFound(policy_id))?;
    Ok(Json(policies.set_policy(&current.identity, &patch).await?))
}

/// `GET /admin/identities/{identity}`
pub async fn get_identity_policy(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<String>,
) -> ApiResult<LimitPolicy> {
    state
        .limiter
        .policies()
        .find_policy(&identity)
        .await?
        .map(Json)
        .ok_or_else(|| GateError::PolicyNotFound(identity).into())
}

/// `PATCH /admin/identities/{identity}`
pub async fn update_identity_policy(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<String>,
    Json(patch): Json<PolicyPatch>,
) -> ApiResult<LimitPolicy> {
    Ok(Json(state.limiter.policies().set_policy(&identity, &patch).await?))
}

/// `PUT /admin/me`: patch the policy of whoever is calling.
pub async fn update_own_policy(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let Some(identity) = state.resolver.resolve(&request) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            ErrorCode::IdentityUnresolved,
            "Unable to identify the client",
        );
    };
    let patch = match Json::<PolicyPatch>::from_request(request, &()).await {
        Ok(Json(patch)) => patch,
        Err(rejection) => return rejection.into_response(),
    };

    match state
        .limiter
        .policies()
        .upsert_policy(&identity.key(), identity.kind, &patch)
        .await
    {
        Ok(policy) => Json(policy).into_response(),
        Err(err) => ApiError(err).into_response(),
    }
}
