//! HTTP server implementation.

use axum::middleware;
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::admin;
use super::gate::admission_gate;
use super::identity::IdentityResolver;
use crate::config::StoreFailureMode;
use crate::error::{GateError, Result};
use crate::ratelimit::RateLimiter;

/// Shared state behind every route.
pub struct AppState {
    pub limiter: Arc<RateLimiter>,
    pub resolver: Arc<dyn IdentityResolver>,
    pub on_store_error: StoreFailureMode,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct IndexResponse {
    message: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "turnstile",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn home() -> Json<IndexResponse> {
    Json(IndexResponse {
        message: "Welcome to the rate limited index page!",
    })
}

/// Build the full router: gated routes, administration and health.
pub fn router(state: Arc<AppState>) -> Router {
    let gated = Router::new()
        .route("/home", get(home))
        .route_layer(middleware::from_fn_with_state(state.clone(), admission_gate));

    let admin = Router::new()
        .route("/policies", get(admin::list_policies))
        .route(
            "/policies/:policy_id",
            get(admin::get_policy).patch(admin::update_policy),
        )
        .route(
            "/identities/:identity",
            get(admin::get_identity_policy).patch(admin::update_identity_policy),
        )
        .route("/me", put(admin::update_own_policy));

    Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health))
        .merge(gated)
        .nest("/admin", admin)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// HTTP server for the admission gate.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, state: Arc<AppState>) -> Self {
        Self { addr, state }
    }

    /// Serve until `signal` resolves, then drain in-flight requests.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Starting HTTP admission gate with graceful shutdown");

        let app = router(self.state).into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                GateError::Io(e)
            })
    }
}
