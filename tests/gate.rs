//! End-to-end tests of the HTTP gate and policy administration.

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, Response, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;

use turnstile::config::StoreFailureMode;
use turnstile::error::{GateError, Result};
use turnstile::http::{router, AppState, HeaderIdentityResolver, LIMIT_HEADER, REMAINING_HEADER};
use turnstile::ratelimit::{DefaultLimits, LimitPolicy, PolicyPatch, RateLimiter};
use turnstile::store::{CounterStore, MemoryStore};

/// Store whose every call fails as if the backend were down.
struct DownStore;

#[async_trait]
impl CounterStore for DownStore {
    async fn increment_with_window(&self, _key: &str, _window_seconds: i64) -> Result<i64> {
        Err(GateError::StoreUnavailable("connection refused".into()))
    }

    async fn set_flag(&self, _key: &str, _ttl_seconds: i64) -> Result<()> {
        Err(GateError::StoreUnavailable("connection refused".into()))
    }

    async fn get_flag(&self, _key: &str) -> Result<bool> {
        Err(GateError::StoreUnavailable("connection refused".into()))
    }

    async fn save_policy(&self, _key: &str, _policy: &LimitPolicy) -> Result<()> {
        Err(GateError::StoreUnavailable("connection refused".into()))
    }

    async fn save_policy_if_absent(&self, _key: &str, _policy: &LimitPolicy) -> Result<bool> {
        Err(GateError::StoreUnavailable("connection refused".into()))
    }

    async fn find_policy_key(&self, _policy_id: &str) -> Result<Option<String>> {
        Err(GateError::StoreUnavailable("connection refused".into()))
    }

    async fn load_policy(&self, _key: &str) -> Result<Option<LimitPolicy>> {
        Err(GateError::StoreUnavailable("connection refused".into()))
    }

    async fn list_policy_keys(&self) -> Result<Vec<String>> {
        Err(GateError::StoreUnavailable("connection refused".into()))
    }
}

fn defaults(by_address: i64, by_credential: i64) -> DefaultLimits {
    DefaultLimits {
        window_seconds: 60,
        block_seconds: 300,
        max_requests_by_address: by_address,
        max_requests_by_credential: by_credential,
    }
}

fn build_app(store: Arc<dyn CounterStore>, limits: DefaultLimits, mode: StoreFailureMode) -> (Router, Arc<RateLimiter>) {
    let limiter = Arc::new(RateLimiter::new(store, limits));
    let state = Arc::new(AppState {
        limiter: limiter.clone(),
        resolver: Arc::new(HeaderIdentityResolver::new("API_KEY", false).unwrap()),
        on_store_error: mode,
    });
    (router(state), limiter)
}

fn memory_app(limits: DefaultLimits) -> (Router, Arc<RateLimiter>) {
    build_app(Arc::new(MemoryStore::new()), limits, StoreFailureMode::FailClosed)
}

fn client(ip: &str) -> ConnectInfo<SocketAddr> {
    ConnectInfo(format!("{}:51000", ip).parse().unwrap())
}

fn get(uri: &str, ip: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .extension(client(ip))
        .body(Body::empty())
        .unwrap()
}

fn json_request(method: &str, uri: &str, ip: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .extension(client(ip))
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_third_request_is_rejected_with_limit_two() {
    let (app, _) = memory_app(defaults(2, 100));

    for _ in 0..2 {
        let response = app.clone().oneshot(get("/home", "10.0.0.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app.clone().oneshot(get("/home", "10.0.0.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = body_json(response).await;
    assert_eq!(body["code"], "RATE_LIMITED");
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("maximum number of requests"));

    // A different address is unaffected
    let response = app.clone().oneshot(get("/home", "10.0.0.2")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_allowed_response_carries_limit_headers() {
    let (app, _) = memory_app(defaults(5, 100));

    let response = app.clone().oneshot(get("/home", "10.0.0.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[LIMIT_HEADER], "5");
    assert_eq!(response.headers()[REMAINING_HEADER], "4");

    let body = body_json(response).await;
    assert_eq!(body["message"], "Welcome to the rate limited index page!");
}

#[tokio::test]
async fn test_credential_header_selects_credential_default() {
    let (app, limiter) = memory_app(defaults(1, 3));

    for _ in 0..3 {
        let request = Request::builder()
            .uri("/home")
            .header("API_KEY", "key-abc")
            .extension(client("10.0.0.1"))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[LIMIT_HEADER], "3");
    }

    // The address behind the credential has its own untouched budget
    let response = app.clone().oneshot(get("/home", "10.0.0.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let policy = limiter
        .policies()
        .find_policy("credential:key-abc")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(policy.max_requests, 3);
}

#[tokio::test]
async fn test_credential_spelled_as_address_does_not_touch_that_address() {
    let (app, _) = memory_app(defaults(2, 100));

    let as_credential = |ip: &str| {
        Request::builder()
            .uri("/home")
            .header("API_KEY", "10.0.0.1")
            .extension(client(ip))
            .body(Body::empty())
            .unwrap()
    };
    for _ in 0..5 {
        let response = app.clone().oneshot(as_credential("10.6.6.6")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let request = Request::builder()
        .method("PUT")
        .uri("/admin/me")
        .header("content-type", "application/json")
        .header("API_KEY", "10.0.0.1")
        .extension(client("10.6.6.6"))
        .body(Body::from(json!({ "max_requests": 0 }).to_string()))
        .unwrap();
    assert_eq!(app.clone().oneshot(request).await.unwrap().status(), StatusCode::OK);

    // The real address still has its full address budget
    for remaining in ["1", "0"] {
        let response = app.clone().oneshot(get("/home", "10.0.0.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[LIMIT_HEADER], "2");
        assert_eq!(response.headers()[REMAINING_HEADER], remaining);
    }
    let response = app.oneshot(get("/home", "10.0.0.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_request_without_identity_is_rejected() {
    let (app, _) = memory_app(defaults(5, 100));

    let request = Request::builder().uri("/home").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "IDENTITY_UNRESOLVED");
}

#[tokio::test]
async fn test_store_failure_fails_closed() {
    let (app, _) = build_app(Arc::new(DownStore), defaults(5, 100), StoreFailureMode::FailClosed);

    let response = app.oneshot(get("/home", "10.0.0.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["code"], "STORE_UNAVAILABLE");
}

#[tokio::test]
async fn test_store_failure_fails_open_when_configured() {
    let (app, _) = build_app(Arc::new(DownStore), defaults(5, 100), StoreFailureMode::FailOpen);

    let response = app.oneshot(get("/home", "10.0.0.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(LIMIT_HEADER).is_none());
}

#[tokio::test]
async fn test_health_is_not_gated() {
    let (app, _) = memory_app(defaults(0, 0));

    for _ in 0..3 {
        let response = app.clone().oneshot(get("/health", "10.0.0.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = app.oneshot(get("/health", "10.0.0.1")).await.unwrap();
    assert_eq!(body_json(response).await["status"], "healthy");
}

#[tokio::test]
async fn test_admin_lists_policies_created_by_traffic() {
    let (app, _) = memory_app(defaults(5, 100));

    app.clone().oneshot(get("/home", "10.0.0.1")).await.unwrap();
    app.clone().oneshot(get("/home", "10.0.0.2")).await.unwrap();

    let response = app.oneshot(get("/admin/policies", "127.0.0.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let policies: Vec<LimitPolicy> = serde_json::from_value(body_json(response).await).unwrap();
    let mut identities: Vec<_> = policies.iter().map(|p| p.identity.as_str()).collect();
    identities.sort();
    assert_eq!(identities, vec!["10.0.0.1", "10.0.0.2"]);
}

#[tokio::test]
async fn test_admin_patch_by_policy_id_takes_effect() {
    let (app, limiter) = memory_app(defaults(5, 100));

    app.clone().oneshot(get("/home", "10.0.0.1")).await.unwrap();
    let policy = limiter
        .policies()
        .find_policy("10.0.0.1")
        .await
        .unwrap()
        .unwrap();

    let uri = format!("/admin/policies/{}", policy.policy_id);
    let response = app
        .clone()
        .oneshot(json_request("PATCH", &uri, "127.0.0.1", json!({ "max_requests": 0 })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let updated: LimitPolicy = serde_json::from_value(body_json(response).await).unwrap();
    assert_eq!(updated.max_requests, 0);
    assert_eq!(updated.window_seconds, 60);
    assert_eq!(updated.policy_id, policy.policy_id);

    let response = app.oneshot(get("/home", "10.0.0.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_admin_accepts_legacy_field_names() {
    let (app, limiter) = memory_app(defaults(5, 100));
    app.clone().oneshot(get("/home", "10.0.0.1")).await.unwrap();

    let response = app
        .oneshot(json_request(
            "PATCH",
            "/admin/identities/10.0.0.1",
            "127.0.0.1",
            json!({ "seconds": 30, "block_duration": 5 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let policy = limiter
        .policies()
        .find_policy("10.0.0.1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(policy.window_seconds, 30);
    assert_eq!(policy.block_seconds, 5);
    assert_eq!(policy.max_requests, 5);
}

#[tokio::test]
async fn test_admin_unknown_policy_is_not_found() {
    let (app, _) = memory_app(defaults(5, 100));

    let response = app
        .clone()
        .oneshot(get("/admin/policies/does-not-exist", "127.0.0.1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], "NOT_FOUND");

    let response = app
        .oneshot(json_request(
            "PATCH",
            "/admin/identities/10.9.9.9",
            "127.0.0.1",
            json!({ "max_requests": 1 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_rejects_invalid_patch() {
    let (app, limiter) = memory_app(defaults(5, 100));
    app.clone().oneshot(get("/home", "10.0.0.1")).await.unwrap();

    let response = app
        .oneshot(json_request(
            "PATCH",
            "/admin/identities/10.0.0.1",
            "127.0.0.1",
            json!({ "window_seconds": 0 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "INVALID_POLICY");

    let policy = limiter
        .policies()
        .find_policy("10.0.0.1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(policy.window_seconds, 60);
}

#[tokio::test]
async fn test_update_own_policy_creates_then_patches() {
    let (app, limiter) = memory_app(defaults(5, 100));

    let request = Request::builder()
        .method("PUT")
        .uri("/admin/me")
        .header("content-type", "application/json")
        .header("API_KEY", "key-xyz")
        .extension(client("10.0.0.1"))
        .body(Body::from(json!({ "max_requests": 7 }).to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let policy = limiter
        .policies()
        .find_policy("credential:key-xyz")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(policy.max_requests, 7);
    assert_eq!(policy.window_seconds, 60);

    // An empty patch leaves the stored policy alone
    let unchanged = limiter
        .policies()
        .set_policy("credential:key-xyz", &PolicyPatch::default())
        .await
        .unwrap();
    assert_eq!(unchanged, policy);
}

#[tokio::test]
async fn test_admin_reports_store_failure() {
    let (app, _) = build_app(Arc::new(DownStore), defaults(5, 100), StoreFailureMode::FailOpen);

    let response = app.oneshot(get("/admin/policies", "127.0.0.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
