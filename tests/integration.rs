use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use haul_dispatch::api::rest::router;
use haul_dispatch::auth::Role;
use haul_dispatch::config::Config;
use haul_dispatch::state::AppState;
use haul_dispatch::store::Store;
use serde_json::Value;
use tower::ServiceExt;

async fn setup() -> (axum::Router, Arc<AppState>) {
    let store = Store::connect("sqlite::memory:").await.unwrap();
    let state = Arc::new(AppState::new(Config::for_tests(), store));
    (router(state.clone()), state)
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn ws_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header("host", "localhost")
        .header("connection", "upgrade")
        .header("upgrade", "websocket")
        .header("sec-websocket-version", "13")
        .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
        .extension(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40_001))))
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn health_returns_ok() {
    let (app, _state) = setup().await;
    let response = app.oneshot(get_request("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["drivers"], 0);
    assert_eq!(body["customers"], 0);
    assert_eq!(body["room_memberships"], 0);
    assert_eq!(body["pending_approvals"], 0);
}

#[tokio::test]
async fn metrics_returns_prometheus_format() {
    let (app, _state) = setup().await;
    let response = app.oneshot(get_request("/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.contains("text/plain"));

    let body = body_string(response).await;
    assert!(body.contains("drivers_connected"));
    assert!(body.contains("customers_connected"));
}

#[tokio::test]
async fn ws_rejects_a_bad_token() {
    let (app, _state) = setup().await;
    let response = app
        .oneshot(ws_request("/ws?token=not-a-jwt"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let body = body_json(response).await;
    assert_eq!(body["kind"], "auth");
}

#[tokio::test]
async fn ws_rejects_a_refresh_token_offered_as_access() {
    let (app, state) = setup().await;
    let refresh = state.auth.issue_refresh(7, Role::Driver).unwrap();
    let response = app
        .oneshot(ws_request(&format!("/ws?token={refresh}")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn ws_passes_a_valid_token_through_the_auth_gate() {
    let (app, state) = setup().await;
    let token = state.auth.issue_access(7, Role::Driver).unwrap();
    let response = app
        .oneshot(ws_request(&format!("/ws?token={token}")))
        .await
        .unwrap();

    // oneshot requests carry no upgradable connection, so a valid token
    // stops at 426 instead of 401
    assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED);
}
