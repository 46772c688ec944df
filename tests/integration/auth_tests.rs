//! Authentication integration tests.
//!
//! Tests verify:
//! - Login issues a bearer token and a session cookie
//! - Protected routes accept either and reject everything else
//! - Logout revokes the token
//! - Public routes stay public

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::json;
use tower::ServiceExt;

use cyto_viewer::{create_router, RouterConfig, SessionAuth};

use super::test_utils::{body_json, get, post_json, test_state, MockArchive, TEST_SLIDE};

const TEST_SECRET: &str = "test-secret-key-for-hmac-signing";
const TEST_PASSWORD: &str = "correct horse";

fn auth() -> SessionAuth {
    SessionAuth::new(TEST_SECRET).with_password(TEST_PASSWORD)
}

fn protected_router() -> Router {
    let state = test_state(MockArchive::new().with_slide(TEST_SLIDE));
    create_router(state, RouterConfig::new(auth()).with_tracing(false))
}

fn tile_uri() -> String {
    format!("/api/tiles/{}?layer=0&x=0&y=0", TEST_SLIDE)
}

fn with_bearer(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("authorization", format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap()
}

async fn login(router: &Router) -> String {
    let response = router
        .clone()
        .oneshot(post_json(
            "/api/login",
            &json!({"username": "cytotech", "password": TEST_PASSWORD}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await["token"]
        .as_str()
        .unwrap()
        .to_string()
}

// =============================================================================
// Login
// =============================================================================

#[tokio::test]
async fn test_login_sets_cookie_and_returns_token() {
    let router = protected_router();

    let response = router
        .oneshot(post_json(
            "/api/login",
            &json!({"username": "cytotech", "password": TEST_PASSWORD}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response
        .headers()
        .get("set-cookie")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(cookie.starts_with("auth_token=cytotech."));
    assert!(cookie.contains("HttpOnly"));

    let body = body_json(response).await;
    assert!(body["token"].as_str().unwrap().starts_with("cytotech."));
    assert!(body["expires_at"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn test_login_wrong_password() {
    let router = protected_router();

    let response = router
        .oneshot(post_json(
            "/api/login",
            &json!({"username": "cytotech", "password": "guess"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"], "invalid_credentials");
}

#[tokio::test]
async fn test_login_route_absent_without_auth() {
    let router = super::test_utils::default_router();

    let response = router
        .oneshot(post_json(
            "/api/login",
            &json!({"username": "cytotech", "password": "x"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// =============================================================================
// Protected Routes
// =============================================================================

#[tokio::test]
async fn test_missing_token_rejected() {
    let router = protected_router();

    let response = router.oneshot(get(&tile_uri())).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"], "missing_token");
}

#[tokio::test]
async fn test_bearer_token_accepted() {
    let router = protected_router();
    let token = login(&router).await;

    let response = router
        .oneshot(with_bearer(&tile_uri(), &token))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_cookie_token_accepted() {
    let router = protected_router();
    let token = login(&router).await;

    let request = Request::builder()
        .uri("/api/system/stats")
        .header("cookie", format!("theme=dark; auth_token={}", token))
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_token_from_other_secret_rejected() {
    let router = protected_router();
    let (token, _) = SessionAuth::new("some-other-secret").issue("cytotech");

    let response = router
        .oneshot(with_bearer(&tile_uri(), &token))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"], "invalid_signature");
}

#[tokio::test]
async fn test_expired_token_rejected() {
    let router = protected_router();
    let token = auth().issue_with_expiry("cytotech", 1_000);

    let response = router
        .oneshot(with_bearer(&tile_uri(), &token))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"], "session_expired");
}

#[tokio::test]
async fn test_malformed_token_rejected() {
    let router = protected_router();

    let response = router
        .oneshot(with_bearer(&tile_uri(), "not-a-token"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_issued_token_with_short_ttl() {
    let auth = SessionAuth::new(TEST_SECRET).with_ttl(Duration::from_secs(60));
    let state = test_state(MockArchive::new().with_slide(TEST_SLIDE));
    let router = create_router(state, RouterConfig::new(auth.clone()).with_tracing(false));
    let (token, _) = auth.issue("cytotech");

    let response = router
        .oneshot(with_bearer(&tile_uri(), &token))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

// =============================================================================
// Logout
// =============================================================================

#[tokio::test]
async fn test_logout_revokes_token() {
    let router = protected_router();
    let token = login(&router).await;

    let request = Request::builder()
        .method("POST")
        .uri("/api/logout")
        .header("authorization", format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let cookie = response.headers().get("set-cookie").unwrap().to_str().unwrap();
    assert!(cookie.contains("Max-Age=0"));

    let response = router
        .oneshot(with_bearer(&tile_uri(), &token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"], "session_revoked");
}

// =============================================================================
// Public Routes
// =============================================================================

#[tokio::test]
async fn test_health_is_public() {
    let router = protected_router();

    let response = router.oneshot(get("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}
