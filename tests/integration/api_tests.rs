//! API integration tests for tile retrieval and error handling.
//!
//! Tests verify:
//! - Tile retrieval with response headers and caching
//! - ETag revalidation
//! - Error cases (bad layer, bad format, missing tile)
//! - Health, stats and captured slide routes

use std::sync::atomic::Ordering;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use super::test_utils::{
    body_bytes, body_json, build_router, default_router, get, is_valid_jpeg, is_valid_webp,
    MockArchive, TEST_SLIDE,
};

// =============================================================================
// Basic Tile Retrieval
// =============================================================================

#[tokio::test]
async fn test_tile_retrieval_success() {
    let router = default_router();

    let response = router
        .oneshot(get(&format!("/api/tiles/{}?layer=3&x=1&y=2&z=0", TEST_SLIDE)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers.get("content-type").unwrap(), "image/webp");
    assert_eq!(
        headers.get("cache-control").unwrap(),
        "public, max-age=31536000, immutable"
    );
    assert_eq!(
        headers.get("etag").unwrap().to_str().unwrap(),
        format!("\"{}:3:1:2:0\"", TEST_SLIDE)
    );
    assert_eq!(headers.get("x-tile-cache-hit").unwrap(), "false");
    assert!(headers
        .get("x-processing-time")
        .unwrap()
        .to_str()
        .unwrap()
        .ends_with("ms"));

    let body = body_bytes(response).await;
    assert!(is_valid_webp(&body), "Response should be a WebP image");
}

#[tokio::test]
async fn test_tile_retrieval_jpeg() {
    let router = default_router();

    let response = router
        .oneshot(get(&format!(
            "/api/tiles/{}?layer=0&x=0&y=0&format=jpeg&quality=50",
            TEST_SLIDE
        )))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("content-type").unwrap(), "image/jpeg");
    let body = body_bytes(response).await;
    assert!(is_valid_jpeg(&body));
}

#[tokio::test]
async fn test_second_request_hits_cache() {
    let archive = MockArchive::new().with_slide(TEST_SLIDE);
    let reads = archive.read_counter();
    let router = build_router(archive);
    let uri = format!("/api/tiles/{}?layer=5&x=2&y=2", TEST_SLIDE);

    let first = router.clone().oneshot(get(&uri)).await.unwrap();
    assert_eq!(first.headers().get("x-tile-cache-hit").unwrap(), "false");
    let first_body = body_bytes(first).await;

    let second = router.clone().oneshot(get(&uri)).await.unwrap();
    assert_eq!(second.headers().get("x-tile-cache-hit").unwrap(), "true");
    let second_body = body_bytes(second).await;

    assert_eq!(first_body, second_body);
    assert_eq!(reads.load(Ordering::SeqCst), 1);

    let stats = body_json(router.oneshot(get("/api/system/stats")).await.unwrap()).await;
    assert_eq!(stats["cache"]["hits"], 1);
    assert_eq!(stats["cache"]["misses"], 1);
    assert_eq!(stats["cache"]["tiles"], 1);
    assert_eq!(stats["cache"]["size"], first_body.len());
    assert_eq!(stats["cache"]["hitRate"], 0.5);
    assert_eq!(stats["compute_backend"], "cpu");
    assert_eq!(stats["pool_buffers_in_use"], 0);
}

#[tokio::test]
async fn test_coordinates_default_to_zero() {
    let router = default_router();

    let response = router
        .oneshot(get(&format!("/api/tiles/{}", TEST_SLIDE)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("etag").unwrap().to_str().unwrap(),
        format!("\"{}:0:0:0:0\"", TEST_SLIDE)
    );
}

#[tokio::test]
async fn test_focus_stack_reads_each_layer() {
    let archive = MockArchive::new().with_slide(TEST_SLIDE);
    let reads = archive.read_counter();
    let router = build_router(archive);

    let response = router
        .oneshot(get(&format!("/api/tiles/{}?x=1&y=1&stack=2,3,4", TEST_SLIDE)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("etag").unwrap().to_str().unwrap(),
        format!("\"{}:0:1:1:0|stack:2@1,3@1,4@1\"", TEST_SLIDE)
    );
    assert_eq!(reads.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_invalid_focus_stack_rejected() {
    let router = default_router();

    let response = router
        .oneshot(get(&format!("/api/tiles/{}?stack=2@heavy", TEST_SLIDE)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// =============================================================================
// ETag Revalidation
// =============================================================================

#[tokio::test]
async fn test_matching_etag_returns_not_modified() {
    let archive = MockArchive::new().with_slide(TEST_SLIDE);
    let reads = archive.read_counter();
    let router = build_router(archive);

    let request = Request::builder()
        .uri(format!("/api/tiles/{}?layer=1&x=1&y=1", TEST_SLIDE))
        .header("if-none-match", format!("\"{}:1:1:1:0\"", TEST_SLIDE))
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert!(response.headers().contains_key("etag"));
    assert!(body_bytes(response).await.is_empty());
    // Nothing was rendered
    assert_eq!(reads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_matching_etag_for_missing_tile_returns_404() {
    let router = default_router();

    let request = Request::builder()
        .uri("/api/tiles/nonexistent?layer=1&x=1&y=1")
        .header("if-none-match", "\"nonexistent:1:1:1:0\"")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stale_etag_renders_tile() {
    let router = default_router();

    let request = Request::builder()
        .uri(format!("/api/tiles/{}?layer=1&x=1&y=1", TEST_SLIDE))
        .header("if-none-match", "\"other:0:0:0:0\"")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

// =============================================================================
// Error Cases
// =============================================================================

#[tokio::test]
async fn test_invalid_layer_rejected() {
    let archive = MockArchive::new().with_slide(TEST_SLIDE);
    let reads = archive.read_counter();
    let router = build_router(archive);

    let response = router
        .oneshot(get(&format!("/api/tiles/{}?layer=40", TEST_SLIDE)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error = body_json(response).await;
    assert_eq!(error["error"], "invalid_layer");
    assert_eq!(error["status"], 400);
    assert_eq!(reads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_invalid_format_rejected() {
    let router = default_router();

    let response = router
        .oneshot(get(&format!("/api/tiles/{}?format=png", TEST_SLIDE)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "invalid_format");
}

#[tokio::test]
async fn test_invalid_quality_rejected() {
    let router = default_router();

    let response = router
        .oneshot(get(&format!("/api/tiles/{}?quality=101", TEST_SLIDE)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "invalid_quality");
}

#[tokio::test]
async fn test_missing_slide_returns_404() {
    let router = default_router();

    let response = router
        .oneshot(get("/api/tiles/nonexistent?layer=0"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error"], "not_found");
}

#[tokio::test]
async fn test_out_of_range_tile_returns_404() {
    let router = default_router();

    let response = router
        .oneshot(get(&format!("/api/tiles/{}?x=500", TEST_SLIDE)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_failed_tile_not_cached() {
    let router = default_router();
    let uri = "/api/tiles/nonexistent?layer=0";

    router.clone().oneshot(get(uri)).await.unwrap();
    router.clone().oneshot(get(uri)).await.unwrap();

    let stats = body_json(router.oneshot(get("/api/system/stats")).await.unwrap()).await;
    assert_eq!(stats["cache"]["tiles"], 0);
    assert_eq!(stats["cache"]["size"], 0);
}

// =============================================================================
// System Routes
// =============================================================================

#[tokio::test]
async fn test_health_without_device() {
    let router = default_router();

    let response = router.oneshot(get("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let health = body_json(response).await;
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["version"], env!("CARGO_PKG_VERSION"));
    assert!(health.get("device").is_none());
}

#[tokio::test]
async fn test_scanner_routes_disabled_without_device() {
    let router = default_router();

    let response = router.oneshot(get("/api/scanner/status")).await.unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["error"], "device_disabled");
}

#[tokio::test]
async fn test_slides_empty_and_missing() {
    let router = default_router();

    let response = router.clone().oneshot(get("/api/slides")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, serde_json::json!([]));

    let response = router.clone().oneshot(get("/api/slides/missing")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let request = Request::builder()
        .method("DELETE")
        .uri("/api/slides/missing")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_route_returns_404() {
    let router = default_router();

    let response = router.oneshot(get("/api/unknown")).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
