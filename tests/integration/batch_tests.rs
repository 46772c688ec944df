//! Batch endpoint integration tests.
//!
//! Tests verify:
//! - Slots come back in request order
//! - A failing item does not affect its neighbours
//! - Oversized batches are rejected up front

use axum::http::StatusCode;
use serde_json::json;
use tower::ServiceExt;

use super::test_utils::{body_json, default_router, is_valid_webp, post_json, TEST_SLIDE};

fn batch_uri() -> String {
    format!("/api/tiles/{}/batch", TEST_SLIDE)
}

#[tokio::test]
async fn test_batch_preserves_order() {
    let router = default_router();
    let items: Vec<_> = (0..6).map(|x| json!({"layer": 2, "x": x, "y": 1})).collect();

    let response = router
        .oneshot(post_json(&batch_uri(), &json!(items)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let slots = body_json(response).await;
    let slots = slots.as_array().unwrap();
    assert_eq!(slots.len(), 6);
    for (x, slot) in slots.iter().enumerate() {
        assert_eq!(slot["ok"], true);
        assert_eq!(slot["cacheKey"], format!("{}:2:{}:1:0", TEST_SLIDE, x));
        assert_eq!(slot["contentType"], "image/webp");
        assert_eq!(slot["width"], 16);
        assert_eq!(slot["height"], 16);
        assert_eq!(slot["cacheHit"], false);

        let data = hex::decode(slot["data"].as_str().unwrap()).unwrap();
        assert!(is_valid_webp(&data));
    }
}

#[tokio::test]
async fn test_batch_isolates_failures() {
    let router = default_router();
    let items = json!([
        {"layer": 0, "x": 0, "y": 0},
        {"layer": 0, "x": 99, "y": 0},
        {"layer": 45, "x": 1, "y": 0},
        {"layer": 0, "x": 0, "y": 0, "format": "gif"},
        {"layer": 0, "x": 2, "y": 0, "format": "jpeg"},
    ]);

    let response = router.oneshot(post_json(&batch_uri(), &items)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let slots = body_json(response).await;
    let ok: Vec<bool> = slots
        .as_array()
        .unwrap()
        .iter()
        .map(|slot| slot["ok"].as_bool().unwrap())
        .collect();
    assert_eq!(ok, vec![true, false, false, false, true]);

    assert!(slots[1]["error"].as_str().unwrap().contains("Not found"));
    assert!(slots[2]["error"].as_str().unwrap().contains("focus layer"));
    assert!(slots[3]["error"].as_str().unwrap().contains("gif"));
    assert!(slots[1].get("data").is_none());
    assert_eq!(slots[4]["contentType"], "image/jpeg");
}

#[tokio::test]
async fn test_batch_uses_cache() {
    let router = default_router();
    let items = json!([{"layer": 3, "x": 1, "y": 1}]);

    router
        .clone()
        .oneshot(post_json(&batch_uri(), &items))
        .await
        .unwrap();
    let response = router.oneshot(post_json(&batch_uri(), &items)).await.unwrap();

    let slots = body_json(response).await;
    assert_eq!(slots[0]["cacheHit"], true);
}

#[tokio::test]
async fn test_batch_too_large() {
    let router = default_router();
    let items: Vec<_> = (0..101).map(|_| json!({"layer": 0})).collect();

    let response = router
        .oneshot(post_json(&batch_uri(), &json!(items)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "batch_too_large");
}

#[tokio::test]
async fn test_batch_at_limit_accepted() {
    let router = default_router();
    let items: Vec<_> = (0..100).map(|i| json!({"layer": i % 40, "x": i % 4})).collect();

    let response = router
        .oneshot(post_json(&batch_uri(), &json!(items)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let slots = body_json(response).await;
    assert_eq!(slots.as_array().unwrap().len(), 100);
    assert!(slots.as_array().unwrap().iter().all(|slot| slot["ok"] == true));
}

#[tokio::test]
async fn test_empty_batch() {
    let router = default_router();

    let response = router
        .oneshot(post_json(&batch_uri(), &json!([])))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!([]));
}
