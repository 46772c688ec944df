//! Scanner route integration tests against a scripted device.
//!
//! Tests verify:
//! - Status and layer queries go through one device session
//! - A completed scan is stored and immediately servable
//! - Deleting a captured slide drops its cached tiles
//! - Device failures map to 503 and the next request reconnects

use axum::http::StatusCode;
use serde_json::json;
use tower::ServiceExt;

use cyto_viewer::device::{decode_scan_payload, Opcode};

use super::test_utils::{
    body_json, get, is_valid_webp, layer_block, post_json, read_command, respond,
    scanner_router, spawn_device, TEST_TILE_SIZE,
};

fn status_payload(current_layer: u32) -> Vec<u8> {
    let mut payload = 2150u32.to_be_bytes().to_vec();
    payload.push(1);
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.extend_from_slice(&current_layer.to_be_bytes());
    payload
}

#[tokio::test]
async fn test_status_and_layers() {
    let (address, device) = spawn_device(vec![0, 1, 2], |mut stream| async move {
        assert_eq!(read_command(&mut stream).await.0, Opcode::Status);
        respond(&mut stream, &status_payload(2)).await;
    })
    .await;
    let router = scanner_router(address);

    let response = router.clone().oneshot(get("/api/scanner/status")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let status = body_json(response).await;
    assert_eq!(status["ready"], true);
    assert_eq!(status["current_layer"], 2);
    assert_eq!(status["temperature_celsius"], 21.5);

    // Layer info was fetched when the session opened
    let response = router.clone().oneshot(get("/api/scanner/layers")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let layers = body_json(response).await;
    assert_eq!(layers.as_array().unwrap().len(), 3);
    assert_eq!(layers[1]["layer_index"], 1);
    assert_eq!(layers[1]["focus_depth_microns"], 0.5);

    let health = body_json(router.oneshot(get("/health")).await.unwrap()).await;
    assert_eq!(health["device"], "connected");

    device.await.unwrap();
}

#[tokio::test]
async fn test_scan_stores_servable_slide() {
    let (address, device) = spawn_device(vec![4, 9], |mut stream| async move {
        let (opcode, payload) = read_command(&mut stream).await;
        assert_eq!(opcode, Opcode::Scan);
        let request = decode_scan_payload(&payload).unwrap();
        assert_eq!(request.layers, vec![4, 9]);

        use tokio::io::AsyncWriteExt;
        for layer in request.layers {
            stream
                .write_all(&layer_block(layer, request.width, request.height))
                .await
                .unwrap();
        }
    })
    .await;
    let router = scanner_router(address);

    let response = router
        .clone()
        .oneshot(post_json(
            "/api/scanner/scan",
            &json!({"start_x": 0, "start_y": 0, "width": 24, "height": 20, "layers": [4, 9]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let info = body_json(response).await;
    let slide_id = info["slide_id"].as_str().unwrap().to_string();
    assert!(slide_id.starts_with("slide_"));
    assert_eq!(info["layers"], json!([4, 9]));
    assert_eq!(info["width"], 24);
    device.await.unwrap();

    // Captured slide is listed and served at zoom 0
    let slides = body_json(router.clone().oneshot(get("/api/slides")).await.unwrap()).await;
    assert_eq!(slides[0]["slide_id"], slide_id.as_str());

    let response = router
        .clone()
        .oneshot(get(&format!("/api/tiles/{}?layer=9&x=1&y=1", slide_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = super::test_utils::body_bytes(response).await;
    assert!(is_valid_webp(&body));

    // Past the captured area
    let beyond = 24 / TEST_TILE_SIZE + 1;
    let response = router
        .clone()
        .oneshot(get(&format!("/api/tiles/{}?layer=9&x={}", slide_id, beyond)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let request = axum::http::Request::builder()
        .method("DELETE")
        .uri(format!("/api/slides/{}", slide_id))
        .body(axum::body::Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // The tile served above was cached; deletion must drop it too
    let tile_uri = format!("/api/tiles/{}?layer=9&x=1&y=1", slide_id);
    let response = router.clone().oneshot(get(&tile_uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let request = axum::http::Request::builder()
        .uri(&tile_uri)
        .header("if-none-match", format!("\"{}:9:1:1:0\"", slide_id))
        .body(axum::body::Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_scans_in_one_second_get_distinct_slides() {
    let (address, device) = spawn_device(vec![1], |mut stream| async move {
        use tokio::io::AsyncWriteExt;
        for _ in 0..2 {
            let (opcode, payload) = read_command(&mut stream).await;
            assert_eq!(opcode, Opcode::Scan);
            let request = decode_scan_payload(&payload).unwrap();
            stream
                .write_all(&layer_block(1, request.width, request.height))
                .await
                .unwrap();
        }
    })
    .await;
    let router = scanner_router(address);
    let body = json!({"start_x": 0, "start_y": 0, "width": 16, "height": 16, "layers": [1]});

    let mut ids = Vec::new();
    for _ in 0..2 {
        let response = router
            .clone()
            .oneshot(post_json("/api/scanner/scan", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        ids.push(body_json(response).await["slide_id"].as_str().unwrap().to_string());
    }
    device.await.unwrap();

    assert_ne!(ids[0], ids[1]);
    let slides = body_json(router.oneshot(get("/api/slides")).await.unwrap()).await;
    assert_eq!(slides.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_scan_request_validated_before_device() {
    // Nothing is listening; validation must fail first
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);
    let router = scanner_router(address);

    let response = router
        .clone()
        .oneshot(post_json(
            "/api/scanner/scan",
            &json!({"start_x": 0, "start_y": 0, "width": 0, "height": 10, "layers": [1]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = router
        .oneshot(post_json("/api/scanner/focus", &json!({"layer": 40})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "invalid_layer");
}

#[tokio::test]
async fn test_unreachable_device_is_unavailable() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);
    let router = scanner_router(address);

    let response = router.clone().oneshot(get("/api/scanner/status")).await.unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["error"], "device_unavailable");

    let health = body_json(router.oneshot(get("/health")).await.unwrap()).await;
    assert_eq!(health["device"], "disconnected");
}

#[tokio::test]
async fn test_focus_and_calibrate() {
    let (address, device) = spawn_device(vec![0], |mut stream| async move {
        let (opcode, payload) = read_command(&mut stream).await;
        assert_eq!(opcode, Opcode::SetFocus);
        assert_eq!(payload, 17u32.to_be_bytes());
        assert_eq!(read_command(&mut stream).await.0, Opcode::Calibrate);
    })
    .await;
    let router = scanner_router(address);

    let response = router
        .clone()
        .oneshot(post_json("/api/scanner/focus", &json!({"layer": 17})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = router
        .oneshot(post_json("/api/scanner/calibrate", &json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    device.await.unwrap();
}
