//! Test utilities for integration tests.
//!
//! Mock slide archives, router builders, a scripted capture device and
//! response helpers shared by the integration tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use bytes::Bytes;
use http_body_util::BodyExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use cyto_viewer::compute::rgba_len;
use cyto_viewer::device::{decode_command, Opcode, COMMAND_HEADER_LEN};
use cyto_viewer::error::ArchiveError;
use cyto_viewer::{
    create_router, AppState, BufferPool, CaptureStore, ChainedArchive, CpuBackend,
    DeviceSettings, RouterConfig, ScannerSession, SlideArchive, TileCache, TileIdentity,
    TilePipeline,
};

/// Edge of the tiles served by test routers.
pub const TEST_TILE_SIZE: u32 = 16;

// =============================================================================
// Mock Slide Archive
// =============================================================================

/// Archive holding a fixed set of slides.
///
/// Every tile is a solid colour derived from its identity, so different
/// tiles encode to different bytes. Reads are counted.
pub struct MockArchive {
    slides: HashSet<String>,
    reads: Arc<AtomicUsize>,
    max_tile_x: u32,
}

impl MockArchive {
    pub fn new() -> Self {
        Self {
            slides: HashSet::new(),
            reads: Arc::new(AtomicUsize::new(0)),
            max_tile_x: 8,
        }
    }

    pub fn with_slide(mut self, slide_id: &str) -> Self {
        self.slides.insert(slide_id.to_string());
        self
    }

    /// Shared read counter, readable after the archive moves into a router.
    pub fn read_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.reads)
    }
}

#[async_trait]
impl SlideArchive for MockArchive {
    async fn read_tile(
        &self,
        identity: &TileIdentity,
        width: u32,
        height: u32,
    ) -> Result<Bytes, ArchiveError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if !self.slides.contains(identity.slide_id.as_ref()) || identity.tile_x >= self.max_tile_x
        {
            return Err(ArchiveError::NotFound(identity.cache_key()));
        }
        let pixel = [
            (identity.tile_x * 30) as u8,
            (identity.tile_y * 30) as u8,
            (identity.focus_layer * 6) as u8,
            255,
        ];
        let pixels: Vec<u8> = pixel
            .iter()
            .copied()
            .cycle()
            .take(rgba_len(width, height))
            .collect();
        Ok(Bytes::from(pixels))
    }

    /// Answers from the slide set; not counted as a read.
    async fn has_tile(
        &self,
        identity: &TileIdentity,
        _width: u32,
        _height: u32,
    ) -> Result<bool, ArchiveError> {
        Ok(self.slides.contains(identity.slide_id.as_ref()) && identity.tile_x < self.max_tile_x)
    }
}

// =============================================================================
// Router Builders
// =============================================================================

pub type TestArchive = ChainedArchive<Arc<CaptureStore>, MockArchive>;

/// Application state over `archive` with small tiles and a small cache.
pub fn test_state(archive: MockArchive) -> AppState<TestArchive> {
    let captures = Arc::new(CaptureStore::new(2));
    let pipeline = TilePipeline::new(
        ChainedArchive::new(Arc::clone(&captures), archive),
        TileCache::with_capacity(1024 * 1024),
        BufferPool::new(4, rgba_len(TEST_TILE_SIZE, TEST_TILE_SIZE)),
        Arc::new(CpuBackend::new()),
    );
    AppState::new(pipeline, captures)
        .with_batch_workers(2)
        .with_tile_size(TEST_TILE_SIZE)
}

/// Router without auth or tracing.
pub fn build_router(archive: MockArchive) -> Router {
    create_router(
        test_state(archive),
        RouterConfig::without_auth().with_tracing(false),
    )
}

/// Router with the default slide `slide_1700000000`.
pub fn default_router() -> Router {
    build_router(MockArchive::new().with_slide(TEST_SLIDE))
}

pub const TEST_SLIDE: &str = "slide_1700000000";

/// Router whose scanner routes talk to a device at `address`.
pub fn scanner_router(address: String) -> Router {
    let settings = DeviceSettings {
        address,
        connect_timeout: Duration::from_secs(2),
        read_timeout: Duration::from_secs(2),
        ..DeviceSettings::default()
    };
    let state = test_state(MockArchive::new()).with_scanner(ScannerSession::new(settings));
    create_router(state, RouterConfig::without_auth().with_tracing(false))
}

// =============================================================================
// Request Helpers
// =============================================================================

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn post_json(uri: &str, body: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let body = body_bytes(response).await;
    serde_json::from_slice(&body).unwrap()
}

/// Check that the data has a RIFF/WEBP container header.
pub fn is_valid_webp(data: &[u8]) -> bool {
    data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP"
}

/// Check that the data has JPEG SOI/EOI markers.
pub fn is_valid_jpeg(data: &[u8]) -> bool {
    data.len() >= 4
        && data[0] == 0xFF
        && data[1] == 0xD8
        && data[data.len() - 2] == 0xFF
        && data[data.len() - 1] == 0xD9
}

// =============================================================================
// Scripted Capture Device
// =============================================================================

/// Read one command frame from the device side of a connection.
pub async fn read_command(stream: &mut TcpStream) -> (Opcode, Vec<u8>) {
    let mut header = [0u8; COMMAND_HEADER_LEN];
    stream.read_exact(&mut header).await.unwrap();
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    let mut frame = header.to_vec();
    frame.resize(COMMAND_HEADER_LEN + len, 0);
    stream
        .read_exact(&mut frame[COMMAND_HEADER_LEN..])
        .await
        .unwrap();
    let (opcode, payload) = decode_command(&frame).unwrap();
    (opcode, payload.to_vec())
}

/// Send a length-prefixed response frame.
pub async fn respond(stream: &mut TcpStream, payload: &[u8]) {
    stream
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(payload).await.unwrap();
}

/// GET_LAYERS payload describing `layers`, each `width × height`.
pub fn layer_info_payload(layers: &[u32], width: u32, height: u32) -> Vec<u8> {
    let mut payload = (layers.len() as u32).to_be_bytes().to_vec();
    for &layer in layers {
        for value in [layer, width, height, layer * 500, TEST_TILE_SIZE] {
            payload.extend_from_slice(&value.to_be_bytes());
        }
    }
    payload
}

/// One scan block: 32-byte header and uncompressed RGBA data.
pub fn layer_block(layer: u32, width: u32, height: u32) -> Vec<u8> {
    let data: Vec<u8> = [layer as u8, 0x40, 0x80, 255]
        .iter()
        .copied()
        .cycle()
        .take(rgba_len(width, height))
        .collect();
    let mut block = Vec::with_capacity(32 + data.len());
    for value in [
        layer,
        width,
        height,
        width.div_ceil(TEST_TILE_SIZE),
        height.div_ceil(TEST_TILE_SIZE),
        TEST_TILE_SIZE,
    ] {
        block.extend_from_slice(&value.to_be_bytes());
    }
    block.extend_from_slice(&[0, 0, 0, 0]);
    block.extend_from_slice(&(data.len() as u32).to_be_bytes());
    block.extend_from_slice(&data);
    block
}

/// Accept one connection, answer the session handshake and layer query,
/// then hand the stream to `script`.
pub async fn spawn_device<F, Fut>(layers: Vec<u32>, script: F) -> (String, JoinHandle<()>)
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        assert_eq!(read_command(&mut stream).await.0, Opcode::Connect);
        assert_eq!(read_command(&mut stream).await.0, Opcode::GetLayers);
        respond(&mut stream, &layer_info_payload(&layers, 32, 32)).await;
        script(stream).await;
    });
    (address, handle)
}
