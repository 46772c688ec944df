//! HTTP request handlers for the viewer API.
//!
//! # Endpoints
//!
//! - `GET /api/tiles/{slide_id}` - Serve one tile
//! - `POST /api/tiles/{slide_id}/batch` - Serve up to 100 tiles as JSON
//! - `GET /api/slides`, `GET|DELETE /api/slides/{slide_id}` - Captured slides
//! - `GET /api/scanner/status`, `GET /api/scanner/layers` - Device queries
//! - `POST /api/scanner/scan|focus|calibrate` - Device commands
//! - `GET /api/system/stats` - Cache counters and uptime
//! - `POST /api/login`, `POST /api/logout` - Session management
//! - `GET /health` - Health check endpoint

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::device::{DeviceStatus, LayerInfo, ScanRequest, ScannerSession};
use crate::error::{ArchiveError, DeviceError, PoolError, TileError};
use crate::slide::{CaptureStore, CapturedSlideInfo, SlideArchive};
use crate::tile::{
    BatchCoordinator, FocusComposite, TileFormat, TileIdentity, TilePipeline, TileRequest,
    DEFAULT_BATCH_WORKERS, DEFAULT_TILE_SIZE, MAX_BATCH_SIZE, MAX_FOCUS_LAYER,
};

use super::auth::{clear_cookie, session_cookie, token_from_headers, AuthError, SessionAuth};

/// Tiles never change once rendered for a given key.
pub const TILE_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

/// Header reporting whether the tile came from cache.
pub const X_TILE_CACHE_HIT: HeaderName = HeaderName::from_static("x-tile-cache-hit");

/// Header reporting how long the request took to serve.
pub const X_PROCESSING_TIME: HeaderName = HeaderName::from_static("x-processing-time");

// =============================================================================
// Application State
// =============================================================================

/// Shared application state.
///
/// This is passed to all handlers via Axum's State extractor.
pub struct AppState<A: SlideArchive + 'static> {
    /// The tile pipeline for single-tile requests
    pub pipeline: Arc<TilePipeline<A>>,

    /// Fan-out over the same pipeline for batch requests
    pub batch: Arc<BatchCoordinator<A>>,

    /// Slides captured since startup
    pub captures: Arc<CaptureStore>,

    /// Capture device, `None` when no device is configured
    pub scanner: Option<Arc<ScannerSession>>,

    /// Session authentication, `None` when auth is disabled. Set by
    /// [`create_router`](super::routes::create_router) from its config.
    pub auth: Option<SessionAuth>,

    /// Edge length of served tiles in pixels
    pub tile_size: u32,

    /// When the server started, for uptime reporting
    pub started_at: Instant,
}

impl<A: SlideArchive + 'static> AppState<A> {
    /// Create state around a pipeline, with the default batch width and no
    /// device or auth.
    pub fn new(pipeline: TilePipeline<A>, captures: Arc<CaptureStore>) -> Self {
        let pipeline = Arc::new(pipeline);
        Self {
            batch: Arc::new(BatchCoordinator::new(
                Arc::clone(&pipeline),
                DEFAULT_BATCH_WORKERS,
            )),
            pipeline,
            captures,
            scanner: None,
            auth: None,
            tile_size: DEFAULT_TILE_SIZE,
            started_at: Instant::now(),
        }
    }

    /// Set how many tiles of one batch render concurrently.
    pub fn with_batch_workers(mut self, workers: usize) -> Self {
        self.batch = Arc::new(BatchCoordinator::new(Arc::clone(&self.pipeline), workers));
        self
    }

    pub fn with_scanner(mut self, scanner: ScannerSession) -> Self {
        self.scanner = Some(Arc::new(scanner));
        self
    }

    pub fn with_tile_size(mut self, tile_size: u32) -> Self {
        self.tile_size = tile_size;
        self
    }

    fn scanner(&self) -> Result<&ScannerSession, ApiError> {
        self.scanner.as_deref().ok_or(ApiError::DeviceDisabled)
    }
}

impl<A: SlideArchive + 'static> Clone for AppState<A> {
    fn clone(&self) -> Self {
        Self {
            pipeline: Arc::clone(&self.pipeline),
            batch: Arc::clone(&self.batch),
            captures: Arc::clone(&self.captures),
            scanner: self.scanner.clone(),
            auth: self.auth.clone(),
            tile_size: self.tile_size,
            started_at: self.started_at,
        }
    }
}

// =============================================================================
// Request Parameters
// =============================================================================

/// Query parameters for tile requests.
///
/// Missing coordinates default to 0; missing format and quality default to
/// WebP at 85.
#[derive(Debug, Default, Deserialize)]
pub struct TileQueryParams {
    /// Focus layer (0-39)
    #[serde(default)]
    pub layer: u32,

    /// Tile X coordinate
    #[serde(default)]
    pub x: u32,

    /// Tile Y coordinate
    #[serde(default)]
    pub y: u32,

    /// Zoom level
    #[serde(default)]
    pub z: u32,

    /// `jpeg`, `webp` or `avif`
    #[serde(default)]
    pub format: Option<String>,

    /// Encoder quality (1-100), 0 or absent for the default
    #[serde(default)]
    pub quality: Option<u32>,

    /// Focus layers to blend instead of `layer`: `2,3,4` or `2@0.5,3@0.5`
    #[serde(default)]
    pub stack: Option<String>,
}

impl TileQueryParams {
    /// Build a pipeline request for a `tile_size × tile_size` tile.
    pub fn into_request(self, slide_id: &str, tile_size: u32) -> Result<TileRequest, TileError> {
        let identity = TileIdentity::new(slide_id, self.layer, self.x, self.y, self.z);
        let mut request = TileRequest::new(identity).with_size(tile_size, tile_size);
        if let Some(format) = TileFormat::parse_optional(self.format.as_deref())? {
            request = request.with_format(format);
        }
        if let Some(quality) = self.quality {
            request = request.with_quality(quality);
        }
        if let Some(stack) = self.stack.as_deref() {
            request = request.with_composite(FocusComposite::parse(stack)?);
        }
        Ok(request)
    }
}

/// Body of `POST /api/scanner/focus`.
#[derive(Debug, Deserialize)]
pub struct FocusRequest {
    pub layer: u32,
}

/// Body of `POST /api/login`.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

// =============================================================================
// Response Types
// =============================================================================

/// JSON error response returned for all error conditions.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error type identifier (e.g., "not_found", "invalid_layer")
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// HTTP status code (included for convenience)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ErrorResponse {
    /// Create a new error response.
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: None,
        }
    }

    /// Create a new error response with status code.
    pub fn with_status(
        error: impl Into<String>,
        message: impl Into<String>,
        status: StatusCode,
    ) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: Some(status.as_u16()),
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service version
    pub version: String,

    /// Device connection state, absent when no device is configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

/// One slot of a batch response.
///
/// Successful slots carry the tile hex-encoded in `data`; failed slots carry
/// only `error`.
#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchTileSlot {
    pub ok: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<&'static str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_hit: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchTileSlot {
    fn failed(error: &TileError) -> Self {
        Self {
            ok: false,
            cache_key: None,
            content_type: None,
            width: None,
            height: None,
            cache_hit: None,
            data: None,
            error: Some(error.to_string()),
        }
    }
}

/// Cache section of the stats response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatsResponse {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,

    /// Resident bytes
    pub size: usize,

    /// Number of cached tiles
    pub tiles: usize,

    /// Capacity in bytes
    pub capacity: usize,
}

/// Response from `GET /api/system/stats`.
#[derive(Debug, Serialize)]
pub struct SystemStatsResponse {
    pub cache: CacheStatsResponse,
    pub uptime_secs: u64,
    pub compute_backend: &'static str,
    pub pool_buffers_in_use: usize,
}

/// Response from `POST /api/login`.
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: u64,
}

// =============================================================================
// Error Mapping
// =============================================================================

/// Build a JSON error response, logging by severity.
///
/// - 5xx errors are logged at ERROR level
/// - 404s are logged at DEBUG level (common and expected)
/// - other 4xx errors are logged at WARN level
pub(crate) fn error_response(
    status: StatusCode,
    error_type: &str,
    message: impl Into<String>,
) -> Response {
    let message = message.into();
    if status.is_server_error() {
        error!(
            error_type = error_type,
            status = status.as_u16(),
            "Server error: {}",
            message
        );
    } else if status == StatusCode::NOT_FOUND {
        debug!(
            error_type = error_type,
            status = status.as_u16(),
            "Resource not found: {}",
            message
        );
    } else if status.is_client_error() {
        warn!(
            error_type = error_type,
            status = status.as_u16(),
            "Client error: {}",
            message
        );
    }

    let error_response = ErrorResponse::with_status(error_type, message, status);
    (status, Json(error_response)).into_response()
}

/// Convert TileError to HTTP response.
impl IntoResponse for TileError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            // 400 Bad Request - Invalid parameters
            TileError::InvalidLayer { .. } => (StatusCode::BAD_REQUEST, "invalid_layer"),
            TileError::InvalidQuality { .. } => (StatusCode::BAD_REQUEST, "invalid_quality"),
            TileError::InvalidFormat { .. } => (StatusCode::BAD_REQUEST, "invalid_format"),
            TileError::InvalidSize { .. } => (StatusCode::BAD_REQUEST, "invalid_size"),
            TileError::InvalidComposite(_) => (StatusCode::BAD_REQUEST, "invalid_composite"),
            TileError::BatchTooLarge { .. } => (StatusCode::BAD_REQUEST, "batch_too_large"),

            TileError::Archive(ArchiveError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            TileError::Archive(ArchiveError::Corrupt { .. }) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "corrupt_tile")
            }
            TileError::Archive(ArchiveError::Io(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "io_error")
            }

            TileError::Pool(PoolError::Closed) => {
                (StatusCode::SERVICE_UNAVAILABLE, "shutting_down")
            }
            TileError::Pool(_) => (StatusCode::INTERNAL_SERVER_ERROR, "pool_error"),

            // 500 Internal Server Error - processing errors
            TileError::Compute(_) => (StatusCode::INTERNAL_SERVER_ERROR, "compute_error"),
            TileError::EncodeError { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "encode_error"),
            TileError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        error_response(status, error_type, self.to_string())
    }
}

/// Convert DeviceError to HTTP response.
///
/// A device that cannot be reached or drops the link is reported as 503 so
/// the viewer can retry later; protocol violations are 502.
impl IntoResponse for DeviceError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            DeviceError::Io(_) | DeviceError::Closed { .. } | DeviceError::Timeout { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "device_unavailable")
            }
            DeviceError::Framing(_) => (StatusCode::BAD_GATEWAY, "device_protocol_error"),
            DeviceError::InvalidState { .. } => (StatusCode::CONFLICT, "device_busy"),
            DeviceError::Cancelled(_) => (StatusCode::GATEWAY_TIMEOUT, "scan_cancelled"),
            DeviceError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "device_config"),
        };

        error_response(status, error_type, self.to_string())
    }
}

/// Errors returned by handlers.
#[derive(Debug)]
pub enum ApiError {
    Tile(TileError),
    Device(DeviceError),
    Auth(AuthError),

    /// No device configured
    DeviceDisabled,

    /// No captured slide with this id
    SlideNotFound(String),

    /// Request body failed validation
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Tile(e) => e.into_response(),
            ApiError::Device(e) => e.into_response(),
            ApiError::Auth(e) => e.into_response(),
            ApiError::DeviceDisabled => error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "device_disabled",
                "No capture device is configured",
            ),
            ApiError::SlideNotFound(slide_id) => error_response(
                StatusCode::NOT_FOUND,
                "not_found",
                format!("Slide not found: {}", slide_id),
            ),
            ApiError::BadRequest(message) => {
                error_response(StatusCode::BAD_REQUEST, "invalid_request", message)
            }
        }
    }
}

impl From<TileError> for ApiError {
    fn from(err: TileError) -> Self {
        ApiError::Tile(err)
    }
}

impl From<DeviceError> for ApiError {
    fn from(err: DeviceError) -> Self {
        ApiError::Device(err)
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        ApiError::Auth(err)
    }
}

// =============================================================================
// Tile Handlers
// =============================================================================

/// Handle tile requests.
///
/// # Endpoint
///
/// `GET /api/tiles/{slide_id}?layer=&x=&y=&z=&format=&quality=&stack=`
///
/// # Response
///
/// - `200 OK`: encoded tile
/// - `304 Not Modified`: `If-None-Match` matches the tile's ETag and the tile
///   still exists; nothing is rendered
/// - `400 Bad Request`: invalid layer, format, quality or size
/// - `404 Not Found`: tile not in any archive
/// - `500 Internal Server Error`: compute or encode failure
///
/// # Headers
///
/// - `Content-Type: image/jpeg|image/webp`
/// - `Cache-Control: public, max-age=31536000, immutable`
/// - `ETag: "{cache_key}"`
/// - `X-Tile-Cache-Hit: true|false`
/// - `X-Processing-Time: {n}ms`
pub async fn tile_handler<A: SlideArchive + 'static>(
    State(state): State<AppState<A>>,
    Path(slide_id): Path<String>,
    Query(query): Query<TileQueryParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let started = Instant::now();
    let request = query.into_request(&slide_id, state.tile_size)?.with_defaults();
    request.validate(state.pipeline.pool().buffer_capacity())?;

    // The key is known before rendering; revalidation only checks that the
    // tile still exists
    let etag = format!("\"{}\"", request.cache_key());
    if etag_matches(&headers, &etag) && state.pipeline.is_available(&request).await? {
        debug!(etag = %etag, "Tile not modified");
        return Ok((
            StatusCode::NOT_MODIFIED,
            [
                (header::ETAG, etag),
                (header::CACHE_CONTROL, TILE_CACHE_CONTROL.to_string()),
            ],
        )
            .into_response());
    }

    let response = state.pipeline.get_tile(request).await?;
    let elapsed = format!("{}ms", started.elapsed().as_millis());

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, response.result.content_type.to_string()),
            (header::CACHE_CONTROL, TILE_CACHE_CONTROL.to_string()),
            (header::ETAG, etag),
            (X_TILE_CACHE_HIT, response.cache_hit.to_string()),
            (X_PROCESSING_TIME, elapsed),
        ],
        response.result.encoded_bytes,
    )
        .into_response())
}

/// Whether any entity tag in `If-None-Match` equals `etag`.
///
/// Composite tags contain commas, so each header value is also compared
/// whole before being split into a list.
fn etag_matches(headers: &HeaderMap, etag: &str) -> bool {
    headers
        .get_all(header::IF_NONE_MATCH)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|value| {
            value.trim() == etag
                || value
                    .split(',')
                    .map(str::trim)
                    .any(|candidate| candidate == etag || candidate == "*")
        })
}

/// Handle batch tile requests.
///
/// # Endpoint
///
/// `POST /api/tiles/{slide_id}/batch`
///
/// # Request Body
///
/// ```json
/// [{"layer": 12, "x": 3, "y": 4, "z": 0, "format": "jpeg", "quality": 90}]
/// ```
///
/// # Response
///
/// `200 OK` with one slot per item, in request order:
/// ```json
/// [
///   {"ok": true, "cacheKey": "slide:12:3:4:0", "contentType": "image/jpeg",
///    "width": 512, "height": 512, "cacheHit": false, "data": "ffd8..."},
///   {"ok": false, "error": "Invalid focus layer: 45 (valid range: 0-39)"}
/// ]
/// ```
///
/// # Errors
///
/// - `400 Bad Request`: more than 100 items
pub async fn batch_handler<A: SlideArchive + 'static>(
    State(state): State<AppState<A>>,
    Path(slide_id): Path<String>,
    Json(items): Json<Vec<TileQueryParams>>,
) -> Result<Json<Vec<BatchTileSlot>>, ApiError> {
    if items.len() > MAX_BATCH_SIZE {
        return Err(TileError::BatchTooLarge {
            size: items.len(),
            max: MAX_BATCH_SIZE,
        }
        .into());
    }

    // Items that cannot even be parsed fail in place; the rest are rendered
    let mut slots: Vec<Option<BatchTileSlot>> = Vec::with_capacity(items.len());
    let mut positions = Vec::new();
    let mut requests = Vec::new();
    for (index, item) in items.into_iter().enumerate() {
        match item.into_request(&slide_id, state.tile_size) {
            Ok(request) => {
                positions.push(index);
                requests.push(request);
                slots.push(None);
            }
            Err(e) => slots.push(Some(BatchTileSlot::failed(&e))),
        }
    }

    let results = state.batch.run(requests).await?;
    for (index, result) in positions.into_iter().zip(results) {
        slots[index] = Some(match result {
            Ok(response) => BatchTileSlot {
                ok: true,
                cache_key: Some(response.result.cache_key),
                content_type: Some(response.result.content_type),
                width: Some(response.result.width),
                height: Some(response.result.height),
                cache_hit: Some(response.cache_hit),
                data: Some(hex::encode(&response.result.encoded_bytes)),
                error: None,
            },
            Err(e) => BatchTileSlot::failed(&e),
        });
    }

    let slots: Vec<BatchTileSlot> = slots
        .into_iter()
        .map(|slot| {
            slot.unwrap_or_else(|| {
                BatchTileSlot::failed(&TileError::Internal("missing batch result".to_string()))
            })
        })
        .collect();

    let failed = slots.iter().filter(|slot| !slot.ok).count();
    debug!(slide_id = %slide_id, total = slots.len(), failed, "Batch served");
    Ok(Json(slots))
}

// =============================================================================
// Slide Handlers
// =============================================================================

/// `GET /api/slides` - captured slides, most recent first.
pub async fn slides_handler<A: SlideArchive + 'static>(
    State(state): State<AppState<A>>,
) -> Json<Vec<CapturedSlideInfo>> {
    Json(state.captures.list().await)
}

/// `GET /api/slides/{slide_id}`
pub async fn slide_handler<A: SlideArchive + 'static>(
    State(state): State<AppState<A>>,
    Path(slide_id): Path<String>,
) -> Result<Json<CapturedSlideInfo>, ApiError> {
    state
        .captures
        .info(&slide_id)
        .await
        .map(Json)
        .ok_or(ApiError::SlideNotFound(slide_id))
}

/// `DELETE /api/slides/{slide_id}` - drop a captured slide from memory.
pub async fn delete_slide_handler<A: SlideArchive + 'static>(
    State(state): State<AppState<A>>,
    Path(slide_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.captures.remove(&slide_id).await {
        let dropped = state.pipeline.cache().remove_slide(&slide_id).await;
        info!(slide_id = %slide_id, cached_tiles = dropped, "Captured slide deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::SlideNotFound(slide_id))
    }
}

// =============================================================================
// Scanner Handlers
// =============================================================================

/// `GET /api/scanner/status`
pub async fn scanner_status_handler<A: SlideArchive + 'static>(
    State(state): State<AppState<A>>,
) -> Result<Json<DeviceStatus>, ApiError> {
    Ok(Json(state.scanner()?.status().await?))
}

/// `GET /api/scanner/layers`
pub async fn scanner_layers_handler<A: SlideArchive + 'static>(
    State(state): State<AppState<A>>,
) -> Result<Json<Vec<LayerInfo>>, ApiError> {
    Ok(Json(state.scanner()?.layers().await?))
}

/// Handle scan requests.
///
/// # Endpoint
///
/// `POST /api/scanner/scan`
///
/// # Request Body
///
/// ```json
/// {"start_x": 0, "start_y": 0, "width": 4096, "height": 4096, "layers": [10, 20, 30]}
/// ```
///
/// # Response
///
/// `200 OK` with the captured slide summary. The slide is immediately
/// servable through the tile endpoints at zoom 0.
///
/// If the client disconnects mid-scan the scan is abandoned and the device
/// connection is dropped; the next device request reconnects.
pub async fn scan_handler<A: SlideArchive + 'static>(
    State(state): State<AppState<A>>,
    Json(request): Json<ScanRequest>,
) -> Result<Json<CapturedSlideInfo>, ApiError> {
    validate_scan(&request)?;
    let scanner = state.scanner()?;

    let scan = scanner.scan(&request).await?;
    let (info, evicted) = state.captures.insert(scan).await;
    // Tiles of a replaced or evicted slide must not outlive it in the cache
    let cache = state.pipeline.cache();
    cache.remove_slide(&info.slide_id).await;
    if let Some(evicted) = evicted {
        cache.remove_slide(&evicted).await;
    }
    info!(
        slide_id = %info.slide_id,
        layers = info.layers.len(),
        "Scan stored"
    );
    Ok(Json(info))
}

fn validate_scan(request: &ScanRequest) -> Result<(), ApiError> {
    if request.width == 0 || request.height == 0 {
        return Err(ApiError::BadRequest(format!(
            "Scan region {}x{} is empty",
            request.width, request.height
        )));
    }
    if request.layers.is_empty() {
        return Err(ApiError::BadRequest("Scan needs at least one layer".to_string()));
    }
    if let Some(&layer) = request.layers.iter().find(|&&l| l > MAX_FOCUS_LAYER) {
        return Err(TileError::InvalidLayer {
            layer,
            max: MAX_FOCUS_LAYER,
        }
        .into());
    }
    Ok(())
}

/// `POST /api/scanner/focus` with `{"layer": n}`.
pub async fn focus_handler<A: SlideArchive + 'static>(
    State(state): State<AppState<A>>,
    Json(body): Json<FocusRequest>,
) -> Result<StatusCode, ApiError> {
    if body.layer > MAX_FOCUS_LAYER {
        return Err(TileError::InvalidLayer {
            layer: body.layer,
            max: MAX_FOCUS_LAYER,
        }
        .into());
    }
    state.scanner()?.set_focus(body.layer).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/scanner/calibrate`
pub async fn calibrate_handler<A: SlideArchive + 'static>(
    State(state): State<AppState<A>>,
) -> Result<StatusCode, ApiError> {
    state.scanner()?.calibrate().await?;
    info!("Calibration started");
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// System Handlers
// =============================================================================

/// Handle stats requests.
///
/// # Endpoint
///
/// `GET /api/system/stats`
///
/// # Response
///
/// ```json
/// {
///   "cache": {"hits": 10, "misses": 2, "hitRate": 0.833, "size": 4194304, "tiles": 2, "capacity": 8589934592},
///   "uptime_secs": 3600,
///   "compute_backend": "cpu",
///   "pool_buffers_in_use": 0
/// }
/// ```
pub async fn stats_handler<A: SlideArchive + 'static>(
    State(state): State<AppState<A>>,
) -> Json<SystemStatsResponse> {
    let stats = state.pipeline.cache().stats().await;
    Json(SystemStatsResponse {
        cache: CacheStatsResponse {
            hits: stats.hits,
            misses: stats.misses,
            hit_rate: stats.hit_rate(),
            size: stats.resident_bytes,
            tiles: stats.entry_count,
            capacity: stats.capacity_bytes,
        },
        uptime_secs: state.started_at.elapsed().as_secs(),
        compute_backend: state.pipeline.backend_name(),
        pool_buffers_in_use: state.pipeline.pool().in_use(),
    })
}

/// Handle health check requests.
///
/// # Endpoint
///
/// `GET /health`
///
/// # Response
///
/// `200 OK` with JSON body:
/// ```json
/// {
///   "status": "healthy",
///   "version": "0.1.0",
///   "device": "connected"
/// }
/// ```
pub async fn health_handler<A: SlideArchive + 'static>(
    State(state): State<AppState<A>>,
) -> Json<HealthResponse> {
    let device = state
        .scanner
        .as_ref()
        .map(|scanner| scanner.state().as_str().to_string());
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        device,
    })
}

// =============================================================================
// Session Handlers
// =============================================================================

/// Handle login requests.
///
/// # Endpoint
///
/// `POST /api/login` with `{"username": "...", "password": "..."}`
///
/// # Response
///
/// `200 OK` with `{"token": "...", "expires_at": 1735689600}` and the
/// `auth_token` cookie set. `401` on bad credentials.
pub async fn login_handler<A: SlideArchive + 'static>(
    State(state): State<AppState<A>>,
    Json(body): Json<LoginRequest>,
) -> Result<Response, ApiError> {
    let Some(auth) = state.auth.as_ref() else {
        return Err(ApiError::BadRequest(
            "Authentication is disabled".to_string(),
        ));
    };

    let (token, expires_at) = auth.login(&body.username, &body.password)?;
    info!(user = %body.username, "User logged in");

    let cookie = session_cookie(&token, auth.ttl());
    Ok((
        [(header::SET_COOKIE, cookie)],
        Json(LoginResponse { token, expires_at }),
    )
        .into_response())
}

/// `POST /api/logout` - revoke the presented token and clear the cookie.
pub async fn logout_handler<A: SlideArchive + 'static>(
    State(state): State<AppState<A>>,
    headers: HeaderMap,
) -> Response {
    if let (Some(auth), Some(token)) = (state.auth.as_ref(), token_from_headers(&headers)) {
        auth.revoke(&token).await;
    }
    (StatusCode::NO_CONTENT, [(header::SET_COOKIE, clear_cookie())]).into_response()
}

// =============================================================================
// Tests
// =============================================================================
