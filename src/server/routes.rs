//! Router configuration for the viewer API.
//!
//! This module defines the HTTP routes and applies middleware for session
//! authentication, CORS and request tracing.
//!
//! # Route Structure
//!
//! ```text
//! /health                              - Health check (public)
//! /api/login, /api/logout              - Session management (public)
//! /api/tiles/{slide_id}                - Single tile (protected)
//! /api/tiles/{slide_id}/batch          - Batch of tiles (protected)
//! /api/slides[/{slide_id}]             - Captured slides (protected)
//! /api/scanner/*                       - Device control (protected)
//! /api/system/stats                    - Cache and uptime (protected)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use cyto_viewer::server::{create_router, AppState, RouterConfig, SessionAuth};
//!
//! let state = AppState::new(pipeline, captures).with_batch_workers(4);
//!
//! let config = RouterConfig::new(SessionAuth::new("my-secret-key"))
//!     .with_cors_origins(vec!["https://example.com".to_string()]);
//!
//! let router = create_router(state, config);
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! axum::serve(listener, router).await?;
//! ```

use std::time::Duration;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use http::header::{AUTHORIZATION, CONTENT_TYPE, ETAG, IF_NONE_MATCH};
use http::Method;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::auth::{session_middleware, SessionAuth};
use super::handlers::{
    batch_handler, calibrate_handler, delete_slide_handler, focus_handler, health_handler,
    login_handler, logout_handler, scan_handler, scanner_layers_handler, scanner_status_handler,
    slide_handler, slides_handler, stats_handler, tile_handler, AppState, X_PROCESSING_TIME,
    X_TILE_CACHE_HIT,
};
use crate::slide::SlideArchive;

// =============================================================================
// Router Configuration
// =============================================================================

/// Configuration for the HTTP router.
#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// Session authentication; `None` leaves every route public
    pub auth: Option<SessionAuth>,

    /// Allowed CORS origins (None = allow any origin)
    pub cors_origins: Option<Vec<String>>,

    /// Whether to enable request tracing
    pub enable_tracing: bool,
}

impl RouterConfig {
    /// Create a configuration protecting the API with `auth`.
    ///
    /// By default:
    /// - CORS allows any origin
    /// - Tracing is enabled
    pub fn new(auth: SessionAuth) -> Self {
        Self {
            auth: Some(auth),
            cors_origins: None,
            enable_tracing: true,
        }
    }

    /// Create a configuration with authentication disabled.
    ///
    /// **Warning**: This should only be used for development/testing.
    pub fn without_auth() -> Self {
        Self {
            auth: None,
            cors_origins: None,
            enable_tracing: true,
        }
    }

    /// Set specific allowed CORS origins.
    ///
    /// Pass an empty vec to disallow all cross-origin requests.
    /// Pass None (or don't call this method) to allow any origin.
    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = Some(origins);
        self
    }

    /// Allow any CORS origin.
    pub fn with_cors_any_origin(mut self) -> Self {
        self.cors_origins = None;
        self
    }

    /// Enable or disable request tracing.
    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.enable_tracing = enabled;
        self
    }

    pub fn auth_enabled(&self) -> bool {
        self.auth.is_some()
    }
}

// =============================================================================
// Router Builder
// =============================================================================

/// Create the main application router.
///
/// This function builds the complete Axum router with:
/// - Public routes (health check, login, logout)
/// - API routes, behind session auth when `config.auth` is set
/// - CORS configuration
/// - Request tracing (optional)
pub fn create_router<A>(mut state: AppState<A>, config: RouterConfig) -> Router
where
    A: SlideArchive + 'static,
{
    state.auth = config.auth.clone();
    let cors = build_cors_layer(&config);

    let api = api_routes(state.clone());
    let api = match &config.auth {
        Some(auth) => api.layer(middleware::from_fn_with_state(
            auth.clone(),
            session_middleware,
        )),
        None => api,
    };

    let mut public = Router::new().route("/health", get(health_handler::<A>));
    if config.auth.is_some() {
        public = public
            .route("/api/login", post(login_handler::<A>))
            .route("/api/logout", post(logout_handler::<A>));
    }

    let router = Router::new()
        .merge(api)
        .merge(public.with_state(state))
        .layer(cors);

    if config.enable_tracing {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

/// Every `/api` route except the session endpoints.
fn api_routes<A>(state: AppState<A>) -> Router
where
    A: SlideArchive + 'static,
{
    Router::new()
        .route("/api/tiles/{slide_id}", get(tile_handler::<A>))
        .route("/api/tiles/{slide_id}/batch", post(batch_handler::<A>))
        .route("/api/slides", get(slides_handler::<A>))
        .route(
            "/api/slides/{slide_id}",
            get(slide_handler::<A>).delete(delete_slide_handler::<A>),
        )
        .route("/api/scanner/status", get(scanner_status_handler::<A>))
        .route("/api/scanner/layers", get(scanner_layers_handler::<A>))
        .route("/api/scanner/scan", post(scan_handler::<A>))
        .route("/api/scanner/focus", post(focus_handler::<A>))
        .route("/api/scanner/calibrate", post(calibrate_handler::<A>))
        .route("/api/system/stats", get(stats_handler::<A>))
        .with_state(state)
}

/// Build the CORS layer based on configuration.
fn build_cors_layer(config: &RouterConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE, IF_NONE_MATCH])
        .expose_headers([ETAG, X_TILE_CACHE_HIT, X_PROCESSING_TIME])
        .max_age(Duration::from_secs(86400)); // 24 hours

    match &config.cors_origins {
        None => cors.allow_origin(Any),
        Some(origins) if origins.is_empty() => {
            // No origins allowed - this effectively disables CORS
            cors
        }
        Some(origins) => {
            let parsed_origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
            cors.allow_origin(parsed_origins)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_router_config_defaults() {
        let config = RouterConfig::new(SessionAuth::new("secret"));
        assert!(config.auth_enabled());
        assert!(config.cors_origins.is_none());
        assert!(config.enable_tracing);
    }

    #[test]
    fn test_router_config_without_auth() {
        let config = RouterConfig::without_auth();
        assert!(!config.auth_enabled());
    }

    #[test]
    fn test_router_config_builder() {
        let config = RouterConfig::without_auth()
            .with_cors_origins(vec!["https://example.com".to_string()])
            .with_tracing(false);

        assert_eq!(
            config.cors_origins,
            Some(vec!["https://example.com".to_string()])
        );
        assert!(!config.enable_tracing);

        let config = config.with_cors_any_origin();
        assert!(config.cors_origins.is_none());
    }

    #[test]
    fn test_build_cors_layer_variants() {
        let _any = build_cors_layer(&RouterConfig::without_auth());
        let _none = build_cors_layer(&RouterConfig::without_auth().with_cors_origins(vec![]));
        let _some = build_cors_layer(&RouterConfig::without_auth().with_cors_origins(vec![
            "https://example.com".to_string(),
            "not a header\n".to_string(),
        ]));
    }
}
