//! HTTP server layer for the viewer.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         HTTP Layer                              │
//! │   GET /api/tiles/{slide_id}?layer=&x=&y=&z=&format=&quality=    │
//! │                                                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐  │
//! │  │  handlers   │  │    auth     │  │        routes           │  │
//! │  │ (requests)  │  │ (sessions)  │  │  (router config)        │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod auth;
pub mod handlers;
pub mod routes;

pub use auth::{session_middleware, AuthError, SessionAuth, SessionUser, DEFAULT_TOKEN_TTL};
pub use handlers::{
    health_handler, tile_handler, ApiError, AppState, BatchTileSlot, ErrorResponse,
    HealthResponse, SystemStatsResponse, TileQueryParams,
};
pub use routes::{create_router, RouterConfig};
