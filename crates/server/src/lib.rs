// crates/server/src/lib.rs
//! Claude-remote server library: HTTP/SSE/WS surface plus the background
//! engine (indexer, idle detector, notification dispatcher) over the
//! in-process event bus.

pub mod bus;
pub mod error;
pub mod idle;
pub mod indexer;
pub mod mux;
pub mod notify;
pub mod procs;
pub mod routes;
pub mod state;
pub mod watcher;

pub use bus::{EventBus, RemoteEvent, GLOBAL_TOPIC};
pub use error::{ApiError, ApiResult};
pub use idle::IdleDetector;
pub use indexer::Indexer;
pub use mux::{JoinOutcome, MuxController, MuxError, MuxPipe};
pub use notify::{DeliveryOutcome, DeliveryPort, LoggingDeliveryPort, NotificationDispatcher};
pub use procs::ProcessRegistry;
pub use state::AppState;

use axum::Router;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the Axum application over an already-wired [`AppState`].
///
/// CORS is permissive: trust is delegated to the private network boundary
/// this server is deployed behind, and the UI is served same-origin anyway.
pub fn create_app(state: Arc<AppState>) -> Router {
    routes::api_routes(state)
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

// ============================================================================
// Integration tests
// ============================================================================
