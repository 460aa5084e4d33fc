//! devfarm-api - HTTP front end for the device acquisition orchestrator
//!
//! Maps `DeviceManager` operations onto REST endpoints and remembers which
//! sessions were handed out so they can be released later.
//!
//! # Usage
//!
//! ```ignore
//! use devfarm_api::{create_router, AppState};
//! use devfarm_core::{DeviceManager, FakeDeviceCloud, OrchestratorConfig};
//!
//! let manager = DeviceManager::new(Arc::new(FakeDeviceCloud::sample()), OrchestratorConfig::default());
//! let router = create_router(AppState::new(manager));
//! ```

pub mod error;
pub mod handlers;
pub mod state;

pub use error::ApiError;
pub use state::{AppState, HeldSession, SessionRegistry, DEFAULT_REQUEST_TIMEOUT};

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Create the devfarm REST API router with the given application state
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(|| async { "OK" }))
        // Inventory
        .route("/devices", get(handlers::devices::list_devices))
        .route(
            "/devices/{device_id}/properties",
            get(handlers::devices::device_properties),
        )
        // Acquisition and release
        .route("/devices/acquire", post(handlers::sessions::acquire_device))
        .route("/sessions", get(handlers::sessions::list_sessions))
        .route(
            "/sessions/{session_id}/release",
            post(handlers::sessions::release_session),
        )
        .layer(TimeoutLayer::new(state.request_timeout()))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
