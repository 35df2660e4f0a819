//! HTTP route handlers for the device control surface.
//!
//! Routes are organized as:
//! - `/api/ports`, `/api/status`, `/api/connect`, `/api/disconnect`,
//!   `/api/command` - link and command channel
//! - `/api/flash`, `/api/build-flash` - firmware pipeline
//! - `/api/config` - stored device configuration
//! - `/ws/logs` - live device log stream
//! - everything else - dashboard files, when a static directory is configured

pub mod config;
pub mod device;
pub mod firmware;
pub mod stream;

use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Create the main Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .nest("/api", api_routes(&state))
        .route("/ws/logs", get(stream::logs_handler));

    if let Some(dir) = &state.config.static_dir {
        router = router.fallback_service(ServeDir::new(dir));
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn api_routes(state: &AppState) -> Router<AppState> {
    Router::new()
        .merge(device::routes())
        .merge(firmware::routes(state.config.max_upload_bytes))
        .merge(config::routes())
}
