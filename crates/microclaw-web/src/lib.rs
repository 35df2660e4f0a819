//! # microclaw-web
//!
//! HTTP and WebSocket control surface for a MicroClaw device.
//!
//! This crate provides:
//! - REST endpoints for ports, connection, commands and configuration
//! - Firmware upload and build-and-flash endpoints
//! - The live device log stream over WebSocket
//! - Optional static file serving for a dashboard
//!
//! ## Usage
//!
//! ```rust,ignore
//! use microclaw_web::{create_router, ServerState, WebConfig};
//!
//! let state = ServerState::new(coordinator, WebConfig::default());
//! let app = create_router(state);
//!
//! let listener = TcpListener::bind("0.0.0.0:8000").await?;
//! axum::serve(listener, app).await?;
//! ```

pub mod error;
pub mod routes;

pub use error::ApiError;
pub use routes::create_router;

use std::path::PathBuf;
use std::sync::Arc;

use microclaw_server::Coordinator;

/// Web layer settings.
#[derive(Debug, Clone)]
pub struct WebConfig {
    /// Where uploaded firmware images are staged while flashing.
    pub upload_dir: PathBuf,
    /// Dashboard files served for every path not handled by the API.
    pub static_dir: Option<PathBuf>,
    /// Largest accepted firmware upload, in bytes.
    pub max_upload_bytes: usize,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            upload_dir: std::env::temp_dir().join("microclaw-uploads"),
            static_dir: None,
            max_upload_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Shared server state for all route handlers.
pub struct ServerState {
    pub coordinator: Arc<Coordinator>,
    pub config: WebConfig,
}

impl ServerState {
    pub fn new(coordinator: Arc<Coordinator>, config: WebConfig) -> AppState {
        Arc::new(Self {
            coordinator,
            config,
        })
    }
}

/// Type alias for shared state in Axum handlers.
pub type AppState = Arc<ServerState>;
