//! Stored device configuration routes.
//!
//! ### `GET /api/config`
//! Returns the configuration document.
//!
//! ### `POST /api/config`
//! Replaces the document wholesale. Unknown keys are preserved.
//!
//! The document is what gets replayed to the device after a build and flash.

use axum::{
    extract::State,
    response::Json,
    routing::get,
    Router,
};
use microclaw_core::DeviceConfig;
use microclaw_protocol::StatusResponse;

use crate::error::ApiResult;
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/config", get(get_config).post(put_config))
}

/// GET /api/config
async fn get_config(State(state): State<AppState>) -> ApiResult<Json<DeviceConfig>> {
    Ok(Json(state.coordinator.load_config()?))
}

/// POST /api/config
async fn put_config(
    State(state): State<AppState>,
    Json(config): Json<DeviceConfig>,
) -> ApiResult<Json<StatusResponse>> {
    state.coordinator.save_config(&config)?;
    Ok(Json(StatusResponse::new("saved")))
}
