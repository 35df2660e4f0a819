//! Firmware pipeline routes.
//!
//! # Endpoints
//!
//! ### `POST /api/flash`
//! `multipart/form-data` with a `file` part (the application image) and a
//! `port` part. The image is staged under the upload directory, written at
//! the application offset, then deleted.
//!
//! ### `POST /api/build-flash`
//! `{"port": "/dev/ttyUSB0"}`. Builds the firmware project, flashes the full
//! image set and replays the stored configuration.
//!
//! Both return a flash report on success and `409` while another run holds
//! the link. A run continues on its own task if the client goes away.

use std::path::PathBuf;

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    response::Json,
    routing::post,
    Router,
};
use microclaw_protocol::{BuildFlashRequest, FlashReport};
use microclaw_server::FlashLayout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::AppState;

pub fn routes(max_upload_bytes: usize) -> Router<AppState> {
    Router::new()
        .route(
            "/flash",
            post(flash_upload).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route("/build-flash", post(build_flash))
}

/// POST /api/flash
async fn flash_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<FlashReport>> {
    let mut port = String::new();
    let mut image = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Upload failed: {}", e)))?
    {
        match field.name() {
            Some("port") => {
                port = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Upload failed: {}", e)))?;
            }
            Some("file") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Upload failed: {}", e)))?;
                image = Some(bytes);
            }
            other => debug!("Ignoring multipart field {:?}", other),
        }
    }

    let port = port.trim().to_string();
    if port.is_empty() {
        return Err(ApiError::bad_request("Port required"));
    }
    let image = match image {
        Some(image) if !image.is_empty() => image,
        _ => return Err(ApiError::bad_request("Firmware file required")),
    };

    let path = stage_upload(&state.config.upload_dir, &image).await?;
    info!("Staged {} byte image at {}", image.len(), path.display());

    let coordinator = state.coordinator.clone();
    let staged = path.clone();
    let run = tokio::spawn(async move {
        let result = coordinator
            .flash(FlashLayout::Application { image: staged.clone() }, &port)
            .await;
        if let Err(e) = tokio::fs::remove_file(&staged).await {
            warn!("Failed to remove {}: {}", staged.display(), e);
        }
        result
    });

    let report = run
        .await
        .map_err(|e| ApiError::internal(format!("Flash task failed: {}", e)))??;
    Ok(Json(report))
}

/// POST /api/build-flash
async fn build_flash(
    State(state): State<AppState>,
    Json(req): Json<BuildFlashRequest>,
) -> ApiResult<Json<FlashReport>> {
    let port = req.port.trim().to_string();
    if port.is_empty() {
        return Err(ApiError::bad_request("Port required"));
    }

    let coordinator = state.coordinator.clone();
    let run = tokio::spawn(async move { coordinator.build_and_flash(&port).await });

    let report = run
        .await
        .map_err(|e| ApiError::internal(format!("Build task failed: {}", e)))??;
    Ok(Json(report))
}

async fn stage_upload(dir: &std::path::Path, image: &[u8]) -> ApiResult<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| ApiError::internal(format!("Upload failed: {}", e)))?;
    let path = dir.join(format!("firmware-{}.bin", Uuid::new_v4()));
    tokio::fs::write(&path, image)
        .await
        .map_err(|e| ApiError::internal(format!("Upload failed: {}", e)))?;
    Ok(path)
}
