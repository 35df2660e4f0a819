//! Link and command channel routes.
//!
//! # Endpoints
//!
//! ### `GET /api/ports`
//! Candidate serial ports: `{"ports": ["/dev/ttyUSB0"]}`.
//!
//! ### `GET /api/status`
//! Link state, last link error, exclusive state and observer count.
//!
//! ### `POST /api/connect`
//! `{"port": "/dev/ttyUSB0"}` → `{"status": "connected", "port": "/dev/ttyUSB0"}`
//!
//! ### `POST /api/disconnect`
//! → `{"status": "disconnected"}`
//!
//! ### `POST /api/command`
//! `{"command": "system_info"}` → `{"status": "sent", "command": "system_info"}`

use axum::{
    extract::State,
    response::Json,
    routing::{get, post},
    Router,
};
use microclaw_protocol::{
    CommandRequest, ConnectRequest, PortsResponse, SessionStatus, StatusResponse,
};

use crate::error::{ApiError, ApiResult};
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/ports", get(list_ports))
        .route("/status", get(status))
        .route("/connect", post(connect))
        .route("/disconnect", post(disconnect))
        .route("/command", post(send_command))
}

/// GET /api/ports
async fn list_ports(State(state): State<AppState>) -> Json<PortsResponse> {
    Json(PortsResponse {
        ports: state.coordinator.list_ports(),
    })
}

/// GET /api/status
async fn status(State(state): State<AppState>) -> Json<SessionStatus> {
    Json(state.coordinator.status().await)
}

/// POST /api/connect
async fn connect(
    State(state): State<AppState>,
    Json(req): Json<ConnectRequest>,
) -> ApiResult<Json<StatusResponse>> {
    let port = req.port.trim();
    if port.is_empty() {
        return Err(ApiError::bad_request("Port required"));
    }
    state.coordinator.connect(port).await?;
    Ok(Json(StatusResponse::new("connected").with_port(port)))
}

/// POST /api/disconnect
async fn disconnect(State(state): State<AppState>) -> Json<StatusResponse> {
    state.coordinator.disconnect().await;
    Json(StatusResponse::new("disconnected"))
}

/// POST /api/command
async fn send_command(
    State(state): State<AppState>,
    Json(req): Json<CommandRequest>,
) -> ApiResult<Json<StatusResponse>> {
    state.coordinator.send(&req.command).await?;
    let command = req.command.trim_end_matches(['\r', '\n']);
    Ok(Json(StatusResponse::new("sent").with_command(command)))
}
