//! Message types for the MicroClaw control surface.
//!
//! REST bodies exchanged with dashboards:
//! - Requests: connect, command, build-and-flash
//! - Responses: status acknowledgements, port lists, session status,
//!   orchestrated run reports, errors
//!
//! All bodies are JSON.

use serde::{Deserialize, Serialize};

// ============================================================================
// Requests
// ============================================================================

/// Body of `POST /api/connect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    #[serde(default)]
    pub port: String,
}

/// Body of `POST /api/command`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    #[serde(default)]
    pub command: String,
}

/// Body of `POST /api/build-flash`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildFlashRequest {
    #[serde(default)]
    pub port: String,
}

// ============================================================================
// Responses
// ============================================================================

/// Generic acknowledgement, e.g. `{"status": "connected", "port": "/dev/ttyUSB0"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl StatusResponse {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            port: None,
            command: None,
        }
    }

    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }
}

/// Error body, e.g. `{"error": "Not connected"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Body of `GET /api/ports`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortsResponse {
    pub ports: Vec<String>,
}

/// Link state as reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Closed,
    Open,
}

/// Body of `GET /api/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    /// Whether the serial link is open.
    pub link: LinkStatus,

    /// Port of the open link.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,

    /// Most recent link failure, cleared on the next successful connect.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// True while a build or flash run holds the link.
    pub exclusive: bool,

    /// Connected stream observers.
    pub subscribers: usize,
}

/// Outcome of replaying the stored configuration after a flash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ReplayOutcome {
    /// No replay was attempted (single-image flash, or nothing stored).
    Skipped,
    /// All commands were written.
    Applied { commands: usize },
    /// Replay gave up; the flash itself still succeeded.
    Failed { reason: String },
}

/// Report of a successful orchestrated run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlashReport {
    /// Always `"success"`; failures are reported as [`ErrorResponse`].
    pub status: String,

    /// Port that was flashed.
    pub port: String,

    /// Build output lines flagged as problems. `None` when no build ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_problems: Option<usize>,

    pub config_replay: ReplayOutcome,
}

impl FlashReport {
    pub fn success(port: impl Into<String>) -> Self {
        Self {
            status: "success".to_string(),
            port: port.into(),
            build_problems: None,
            config_replay: ReplayOutcome::Skipped,
        }
    }
}
