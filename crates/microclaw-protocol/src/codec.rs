//! Live event stream codec.
//!
//! Events travel over WebSocket text frames in one of two formats:
//! - `text` (default): `[DEVICE] WiFi connected`
//! - `json`: `{"tag":"DEVICE","text":"WiFi connected","timestamp":"..."}`

use microclaw_core::LogEvent;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// JSON (de)serialization failed.
    #[error("Failed to serialize event: {0}")]
    SerializeError(#[from] serde_json::Error),
}

/// Frame format selected by the `format` query parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamFormat {
    #[default]
    Text,
    Json,
}

/// Query parameters accepted by the stream endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamParams {
    #[serde(default)]
    pub format: StreamFormat,
}

/// Encode an event as a stream frame.
pub fn encode_event(event: &LogEvent, format: StreamFormat) -> Result<String, CodecError> {
    match format {
        StreamFormat::Text => Ok(event.to_string()),
        StreamFormat::Json => serde_json::to_string(event).map_err(CodecError::from),
    }
}

/// Decode a JSON stream frame.
pub fn decode_event(text: &str) -> Result<LogEvent, CodecError> {
    serde_json::from_str(text).map_err(CodecError::from)
}
