//! MicroClaw log event model.
//!
//! Everything an observer sees is a [`LogEvent`]: a tag naming the subsystem
//! that produced it plus one line of text. Device output is tagged by sniffing
//! the line content:
//! - status payloads (`{"heap_free": ...}`) become `SYS_INFO`
//! - assistant traces (`{"thought": ...}`) become `AI_JSON`
//! - everything else is `DEVICE`

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Key marking a device status payload.
pub const STATUS_PAYLOAD_KEY: &str = "heap_free";

/// Key marking a structured assistant payload.
pub const ASSISTANT_PAYLOAD_KEY: &str = "thought";

/// The subsystem a log event originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventTag {
    /// Free-text output read from the device.
    Device,
    /// Coordinator notices (connected, disconnected, flashing started...).
    System,
    /// Failures surfaced to observers.
    Error,
    /// A command written to the device.
    Sent,
    /// Output of the firmware build tool.
    Build,
    /// Output of the flashing tool.
    Flash,
    /// Device status payload (JSON).
    SysInfo,
    /// Structured assistant payload (JSON).
    AiJson,
}

impl EventTag {
    /// Wire label, e.g. `SYS_INFO`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventTag::Device => "DEVICE",
            EventTag::System => "SYSTEM",
            EventTag::Error => "ERROR",
            EventTag::Sent => "SENT",
            EventTag::Build => "BUILD",
            EventTag::Flash => "FLASH",
            EventTag::SysInfo => "SYS_INFO",
            EventTag::AiJson => "AI_JSON",
        }
    }
}

impl fmt::Display for EventTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tagged unit of observability output.
///
/// Events are immutable once created; the hub hands out clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Producing subsystem.
    pub tag: EventTag,

    /// The message text, without trailing newline.
    pub text: String,

    /// When the event was created (UTC).
    pub timestamp: DateTime<Utc>,
}

impl LogEvent {
    /// Create an event stamped with the current time.
    pub fn new(tag: EventTag, text: impl Into<String>) -> Self {
        Self {
            tag,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(EventTag::System, text)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(EventTag::Error, text)
    }

    pub fn sent(command: impl Into<String>) -> Self {
        Self::new(EventTag::Sent, command)
    }

    /// Create an event for a line read from the device, tagged by content.
    pub fn from_device_line(line: impl Into<String>) -> Self {
        let line = line.into();
        let tag = classify_line(&line);
        Self::new(tag, line)
    }
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.tag, self.text)
    }
}

/// Tag a device line by sniffing its content.
///
/// This is a substring heuristic: a line that starts with `{` and mentions a
/// known payload key anywhere is treated as structured, whether or not it
/// parses as JSON. A status key wins over an assistant key.
pub fn classify_line(line: &str) -> EventTag {
    let trimmed = line.trim_start();
    if !trimmed.starts_with('{') {
        return EventTag::Device;
    }
    if trimmed.contains(STATUS_PAYLOAD_KEY) {
        EventTag::SysInfo
    } else if trimmed.contains(ASSISTANT_PAYLOAD_KEY) {
        EventTag::AiJson
    } else {
        EventTag::Device
    }
}
