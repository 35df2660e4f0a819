//! Coordinator error taxonomy.

use std::fmt;

use microclaw_core::ConfigError;
use thiserror::Error;

/// Stage of an orchestrated run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Build,
    Flash,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Build => f.write_str("Build"),
            Stage::Flash => f.write_str("Flash"),
        }
    }
}

/// Errors surfaced by the coordinator. Nothing is retried internally.
#[derive(Debug, Error)]
pub enum Error {
    /// The port could not be opened; the link stays closed.
    #[error("Failed to open {port}: {reason}")]
    Connection { port: String, reason: String },

    /// A command was attempted with no open link.
    #[error("Not connected")]
    NotConnected,

    /// Mid-session read/write failure; the link has been closed.
    #[error("Serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An external tool exited non-zero or could not be started.
    #[error("{stage} failed: {detail}")]
    SubprocessFailure { stage: Stage, detail: String },

    /// An exclusive build/flash run holds the link.
    #[error("Another build or flash operation is in progress")]
    Busy,

    /// The command cannot be written as a single line.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// The stored configuration could not be read or written.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;
