//! # microclaw-core
//!
//! Core MicroClaw device model.
//!
//! This crate provides:
//! - Log event types (`LogEvent`, `EventTag`) and line classification
//! - The line framer turning raw serial bytes into text lines
//! - The serial command vocabulary understood by the firmware
//! - The stored device configuration document and its storage trait
//!
//! This crate is intentionally runtime-agnostic and contains no async code,
//! so the same types serve the coordinator, the web layer and the tests.

pub mod commands;
pub mod config;
pub mod framer;
pub mod model;

pub use commands::{replay_commands, CommandError, DeviceCommand};
pub use config::{ConfigError, ConfigStorage, DeviceConfig, FileConfigStorage, MemoryConfigStorage};
pub use framer::LineFramer;
pub use model::*;
