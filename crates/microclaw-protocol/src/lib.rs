//! # microclaw-protocol
//!
//! MicroClaw control-surface message types and codec.
//!
//! This crate defines the REST bodies and the live event stream formats.

pub mod codec;
pub mod messages;

pub use codec::*;
pub use messages::*;
