//! # microclaw-server
//!
//! Serial-session coordinator for a MicroClaw device.
//!
//! The [`Coordinator`] owns the single serial link and everything attached
//! to it:
//! - [`BroadcastHub`]: fan-out of tagged log events to any number of observers
//! - [`SessionManager`]: connect/disconnect, serialized command writes and
//!   the read loop
//! - [`Poller`]: periodic status requests
//! - [`Orchestrator`]: build and flash runs under the [`ExclusiveFlag`]
//!
//! Runs on tokio. Serial ports are reached through the [`LinkOpener`] trait,
//! with [`SystemSerial`] for real hardware and [`MemoryOpener`] for tests and
//! simulation.

pub mod coordinator;
pub mod error;
pub mod exclusive;
pub mod hub;
pub mod link;
pub mod orchestrator;
pub mod poller;
pub mod session;

pub use coordinator::{BackgroundTasks, Coordinator, CoordinatorConfig};
pub use error::{Error, Result, Stage};
pub use exclusive::{ExclusiveFlag, ExclusiveGuard, ExclusiveState};
pub use hub::{BroadcastHub, Subscription};
pub use link::{LinkOpener, MemoryOpener, SerialLink, SystemSerial, DEVICE_BAUD_RATE};
pub use orchestrator::{FlashLayout, FlashSettings, Orchestrator, OrchestratorConfig, ToolCommand};
pub use poller::{Poller, DEFAULT_POLL_INTERVAL};
pub use session::{ReadOutcome, SessionManager};
