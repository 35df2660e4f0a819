//! Ownership of the single serial link.
//!
//! [`SessionManager`] is the only holder of the raw connection. Callers go
//! through its operations:
//! - `connect` / `disconnect` move the link between `Closed` and `Open`
//! - `send` writes one command line; the link mutex keeps writes ordered
//! - the read loop ([`SessionManager::run_reader`]) frames incoming bytes,
//!   tags each line and publishes it
//!
//! While the [`ExclusiveFlag`] is held, ordinary `connect`/`send` calls are
//! rejected with [`Error::Busy`]; the holder uses the `*_exclusive` variants,
//! which demand the guard as proof.
//!
//! There is no automatic reconnect: an I/O failure closes the link and the
//! caller decides what happens next.

use std::io;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use microclaw_core::{DeviceCommand, LineFramer, LogEvent};
use microclaw_protocol::{LinkStatus, SessionStatus};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::exclusive::{ExclusiveFlag, ExclusiveGuard};
use crate::hub::BroadcastHub;
use crate::link::{LinkOpener, SerialLink, DEVICE_BAUD_RATE};

/// Pause between availability checks when the device is quiet.
pub const READ_IDLE_INTERVAL: Duration = Duration::from_millis(100);

/// Pause between checks while no link is open.
pub const CLOSED_IDLE_INTERVAL: Duration = Duration::from_millis(250);

/// Largest chunk taken from the port in one read.
const READ_CHUNK: usize = 1024;

struct OpenLink {
    port: String,
    link: Box<dyn SerialLink>,
    framer: LineFramer,
}

enum LinkState {
    Closed,
    Open(OpenLink),
}

impl LinkState {
    fn take(&mut self) -> Option<OpenLink> {
        match std::mem::replace(self, LinkState::Closed) {
            LinkState::Open(open) => Some(open),
            LinkState::Closed => None,
        }
    }
}

/// Who is asking for the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    /// Ordinary traffic, refused while an exclusive run is active.
    Shared,
    /// The holder of the exclusive section; the guard was already checked.
    Exclusive,
}

/// Result of one pass of the read loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// No link is open.
    Closed,
    /// The link is open but nothing was buffered.
    Idle,
    /// Bytes were consumed; `lines` complete lines were published.
    Lines(usize),
    /// The read failed and the link was closed.
    Failed,
}

/// Owns the link, the exclusive flag and the route to observers.
pub struct SessionManager {
    link: Mutex<LinkState>,
    opener: Arc<dyn LinkOpener>,
    hub: Arc<BroadcastHub>,
    exclusive: Arc<ExclusiveFlag>,
    last_error: StdMutex<Option<String>>,
}

impl SessionManager {
    pub fn new(opener: Arc<dyn LinkOpener>, hub: Arc<BroadcastHub>) -> Self {
        Self {
            link: Mutex::new(LinkState::Closed),
            opener,
            hub,
            exclusive: ExclusiveFlag::new(),
            last_error: StdMutex::new(None),
        }
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn exclusive(&self) -> &Arc<ExclusiveFlag> {
        &self.exclusive
    }

    /// Candidate device ports.
    pub fn list_ports(&self) -> Vec<String> {
        self.opener.list_ports()
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Close any open link and open `port` at the device baud rate.
    pub async fn connect(&self, port: &str) -> Result<()> {
        self.open_link(port, Access::Shared).await
    }

    /// `connect` for the holder of the exclusive section.
    pub async fn connect_exclusive(&self, guard: &ExclusiveGuard, port: &str) -> Result<()> {
        self.check_guard(guard)?;
        self.open_link(port, Access::Exclusive).await
    }

    async fn open_link(&self, port: &str, access: Access) -> Result<()> {
        let port = port.trim();
        if port.is_empty() {
            return Err(Error::Connection {
                port: String::new(),
                reason: "Port required".to_string(),
            });
        }

        let mut state = self.link.lock().await;
        self.check_access(access)?;
        let mut framer = match state.take() {
            Some(previous) => {
                info!("Closing {} before reconnecting", previous.port);
                previous.framer
            }
            None => LineFramer::new(),
        };
        framer.reset();

        match self.opener.open(port, DEVICE_BAUD_RATE) {
            Ok(link) => {
                *state = LinkState::Open(OpenLink {
                    port: port.to_string(),
                    link,
                    framer,
                });
                drop(state);
                self.set_last_error(None);
                info!("Connected to {} at {} baud", port, DEVICE_BAUD_RATE);
                self.hub.publish(LogEvent::system(format!("Connected to {}", port)));
                Ok(())
            }
            Err(e) => {
                drop(state);
                warn!("Failed to open {}: {}", port, e);
                self.set_last_error(Some(e.to_string()));
                Err(Error::Connection {
                    port: port.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Close the link if open. Returns whether a link was closed.
    pub async fn disconnect(&self) -> bool {
        let closed = self.link.lock().await.take();
        match closed {
            Some(open) => {
                info!("Disconnected from {}", open.port);
                self.hub.publish(LogEvent::system("Disconnected"));
                true
            }
            None => false,
        }
    }

    /// Close the link ahead of a flash so the flashing tool can claim the port.
    pub async fn release_for_flash(&self, guard: &ExclusiveGuard) -> Result<bool> {
        self.check_guard(guard)?;
        let mut state = self.link.lock().await;
        if matches!(*state, LinkState::Closed) {
            return Ok(false);
        }
        self.hub.publish(LogEvent::system("Closing serial for flashing..."));
        if let Some(open) = state.take() {
            info!("Released {} for flashing", open.port);
        }
        Ok(true)
    }

    pub async fn is_open(&self) -> bool {
        matches!(*self.link.lock().await, LinkState::Open(_))
    }

    pub async fn status(&self) -> SessionStatus {
        let port = match &*self.link.lock().await {
            LinkState::Open(open) => Some(open.port.clone()),
            LinkState::Closed => None,
        };
        SessionStatus {
            link: if port.is_some() { LinkStatus::Open } else { LinkStatus::Closed },
            port,
            last_error: self.last_error(),
            exclusive: self.exclusive.is_held(),
            subscribers: self.hub.subscriber_count(),
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Write `command` followed by a newline.
    ///
    /// Writes are serialized by the link mutex, so concurrent callers never
    /// interleave bytes. A trailing CR/LF in `command` is ignored.
    pub async fn send(&self, command: &str) -> Result<()> {
        self.write_command(command, Access::Shared).await
    }

    /// `send` for the holder of the exclusive section.
    pub async fn send_exclusive(&self, guard: &ExclusiveGuard, command: &str) -> Result<()> {
        self.check_guard(guard)?;
        self.write_command(command, Access::Exclusive).await
    }

    /// Issue the periodic status request.
    ///
    /// Returns `Ok(false)` without touching the link when it is closed or an
    /// exclusive run is active. The check and the write happen under the link
    /// lock, so a flash that starts concurrently is ordered after this write.
    pub async fn request_status(&self) -> Result<bool> {
        let mut state = self.link.lock().await;
        if self.exclusive.is_held() {
            return Ok(false);
        }
        let LinkState::Open(open) = &mut *state else {
            return Ok(false);
        };

        let line = format!("{}\n", DeviceCommand::SystemInfo.verb());
        if let Err(e) = open.link.write_all(line.as_bytes()) {
            let port = open.port.clone();
            state.take();
            drop(state);
            return Err(self.link_failed(&port, "write", e));
        }
        debug!("Status requested from {}", open.port);
        Ok(true)
    }

    async fn write_command(&self, command: &str, access: Access) -> Result<()> {
        let command = normalize_command(command)?;

        let mut state = self.link.lock().await;
        self.check_access(access)?;
        let LinkState::Open(open) = &mut *state else {
            return Err(Error::NotConnected);
        };

        let line = format!("{}\n", command);
        if let Err(e) = open.link.write_all(line.as_bytes()) {
            let port = open.port.clone();
            state.take();
            drop(state);
            return Err(self.link_failed(&port, "write", e));
        }
        drop(state);

        debug!("Sent: {}", command);
        self.hub.publish(LogEvent::sent(command));
        Ok(())
    }

    // ========================================================================
    // Read loop
    // ========================================================================

    /// One pass of the read loop: drain buffered bytes and publish lines.
    pub async fn read_once(&self) -> ReadOutcome {
        let mut state = self.link.lock().await;
        let LinkState::Open(open) = &mut *state else {
            return ReadOutcome::Closed;
        };

        let result = open.link.bytes_to_read().and_then(|available| {
            if available == 0 {
                return Ok(None);
            }
            let mut buf = vec![0u8; available.min(READ_CHUNK)];
            let n = open.link.read(&mut buf)?;
            buf.truncate(n);
            Ok(Some(buf))
        });

        let lines = match result {
            Ok(None) => return ReadOutcome::Idle,
            Ok(Some(bytes)) => open.framer.push(&bytes),
            Err(e) => {
                let port = open.port.clone();
                state.take();
                drop(state);
                self.link_failed(&port, "read", e);
                return ReadOutcome::Failed;
            }
        };
        drop(state);

        let count = lines.len();
        for line in lines {
            self.hub.publish(LogEvent::from_device_line(line));
        }
        ReadOutcome::Lines(count)
    }

    /// Run the read loop until `cancel` fires.
    pub async fn run_reader(self: Arc<Self>, cancel: CancellationToken) {
        debug!("Serial reader started");
        loop {
            let pause = match self.read_once().await {
                ReadOutcome::Lines(_) => None,
                ReadOutcome::Idle => Some(READ_IDLE_INTERVAL),
                ReadOutcome::Closed | ReadOutcome::Failed => Some(CLOSED_IDLE_INTERVAL),
            };

            match pause {
                Some(pause) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
                None => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            }
        }
        debug!("Serial reader stopped");
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn check_guard(&self, guard: &ExclusiveGuard) -> Result<()> {
        if guard.guards(&self.exclusive) {
            Ok(())
        } else {
            Err(Error::Busy)
        }
    }

    /// Must be called with the link lock held, so a flash that takes the
    /// flag and closes the link cannot slip in between check and use.
    fn check_access(&self, access: Access) -> Result<()> {
        if access == Access::Shared && self.exclusive.is_held() {
            return Err(Error::Busy);
        }
        Ok(())
    }

    /// Record a link failure after the link has been dropped.
    fn link_failed(&self, port: &str, op: &str, e: io::Error) -> Error {
        error!("Serial {} error on {}: {}", op, port, e);
        self.set_last_error(Some(e.to_string()));
        self.hub.publish(LogEvent::error(format!("Serial {} error: {}", op, e)));
        Error::Io(e)
    }

    fn set_last_error(&self, value: Option<String>) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = value;
    }
}

/// Strip one trailing line terminator and reject anything that is not a single line.
fn normalize_command(command: &str) -> Result<&str> {
    let command = command.trim_end_matches(['\r', '\n']);
    if command.trim().is_empty() {
        return Err(Error::InvalidCommand("empty command".to_string()));
    }
    if command.contains(['\r', '\n']) {
        return Err(Error::InvalidCommand(
            "command must be a single line".to_string(),
        ));
    }
    Ok(command)
}
