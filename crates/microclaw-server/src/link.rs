//! Serial link abstraction.
//!
//! The session manager talks to the device through [`SerialLink`] and opens
//! links through a [`LinkOpener`], so the same coordinator runs against:
//! - [`SystemSerial`]: real ports via the `serialport` crate
//! - [`MemoryOpener`]: an in-process device for tests and demo mode

use std::collections::{HashMap, HashSet, VecDeque};
#[cfg(target_os = "linux")]
use std::fs;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serialport::{SerialPort, SerialPortType};
use tracing::debug;

/// Baud rate of the device console.
pub const DEVICE_BAUD_RATE: u32 = 115_200;

/// Read timeout on real ports; reads only happen once bytes are available.
const PORT_TIMEOUT: Duration = Duration::from_millis(100);

/// An open connection to the device.
///
/// All calls are expected to return promptly: `bytes_to_read` never blocks and
/// `read` is only issued for bytes already buffered.
pub trait SerialLink: Send {
    /// Bytes that can be read without blocking.
    fn bytes_to_read(&mut self) -> io::Result<usize>;

    /// Read buffered bytes into `buf`.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write the whole buffer and flush it.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
}

/// Opens links and enumerates candidate ports.
pub trait LinkOpener: Send + Sync {
    fn open(&self, port: &str, baud_rate: u32) -> io::Result<Box<dyn SerialLink>>;

    fn list_ports(&self) -> Vec<String>;
}

// ============================================================================
// Real serial ports
// ============================================================================

/// Opens operating-system serial ports.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSerial;

struct NativeLink {
    port: Box<dyn SerialPort>,
}

impl SerialLink for NativeLink {
    fn bytes_to_read(&mut self) -> io::Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            other => other,
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        Write::write_all(&mut self.port, data)?;
        self.port.flush()
    }
}

impl LinkOpener for SystemSerial {
    fn open(&self, port: &str, baud_rate: u32) -> io::Result<Box<dyn SerialLink>> {
        let port = serialport::new(port, baud_rate).timeout(PORT_TIMEOUT).open()?;
        Ok(Box::new(NativeLink { port }))
    }

    fn list_ports(&self) -> Vec<String> {
        let mut candidates = Vec::new();
        let mut others = Vec::new();

        for info in serialport::available_ports().unwrap_or_default() {
            let is_usb = matches!(info.port_type, SerialPortType::UsbPort(_));
            if is_usb || looks_like_usb(&info.port_name) {
                candidates.push(info.port_name);
            } else {
                others.push(info.port_name);
            }
        }

        // The enumeration backend can miss freshly plugged USB adapters.
        #[cfg(target_os = "linux")]
        if let Ok(entries) = fs::read_dir("/dev") {
            for entry in entries.flatten() {
                if let Some(name) = entry.file_name().to_str() {
                    let full = format!("/dev/{}", name);
                    if looks_like_usb(name) && !candidates.contains(&full) {
                        candidates.push(full);
                    }
                }
            }
        }

        select_ports(candidates, others)
    }
}

fn looks_like_usb(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    upper.contains("USB") || upper.contains("ACM")
}

/// Prefer USB candidates, fall back to everything, and order deterministically.
pub fn select_ports(candidates: Vec<String>, others: Vec<String>) -> Vec<String> {
    let mut ports = if candidates.is_empty() { others } else { candidates };
    ports.sort_by_key(|p| port_sort_key(p));
    ports.dedup();
    ports
}

/// `ttyACM*` first, then `ttyUSB*` (both numerically), then everything else by name.
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, name.to_string())
}

// ============================================================================
// In-memory device
// ============================================================================

#[derive(Debug, Default)]
struct MemoryBus {
    ports: Vec<String>,
    refused: HashSet<String>,
    incoming: VecDeque<u8>,
    written: Vec<u8>,
    pending_line: Vec<u8>,
    replies: HashMap<String, String>,
    read_failure: Option<io::ErrorKind>,
    write_failure: Option<io::ErrorKind>,
    opened: Vec<String>,
}

/// A simulated device shared by every link it opens.
///
/// Bytes pushed with [`MemoryOpener::push_incoming`] are read by the session;
/// everything the session writes is recorded. Registered auto-replies are
/// queued as incoming lines whenever the matching command line is written.
#[derive(Debug, Clone, Default)]
pub struct MemoryOpener {
    bus: Arc<Mutex<MemoryBus>>,
}

impl MemoryOpener {
    pub fn new<I, S>(ports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let opener = Self::default();
        opener.bus().ports = ports.into_iter().map(Into::into).collect();
        opener
    }

    /// Queue bytes for the session to read.
    pub fn push_incoming(&self, bytes: &[u8]) {
        self.bus().incoming.extend(bytes.iter().copied());
    }

    /// Answer `command` with `reply` (one line) every time it is written.
    pub fn auto_reply(&self, command: impl Into<String>, reply: impl Into<String>) {
        self.bus().replies.insert(command.into(), reply.into());
    }

    /// Make opening `port` fail with `PermissionDenied`.
    pub fn refuse(&self, port: impl Into<String>) {
        self.bus().refused.insert(port.into());
    }

    /// Fail the next read with `kind`.
    pub fn fail_next_read(&self, kind: io::ErrorKind) {
        self.bus().read_failure = Some(kind);
    }

    /// Fail the next write with `kind`.
    pub fn fail_next_write(&self, kind: io::ErrorKind) {
        self.bus().write_failure = Some(kind);
    }

    /// Everything written so far, lossily decoded.
    pub fn written(&self) -> String {
        String::from_utf8_lossy(&self.bus().written).into_owned()
    }

    /// Everything written since the last call, clearing the record.
    pub fn take_written(&self) -> String {
        let written = std::mem::take(&mut self.bus().written);
        String::from_utf8_lossy(&written).into_owned()
    }

    /// Written command lines, without newlines.
    pub fn written_lines(&self) -> Vec<String> {
        self.written().lines().map(str::to_string).collect()
    }

    /// Ports opened so far, in order.
    pub fn opened(&self) -> Vec<String> {
        self.bus().opened.clone()
    }

    fn bus(&self) -> MutexGuard<'_, MemoryBus> {
        lock_bus(&self.bus)
    }
}

fn lock_bus(bus: &Mutex<MemoryBus>) -> MutexGuard<'_, MemoryBus> {
    bus.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LinkOpener for MemoryOpener {
    fn open(&self, port: &str, _baud_rate: u32) -> io::Result<Box<dyn SerialLink>> {
        let mut bus = self.bus();
        if bus.refused.contains(port) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("permission denied: {}", port),
            ));
        }
        if !bus.ports.iter().any(|p| p == port) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such port: {}", port),
            ));
        }
        bus.opened.push(port.to_string());
        bus.pending_line.clear();
        debug!("Memory link opened on {}", port);
        Ok(Box::new(MemoryLink {
            bus: Arc::clone(&self.bus),
        }))
    }

    fn list_ports(&self) -> Vec<String> {
        select_ports(self.bus().ports.clone(), Vec::new())
    }
}

struct MemoryLink {
    bus: Arc<Mutex<MemoryBus>>,
}

impl SerialLink for MemoryLink {
    fn bytes_to_read(&mut self) -> io::Result<usize> {
        let bus = lock_bus(&self.bus);
        if bus.read_failure.is_some() {
            // Report data so the caller issues the failing read.
            return Ok(bus.incoming.len().max(1));
        }
        Ok(bus.incoming.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut bus = lock_bus(&self.bus);
        if let Some(kind) = bus.read_failure.take() {
            return Err(io::Error::new(kind, "device unplugged"));
        }
        let n = buf.len().min(bus.incoming.len());
        for (slot, byte) in buf.iter_mut().zip(bus.incoming.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut bus = lock_bus(&self.bus);
        if let Some(kind) = bus.write_failure.take() {
            return Err(io::Error::new(kind, "write failed"));
        }
        bus.written.extend_from_slice(data);

        for &b in data {
            if b != b'\n' {
                bus.pending_line.push(b);
                continue;
            }
            let line = String::from_utf8_lossy(&bus.pending_line).trim().to_string();
            bus.pending_line.clear();
            if let Some(reply) = bus.replies.get(&line).cloned() {
                bus.incoming.extend(reply.bytes());
                bus.incoming.push_back(b'\n');
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_sorting() {
        let ports = select_ports(
            vec![
                "/dev/ttyUSB1".into(),
                "/dev/ttyACM1".into(),
                "/dev/ttyUSB0".into(),
                "/dev/ttyACM10".into(),
                "/dev/ttyACM0".into(),
            ],
            vec!["/dev/ttyS0".into()],
        );
        assert_eq!(
            ports,
            vec![
                "/dev/ttyACM0",
                "/dev/ttyACM1",
                "/dev/ttyACM10",
                "/dev/ttyUSB0",
                "/dev/ttyUSB1",
            ]
        );
    }

    #[test]
    fn test_fallback_to_all_ports() {
        let ports = select_ports(Vec::new(), vec!["COM4".into(), "COM3".into()]);
        assert_eq!(ports, vec!["COM3", "COM4"]);
    }

    #[test]
    fn test_usb_name_detection() {
        assert!(looks_like_usb("ttyUSB0"));
        assert!(looks_like_usb("/dev/cu.usbserial-0001"));
        assert!(looks_like_usb("ttyACM3"));
        assert!(!looks_like_usb("ttyS0"));
    }

    #[test]
    fn test_memory_link_round_trip() {
        let opener = MemoryOpener::new(["/dev/ttyUSB0"]);
        opener.auto_reply("system_info", r#"{"heap_free": 1}"#);
        let mut link = opener.open("/dev/ttyUSB0", DEVICE_BAUD_RATE).unwrap();

        link.write_all(b"system_info\n").unwrap();
        assert_eq!(opener.written(), "system_info\n");

        let available = link.bytes_to_read().unwrap();
        let mut buf = vec![0u8; available];
        assert_eq!(link.read(&mut buf).unwrap(), available);
        assert_eq!(buf, b"{\"heap_free\": 1}\n");
    }

    #[test]
    fn test_take_written_clears_record() {
        let opener = MemoryOpener::new(["/dev/ttyUSB0"]);
        let mut link = opener.open("/dev/ttyUSB0", DEVICE_BAUD_RATE).unwrap();

        link.write_all(b"system_info\n").unwrap();
        assert_eq!(opener.take_written(), "system_info\n");
        assert_eq!(opener.written(), "");

        link.write_all(b"restart\n").unwrap();
        assert_eq!(opener.written_lines(), vec!["restart"]);
    }

    #[test]
    fn test_memory_open_failures() {
        let opener = MemoryOpener::new(["/dev/ttyUSB0"]);
        opener.refuse("/dev/ttyUSB0");

        let err = opener.open("/dev/ttyUSB0", DEVICE_BAUD_RATE).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        let err = opener.open("/dev/missing", DEVICE_BAUD_RATE).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(opener.opened().is_empty());
    }
}
