//! Serial transport for RS-232 / USB-serial controllers
//!
//! Wraps the `serialport` crate. The port is cloned into independent reader and
//! writer handles so the listener can block on reads while the sender writes.

use super::{SharedTransport, Transport, TransportFactory};
use crate::config::SerialConfig;
use crate::error::{AppResult, RigError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;

/// Reassembles lines from reads that may split or merge them.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the port.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Next complete line without its terminator (`\n`, `\r\n` or `\r`).
    pub fn next_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|&b| b == b'\n' || b == b'\r')?;
        let mut rest = self.pending.split_off(end);
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        let skip = if rest.starts_with(b"\r\n") { 2 } else { 1 };
        rest.drain(..skip);
        self.pending = rest;
        Some(line)
    }

    /// True when no partial line is held.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Serial transport for one port.
pub struct SerialTransport {
    port_name: String,
    baud_rate: u32,
    line_terminator: String,
    connected: AtomicBool,
    #[cfg(feature = "instrument_serial")]
    writer: Mutex<Option<Box<dyn SerialPort>>>,
    #[cfg(feature = "instrument_serial")]
    reader: Mutex<Option<(Box<dyn SerialPort>, LineBuffer)>>,
}

impl SerialTransport {
    /// Open `port_name` with the given link settings.
    #[cfg(feature = "instrument_serial")]
    pub fn open(port_name: &str, settings: &SerialConfig) -> AppResult<Self> {
        let port = serialport::new(port_name, settings.baud_rate)
            .timeout(Duration::from_millis(settings.read_timeout_ms))
            .open()
            .map_err(|e| {
                RigError::Transport(format!(
                    "Failed to open serial port '{}' at {} baud: {}",
                    port_name, settings.baud_rate, e
                ))
            })?;
        let reader = port.try_clone()?;

        debug!(
            "Serial port '{}' opened at {} baud",
            port_name, settings.baud_rate
        );

        Ok(Self {
            port_name: port_name.to_string(),
            baud_rate: settings.baud_rate,
            line_terminator: settings.line_terminator.clone(),
            connected: AtomicBool::new(true),
            writer: Mutex::new(Some(port)),
            reader: Mutex::new(Some((reader, LineBuffer::new()))),
        })
    }

    /// Always fails: the crate was built without serial support.
    #[cfg(not(feature = "instrument_serial"))]
    pub fn open(_port_name: &str, _settings: &SerialConfig) -> AppResult<Self> {
        Err(RigError::SerialFeatureDisabled)
    }

    fn mark_lost(&self, reason: &str) {
        if self.connected.swap(false, Ordering::SeqCst) {
            debug!("Serial port '{}' lost: {}", self.port_name, reason);
        }
    }
}

#[cfg(feature = "instrument_serial")]
impl Transport for SerialTransport {
    fn port_name(&self) -> &str {
        &self.port_name
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn write_lines(&self, lines: &[String]) -> AppResult<()> {
        use std::io::Write;

        let payload: String = lines
            .iter()
            .map(|line| format!("{}{}", line, self.line_terminator))
            .collect();

        let mut guard = self.writer.lock();
        let port = guard.as_mut().ok_or(RigError::SerialPortNotConnected)?;
        let result = port
            .write_all(payload.as_bytes())
            .and_then(|()| port.flush());
        if let Err(e) = result {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                self.mark_lost("broken pipe on write");
            }
            return Err(RigError::Transport(format!(
                "Failed to write to serial port '{}': {}",
                self.port_name, e
            )));
        }
        Ok(())
    }

    fn read_line(&self, timeout: Duration) -> AppResult<Option<String>> {
        use std::io::Read;

        let deadline = Instant::now() + timeout;
        let mut guard = self.reader.lock();
        let (port, buffer) = guard.as_mut().ok_or(RigError::SerialPortNotConnected)?;
        let mut chunk = [0u8; 256];

        loop {
            if let Some(line) = buffer.next_line() {
                return Ok(Some(line));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            match port.read(&mut chunk) {
                Ok(0) => {
                    self.mark_lost("end of stream");
                    return Err(RigError::SerialPortNotConnected);
                }
                Ok(n) => buffer.extend(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => {
                    self.mark_lost("read error");
                    return Err(RigError::Transport(format!(
                        "Serial read error on '{}': {}",
                        self.port_name, e
                    )));
                }
            }
        }
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if self.writer.lock().take().is_some() {
            debug!("Serial port '{}' closed", self.port_name);
        }
        self.reader.lock().take();
    }

    fn info(&self) -> String {
        format!(
            "SerialTransport({} @ {} baud)",
            self.port_name, self.baud_rate
        )
    }
}

/// Opens [`SerialTransport`]s with shared link settings.
#[derive(Debug, Clone, Default)]
pub struct SerialTransportFactory {
    settings: SerialConfig,
}

impl SerialTransportFactory {
    /// Factory opening every port with `settings`.
    pub fn new(settings: SerialConfig) -> Self {
        Self { settings }
    }
}

impl TransportFactory for SerialTransportFactory {
    #[cfg(feature = "instrument_serial")]
    fn open(&self, port_name: &str) -> AppResult<SharedTransport> {
        Ok(Arc::new(SerialTransport::open(port_name, &self.settings)?))
    }

    #[cfg(not(feature = "instrument_serial"))]
    fn open(&self, _port_name: &str) -> AppResult<SharedTransport> {
        Err(RigError::SerialFeatureDisabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_handles_split_reads() {
        let mut buffer = LineBuffer::new();
        buffer.extend(b"<Idle|X0");
        assert!(buffer.next_line().is_none());
        buffer.extend(b".000>\r\nok\n>1ok");
        assert_eq!(buffer.next_line().as_deref(), Some("<Idle|X0.000>"));
        assert_eq!(buffer.next_line().as_deref(), Some("ok"));
        assert!(buffer.next_line().is_none());
        assert!(!buffer.is_empty());
        buffer.extend(b"\r");
        assert_eq!(buffer.next_line().as_deref(), Some(">1ok"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_line_buffer_empty_lines() {
        let mut buffer = LineBuffer::new();
        buffer.extend(b"\n\nabc\n");
        assert_eq!(buffer.next_line().as_deref(), Some(""));
        assert_eq!(buffer.next_line().as_deref(), Some(""));
        assert_eq!(buffer.next_line().as_deref(), Some("abc"));
    }

    #[cfg(feature = "instrument_serial")]
    #[test]
    fn test_open_missing_port_fails() {
        let result = SerialTransport::open("/dev/does-not-exist-rig", &SerialConfig::default());
        assert!(matches!(result, Err(RigError::Transport(_))));
    }
}
