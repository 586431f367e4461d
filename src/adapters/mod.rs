//! Serial link adapters.
//!
//! The orchestration layer only talks to devices through the [`Transport`]
//! capability: write a batch of lines in one write, read one line with a
//! bounded wait. Byte framing is handled here, below that interface.

use crate::error::AppResult;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub mod command_batch;
pub mod mock_adapter;
pub mod serial_adapter;

pub use command_batch::CommandBatch;
pub use mock_adapter::{MockTransport, MockTransportFactory, Responder, SimulatedRig};
pub use serial_adapter::{LineBuffer, SerialTransport, SerialTransportFactory};

/// Line-oriented half-duplex link to one serial port.
pub trait Transport: Send + Sync {
    /// Port name (e.g. "/dev/ttyUSB0", "COM3")
    fn port_name(&self) -> &str;

    /// True until the link is closed or lost.
    fn is_connected(&self) -> bool;

    /// Write every line, each terminated, as a single write.
    fn write_lines(&self, lines: &[String]) -> AppResult<()>;

    /// Read one complete line, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` when nothing complete arrived in time.
    fn read_line(&self, timeout: Duration) -> AppResult<Option<String>>;

    /// Close the link. Idempotent.
    fn close(&self);

    /// Human-readable adapter description
    fn info(&self) -> String {
        format!("Transport({})", self.port_name())
    }
}

/// Shared transport handle.
pub type SharedTransport = Arc<dyn Transport>;

/// Opens transports by port name.
pub trait TransportFactory: Send + Sync {
    /// Open `port_name`, failing if it cannot be reached.
    fn open(&self, port_name: &str) -> AppResult<SharedTransport>;
}

/// Open transports keyed by port name.
#[derive(Default)]
pub struct LinkTable(RwLock<BTreeMap<String, SharedTransport>>);

impl LinkTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `transport`, returning any transport it replaced.
    pub fn insert(&self, transport: SharedTransport) -> Option<SharedTransport> {
        self.0
            .write()
            .insert(transport.port_name().to_string(), transport)
    }

    /// Take the transport for `port` out of the table.
    pub fn remove(&self, port: &str) -> Option<SharedTransport> {
        self.0.write().remove(port)
    }

    /// Transport for `port`, if open.
    pub fn get(&self, port: &str) -> Option<SharedTransport> {
        self.0.read().get(port).cloned()
    }

    /// True when `port` has a transport.
    pub fn contains(&self, port: &str) -> bool {
        self.0.read().contains_key(port)
    }

    /// Names of every open port.
    pub fn ports(&self) -> Vec<String> {
        self.0.read().keys().cloned().collect()
    }

    /// True while at least one registered transport is still connected.
    pub fn any_connected(&self) -> bool {
        self.0.read().values().any(|t| t.is_connected())
    }

    /// True when no port is open.
    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }
}

/// Serial ports currently visible to the OS.
#[cfg(feature = "instrument_serial")]
pub fn list_ports() -> AppResult<Vec<String>> {
    Ok(serialport::available_ports()?
        .into_iter()
        .map(|port| port.port_name)
        .collect())
}

/// Serial ports currently visible to the OS.
#[cfg(not(feature = "instrument_serial"))]
pub fn list_ports() -> AppResult<Vec<String>> {
    Err(crate::error::RigError::SerialFeatureDisabled)
}
