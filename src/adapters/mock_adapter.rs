//! Mock serial transport for testing
//!
//! Implements [`Transport`] without physical hardware. It provides:
//! - a log of every written line
//! - controllable failure injection
//! - scripted replies pushed by the test, or replies generated by a
//!   [`Responder`] such as [`SimulatedRig`]

use super::{SharedTransport, Transport, TransportFactory};
use crate::error::{AppResult, RigError};
use crate::model::Position;
use crate::protocol;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Produces the reply lines a device would send for one written line.
pub trait Responder: Send {
    /// Replies the device sends back for one written line.
    fn respond(&mut self, line: &str) -> Vec<String>;
}

/// Mock transport for testing
///
/// # Example
///
/// ```
/// use rig_control::adapters::{MockTransport, Transport};
/// use std::time::Duration;
///
/// let transport = MockTransport::new("COM1");
/// transport.push_line(">1<Idle|X0Y0Z0P0T0>");
/// transport.write_lines(&[">1?".to_string()]).unwrap();
/// assert_eq!(transport.written(), vec![">1?"]);
/// assert!(transport.read_line(Duration::from_millis(10)).unwrap().is_some());
/// ```
pub struct MockTransport {
    port_name: String,
    connected: AtomicBool,
    should_fail_next: AtomicBool,
    write_count: AtomicUsize,
    written: Mutex<Vec<String>>,
    inbox: Mutex<VecDeque<String>>,
    inbox_ready: Condvar,
    responder: Mutex<Option<Box<dyn Responder>>>,
}

impl MockTransport {
    /// Connected transport that only replies with lines pushed by the test.
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            connected: AtomicBool::new(true),
            should_fail_next: AtomicBool::new(false),
            write_count: AtomicUsize::new(0),
            written: Mutex::new(Vec::new()),
            inbox: Mutex::new(VecDeque::new()),
            inbox_ready: Condvar::new(),
            responder: Mutex::new(None),
        }
    }

    /// Connected transport answering through `responder`.
    pub fn with_responder(port_name: impl Into<String>, responder: impl Responder + 'static) -> Self {
        let transport = Self::new(port_name);
        *transport.responder.lock() = Some(Box::new(responder));
        transport
    }

    /// Fail the next write
    pub fn trigger_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    /// Simulate an unplugged cable.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        self.inbox_ready.notify_all();
    }

    /// Queue an inbound line for the reader.
    pub fn push_line(&self, line: impl Into<String>) {
        self.inbox.lock().push_back(line.into());
        self.inbox_ready.notify_all();
    }

    /// Every line written so far, in order.
    pub fn written(&self) -> Vec<String> {
        self.written.lock().clone()
    }

    /// Number of successful `write_lines` calls.
    pub fn write_count(&self) -> usize {
        self.write_count.load(Ordering::SeqCst)
    }

    /// Forget every recorded write.
    pub fn clear_written(&self) {
        self.written.lock().clear();
    }
}

impl Transport for MockTransport {
    fn port_name(&self) -> &str {
        &self.port_name
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn write_lines(&self, lines: &[String]) -> AppResult<()> {
        if !self.is_connected() {
            return Err(RigError::SerialPortNotConnected);
        }
        if self.should_fail_next.swap(false, Ordering::SeqCst) {
            return Err(RigError::Transport("Mock write failure".to_string()));
        }

        self.written.lock().extend(lines.iter().cloned());
        self.write_count.fetch_add(1, Ordering::SeqCst);

        let replies: Vec<String> = match self.responder.lock().as_mut() {
            Some(responder) => lines.iter().flat_map(|line| responder.respond(line)).collect(),
            None => Vec::new(),
        };
        if !replies.is_empty() {
            self.inbox.lock().extend(replies);
            self.inbox_ready.notify_all();
        }
        Ok(())
    }

    fn read_line(&self, timeout: Duration) -> AppResult<Option<String>> {
        let mut inbox = self.inbox.lock();
        if inbox.is_empty() && self.is_connected() {
            self.inbox_ready.wait_for(&mut inbox, timeout);
        }
        if let Some(line) = inbox.pop_front() {
            return Ok(Some(line));
        }
        if !self.is_connected() {
            return Err(RigError::SerialPortNotConnected);
        }
        Ok(None)
    }

    fn close(&self) {
        self.set_connected(false);
    }

    fn info(&self) -> String {
        format!("MockTransport({})", self.port_name)
    }
}

#[derive(Debug, Clone, Copy)]
struct SimulatedAxis {
    position: Position,
    absolute: bool,
    locked: bool,
}

/// Stand-in for a chain of motion controllers and shutter boxes.
///
/// Moves complete instantly: every motion command is acknowledged and followed
/// by an `Idle` status report at the new position.
#[derive(Debug, Clone, Default)]
pub struct SimulatedRig {
    devices: HashMap<u32, SimulatedAxis>,
    locked_on_boot: bool,
}

impl SimulatedRig {
    /// Rig whose devices appear on first contact, unlocked at the origin.
    pub fn new() -> Self {
        Self::default()
    }

    /// Devices start in the alarm state and need `$X` or `$H` before moving.
    pub fn locked(mut self) -> Self {
        self.locked_on_boot = true;
        self
    }

    /// Current simulated position of `device_id`.
    pub fn position(&self, device_id: u32) -> Option<Position> {
        self.devices.get(&device_id).map(|d| d.position)
    }

    fn device(&mut self, device_id: u32) -> &mut SimulatedAxis {
        let locked = self.locked_on_boot;
        self.devices.entry(device_id).or_insert(SimulatedAxis {
            position: Position::ORIGIN,
            absolute: false,
            locked,
        })
    }
}

impl Responder for SimulatedRig {
    fn respond(&mut self, line: &str) -> Vec<String> {
        let (device_id, body) = protocol::split_device_prefix(line.trim());
        let ack = protocol::command_line(device_id, "ok");
        let device = self.device(device_id);
        let status = |d: &SimulatedAxis| {
            let state = if d.locked { "Alarm" } else { "Idle" };
            protocol::format_status(device_id, state, &d.position)
        };

        match body {
            protocol::STATUS_QUERY => vec![status(device)],
            protocol::UNLOCK => {
                device.locked = false;
                vec![ack]
            }
            protocol::HOME => {
                device.locked = false;
                device.position = Position::ORIGIN;
                vec![ack, status(device)]
            }
            "G90" => {
                device.absolute = true;
                vec![ack]
            }
            "G91" => {
                device.absolute = false;
                vec![ack]
            }
            _ if body.starts_with("G0") || body.starts_with("G1") => {
                if device.locked {
                    return vec![protocol::command_line(device_id, "error:9")];
                }
                for (axis, value) in protocol::parse_axis_values(&body[2..]) {
                    if let Some(slot) = device.position.axis_mut(axis) {
                        if device.absolute {
                            *slot = value;
                        } else {
                            *slot += value;
                        }
                    }
                }
                vec![ack, status(device)]
            }
            _ if body.starts_with("C0") || body.starts_with("C1") => vec![ack],
            _ => vec![protocol::command_line(device_id, "error:20")],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyMode {
    Silent,
    Simulated { locked: bool },
}

/// Opens [`MockTransport`]s and keeps them for inspection.
pub struct MockTransportFactory {
    mode: ReplyMode,
    fail_open: AtomicBool,
    open_count: AtomicUsize,
    opened: Mutex<HashMap<String, Arc<MockTransport>>>,
}

impl MockTransportFactory {
    /// Transports that only carry lines pushed by the test.
    pub fn silent() -> Self {
        Self::with_mode(ReplyMode::Silent)
    }

    /// Transports backed by a fresh [`SimulatedRig`] per port.
    pub fn simulated() -> Self {
        Self::with_mode(ReplyMode::Simulated { locked: false })
    }

    /// Like [`simulated`](Self::simulated) but devices boot alarm-locked.
    pub fn simulated_locked() -> Self {
        Self::with_mode(ReplyMode::Simulated { locked: true })
    }

    fn with_mode(mode: ReplyMode) -> Self {
        Self {
            mode,
            fail_open: AtomicBool::new(false),
            open_count: AtomicUsize::new(0),
            opened: Mutex::new(HashMap::new()),
        }
    }

    /// Fail every subsequent open.
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Most recently opened transport for `port_name`.
    pub fn transport(&self, port_name: &str) -> Option<Arc<MockTransport>> {
        self.opened.lock().get(port_name).cloned()
    }

    /// Total number of successful opens.
    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }
}

impl TransportFactory for MockTransportFactory {
    fn open(&self, port_name: &str) -> AppResult<SharedTransport> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(RigError::Transport(format!(
                "Mock open failure on '{port_name}'"
            )));
        }
        let transport = Arc::new(match self.mode {
            ReplyMode::Silent => MockTransport::new(port_name),
            ReplyMode::Simulated { locked } => {
                let rig = if locked {
                    SimulatedRig::new().locked()
                } else {
                    SimulatedRig::new()
                };
                MockTransport::with_responder(port_name, rig)
            }
        });
        self.opened
            .lock()
            .insert(port_name.to_string(), Arc::clone(&transport));
        self.open_count.fetch_add(1, Ordering::SeqCst);
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_times_out_when_empty() {
        let transport = MockTransport::new("COM1");
        let line = transport.read_line(Duration::from_millis(5)).unwrap();
        assert!(line.is_none());
    }

    #[test]
    fn test_closed_transport_rejects_io() {
        let transport = MockTransport::new("COM1");
        transport.close();
        assert!(!transport.is_connected());
        assert!(transport.write_lines(&["?".into()]).is_err());
        assert!(transport.read_line(Duration::from_millis(5)).is_err());
    }

    #[test]
    fn test_simulated_rig_moves() {
        let mut rig = SimulatedRig::new();
        assert_eq!(rig.respond(">1G90"), vec![">1ok"]);
        let replies = rig.respond(">1G1X10.000Y0.000Z0.000P0.000T0.000");
        assert_eq!(replies[0], ">1ok");
        assert_eq!(replies[1], ">1<Idle|X10.000Y0.000Z0.000P0.000T0.000>");

        rig.respond(">1G91");
        rig.respond(">1G0X-2.500");
        assert_eq!(rig.position(1).unwrap().x, 7.5);
    }

    #[test]
    fn test_simulated_rig_lock() {
        let mut rig = SimulatedRig::new().locked();
        assert_eq!(rig.respond("G1X1"), vec!["error:9"]);
        assert!(rig.respond("?")[0].starts_with("<Alarm|"));
        rig.respond("$X");
        assert!(rig.respond("?")[0].starts_with("<Idle|"));
        assert_eq!(rig.respond("M3"), vec!["error:20"]);
    }

    #[test]
    fn test_responder_feeds_reader() {
        let transport = MockTransport::with_responder("COM2", SimulatedRig::new());
        transport.write_lines(&[">2?".to_string()]).unwrap();
        let line = transport.read_line(Duration::from_millis(10)).unwrap();
        assert_eq!(line.as_deref(), Some(">2<Idle|X0.000Y0.000Z0.000P0.000T0.000>"));
    }

    #[test]
    fn test_factory_tracks_opens() {
        let factory = MockTransportFactory::simulated();
        factory.open("COM1").unwrap();
        factory.open("COM2").unwrap();
        assert_eq!(factory.open_count(), 2);
        assert!(factory.transport("COM1").is_some());

        factory.set_fail_open(true);
        assert!(factory.open("COM3").is_err());
    }
}
