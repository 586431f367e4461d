//! Machine readiness state machine.
//!
//! [`Machine`] owns the device table and folds every parsed reply into a single
//! aggregate [`MachineStatus`]. It performs no I/O: each entry point returns the
//! [`Effect`]s the caller has to carry out (lines to write, handshake updates,
//! run cancellation, notifications).
//!
//! ```text
//! Disconnected -> New -> (unlock, G90, ?) -> Idle <-> Busy
//!                                              \-> Locked -> Idle
//! ```
//!
//! A port is *new* until its devices answered the unlock round-trip. A device
//! is *busy* while it has a dispatched target it has not reported reaching.

use crate::model::{Action, ActionKind, Device, DeviceKind, Position, SerialResponse};
use crate::notify::Signal;
use crate::protocol::{self, Reply};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

/// Aggregate readiness, ordered from least to most ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MachineStatus {
    /// No port is open
    Disconnected,
    /// A port is still completing its unlock round-trip
    New,
    /// A device is alarm-locked
    Locked,
    /// A device has not reached its target
    Busy,
    /// Every device is idle
    Idle,
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MachineStatus::Disconnected => "disconnected",
            MachineStatus::New => "new",
            MachineStatus::Locked => "locked",
            MachineStatus::Busy => "busy",
            MachineStatus::Idle => "idle",
        };
        f.write_str(name)
    }
}

/// Work the caller must perform on behalf of the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Write `lines` to `port` in one write
    Send {
        /// Target port
        port: String,
        /// Lines in write order
        lines: Vec<String>,
    },
    /// Update the handshake flag
    ClearToSend(bool),
    /// Cancel the imaging run, if any
    CancelImaging,
    /// Emit a notification
    Notify(Signal, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    /// Waiting for the first reply after opening the port
    Querying,
    /// Unlock, absolute mode and a fresh query were sent. Maps each device
    /// still to report to the number of those commands it has yet to answer.
    Unlocking(BTreeMap<u32, u8>),
    Ready,
}

/// Commands per device in the unlock round-trip that each get an answer.
const UNLOCK_COMMANDS: u8 = 2;

/// What a reply tells the connect handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Heard {
    /// `ok` or `error:{n}` answering a command
    Answer,
    /// Status report
    Report { locked: bool },
    /// Unsolicited line such as `ALARM:{n}`
    Other,
}

#[derive(Debug, Clone)]
struct Connection {
    connected_at: Instant,
    last_query: Instant,
    last_report: Option<Instant>,
    phase: Phase,
}

/// Device table plus aggregate readiness.
#[derive(Debug)]
pub struct Machine {
    devices: BTreeMap<u32, Device>,
    connections: HashMap<String, Connection>,
    dispatched_at: HashMap<u32, Instant>,
    status: MachineStatus,
    stale_after: Duration,
}

impl Machine {
    /// Machine over `devices`, with every port closed.
    pub fn new(devices: impl IntoIterator<Item = Device>, stale_after: Duration) -> Self {
        Self {
            devices: devices.into_iter().map(|d| (d.device_id, d)).collect(),
            connections: HashMap::new(),
            dispatched_at: HashMap::new(),
            status: MachineStatus::Disconnected,
            stale_after,
        }
    }

    /// Current aggregate readiness.
    pub fn status(&self) -> MachineStatus {
        self.status
    }

    /// True when the machine accepts the next motion.
    pub fn is_idle(&self) -> bool {
        self.status == MachineStatus::Idle
    }

    /// Device by id.
    pub fn device(&self, device_id: u32) -> Option<&Device> {
        self.devices.get(&device_id)
    }

    /// Mutable device by id.
    pub fn device_mut(&mut self, device_id: u32) -> Option<&mut Device> {
        self.devices.get_mut(&device_id)
    }

    /// True when `device_id` is in the device table.
    pub fn contains(&self, device_id: u32) -> bool {
        self.devices.contains_key(&device_id)
    }

    /// Every device, in id order.
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// Snapshot of the device table.
    pub fn device_list(&self) -> Vec<Device> {
        self.devices.values().cloned().collect()
    }

    /// Port a serial device is reached through.
    pub fn port_of(&self, device_id: u32) -> Option<&str> {
        self.devices
            .get(&device_id)
            .filter(|d| d.kind.is_serial())
            .and_then(|d| d.port.as_deref())
    }

    /// True while `port` is open.
    pub fn is_port_connected(&self, port: &str) -> bool {
        self.connections.contains_key(port)
    }

    /// Connected positioners, in device id order.
    pub fn connected_positioners(&self) -> Vec<u32> {
        self.expected()
            .filter(|d| d.kind == DeviceKind::Positioner)
            .map(|d| d.device_id)
            .collect()
    }

    fn on_port<'a>(&'a self, port: &'a str) -> impl Iterator<Item = &'a Device> + 'a {
        self.devices
            .values()
            .filter(move |d| d.kind.is_serial() && d.port.as_deref() == Some(port))
    }

    /// Devices currently expected to report: serial devices on a connected port.
    fn expected(&self) -> impl Iterator<Item = &Device> {
        self.devices.values().filter(|d| {
            d.kind.is_serial()
                && d.port
                    .as_deref()
                    .is_some_and(|port| self.connections.contains_key(port))
        })
    }

    fn ids_on_port(&self, port: &str) -> Vec<u32> {
        self.on_port(port).map(|d| d.device_id).collect()
    }

    /// A port was opened.
    pub fn on_connect(&mut self, port: &str, now: Instant) -> Vec<Effect> {
        let ids = self.ids_on_port(port);
        for id in &ids {
            if let Some(device) = self.devices.get_mut(id) {
                device.reset_connection_state();
            }
        }
        let phase = if ids.is_empty() {
            Phase::Ready
        } else {
            Phase::Querying
        };
        self.connections.insert(
            port.to_string(),
            Connection {
                connected_at: now,
                last_query: now,
                last_report: None,
                phase,
            },
        );

        let mut effects = vec![Effect::Notify(
            Signal::Info,
            format!("Connected to {port} ({} device(s))", ids.len()),
        )];
        if !ids.is_empty() {
            effects.push(Effect::Send {
                port: port.to_string(),
                lines: query_lines(&ids),
            });
        }
        self.refresh(&mut effects);
        effects
    }

    /// A port was closed.
    pub fn on_disconnect(&mut self, port: &str) -> Vec<Effect> {
        if self.connections.remove(port).is_none() {
            return Vec::new();
        }
        for id in self.ids_on_port(port) {
            if let Some(device) = self.devices.get_mut(&id) {
                device.reset_connection_state();
            }
            self.dispatched_at.remove(&id);
        }
        let mut effects = vec![Effect::Notify(
            Signal::Info,
            format!("Disconnected from {port}"),
        )];
        self.refresh(&mut effects);
        effects
    }

    /// Record actions that are about to be written.
    ///
    /// Must run before the write so that a reply racing the write is judged
    /// against the new target.
    pub fn on_dispatch(&mut self, actions: &[Action], now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        let mut motion = false;
        for action in actions {
            let Some(device) = self.devices.get_mut(&action.device_id()) else {
                continue;
            };
            match action.kind() {
                ActionKind::AbsoluteMode => device.is_move_absolute = true,
                ActionKind::RelativeMode => device.is_move_absolute = false,
                ActionKind::Home => {
                    device.is_homed = false;
                    device.target = Some(Position::ORIGIN);
                }
                kind if kind.is_move() => {
                    device.target =
                        action.resolve_target(device.position, device.is_move_absolute);
                }
                _ => {}
            }
            if action.kind().is_motion() {
                motion = true;
                self.dispatched_at.insert(action.device_id(), now);
            }
        }
        if motion {
            effects.push(Effect::ClearToSend(false));
        }
        self.refresh(&mut effects);
        effects
    }

    /// Roll back targets of actions whose write failed.
    pub fn on_write_failed(&mut self, actions: &[Action]) -> Vec<Effect> {
        for action in actions.iter().filter(|a| a.kind().is_motion()) {
            if let Some(device) = self.devices.get_mut(&action.device_id()) {
                device.target = None;
            }
            self.dispatched_at.remove(&action.device_id());
        }
        let mut effects = Vec::new();
        self.refresh(&mut effects);
        effects
    }

    /// Fold one parsed line read from `port`.
    pub fn on_reply(&mut self, port: &str, reply: Reply) -> Vec<Effect> {
        let response = match reply {
            Reply::Response(response) => response,
            Reply::Ack { device_id } => {
                let mut effects = Vec::new();
                if self.devices.contains_key(&device_id) {
                    self.settle_unlock(port, device_id, Heard::Answer);
                    self.refresh(&mut effects);
                }
                return effects;
            }
            Reply::Other { .. } => return Vec::new(),
        };
        let device_id = response.device_id;
        let mut effects = Vec::new();

        if !self.devices.contains_key(&device_id) {
            effects.push(Effect::Notify(
                Signal::Debug,
                format!("Reply from unknown device {device_id} on {port}"),
            ));
            return effects;
        }

        let was_busy = self.status == MachineStatus::Busy;
        let connecting = self
            .connections
            .get(port)
            .is_some_and(|c| c.phase != Phase::Ready);
        let reported_at = response.reported_at;
        let fault = response.error || response.locked;
        let stale_after = self.stale_after;
        let dispatched_at = self.dispatched_at.get(&device_id).copied();

        if let Some(conn) = self.connections.get_mut(port) {
            conn.last_report = Some(reported_at);
        }

        if let Some(device) = self.devices.get_mut(&device_id) {
            if let Some(position) = response.position {
                device.position = position;
            }
            if response.is_status_report() {
                device.reported_since_connect = true;
            }
            if fault {
                device.target = None;
            } else if let Some(target) = device.target {
                if target_reached(&response, &target) {
                    device.target = None;
                } else if response.idle
                    && dispatched_at.is_some_and(|at| reported_at.duration_since(at) > stale_after)
                {
                    device.target = None;
                    effects.push(Effect::Notify(
                        Signal::Error,
                        format!(
                            "Device {device_id} went idle short of its target ({:.3}, {:.3}, {:.3}, {:.3}, {:.3})",
                            target.x, target.y, target.z, target.p, target.t
                        ),
                    ));
                }
            }
            if device.target.is_none() {
                self.dispatched_at.remove(&device_id);
            }
            device.last_response = Some(response.clone());
        }

        if fault {
            let what = if response.locked { "an alarm lock" } else { "an error" };
            if was_busy {
                effects.push(Effect::Notify(
                    Signal::Error,
                    format!("Device {device_id} reported {what} while busy; cancelling imaging"),
                ));
                effects.push(Effect::CancelImaging);
            } else if connecting {
                effects.push(Effect::Notify(
                    Signal::Debug,
                    format!("Device {device_id} reported {what} while connecting"),
                ));
            } else {
                effects.push(Effect::Notify(
                    Signal::Error,
                    format!("Device {device_id} reported {what}"),
                ));
            }
        }

        let heard = if response.is_status_report() {
            Heard::Report {
                locked: response.locked,
            }
        } else if response.error {
            Heard::Answer
        } else {
            Heard::Other
        };
        if !self.settle_unlock(port, device_id, heard) {
            self.begin_unlock(port, reported_at, &mut effects);
        }
        self.refresh(&mut effects);
        effects
    }

    /// Periodic check: re-query ports whose devices are stale or busy and silent.
    pub fn on_tick(&mut self, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        let ports: Vec<String> = self.connections.keys().cloned().collect();
        for port in ports {
            let ids = self.ids_on_port(&port);
            if ids.is_empty() {
                continue;
            }
            let waiting = self.on_port(&port).any(|d| d.is_stale() || d.target.is_some());
            let stale_after = self.stale_after;
            let Some(conn) = self.connections.get_mut(&port) else {
                continue;
            };
            let unlocking = matches!(conn.phase, Phase::Unlocking(_));
            let last_heard = conn.last_report.unwrap_or(conn.connected_at).max(conn.last_query);
            if (waiting || unlocking) && now.duration_since(last_heard) >= stale_after {
                conn.last_query = now;
                // Answers not seen by now are lost; the next report decides.
                if let Phase::Unlocking(pending) = &mut conn.phase {
                    pending.values_mut().for_each(|left| *left = 0);
                }
                effects.push(Effect::Notify(
                    Signal::Debug,
                    format!("No report from {port}; re-querying"),
                ));
                effects.push(Effect::Send {
                    port: port.clone(),
                    lines: query_lines(&ids),
                });
            }
        }
        effects
    }

    /// Flag devices as homed at the origin.
    pub fn mark_homed(&mut self, ids: &[u32]) {
        for id in ids {
            if let Some(device) = self.devices.get_mut(id) {
                device.is_homed = true;
                device.position = Position::ORIGIN;
                device.target = None;
            }
        }
    }

    /// Sync the capture-in-flight flag of a remote-capture device.
    pub fn set_writing(&mut self, device_id: u32, writing: bool) {
        if let Some(device) = self.devices.get_mut(&device_id) {
            device.is_writing = writing;
        }
    }

    /// Fold a reply into a port that is waiting on its unlock round-trip.
    ///
    /// A device leaves the pending set on a status report that is not locked,
    /// or on any report once it has answered every unlock command. Reports
    /// still in flight from the first query are locked and answer nothing, so
    /// they cannot complete the handshake. Returns false when the port is not
    /// unlocking.
    fn settle_unlock(&mut self, port: &str, device_id: u32, heard: Heard) -> bool {
        let Some(conn) = self.connections.get_mut(port) else {
            return false;
        };
        let Phase::Unlocking(pending) = &mut conn.phase else {
            return false;
        };
        match heard {
            Heard::Answer => {
                if let Some(left) = pending.get_mut(&device_id) {
                    *left = left.saturating_sub(1);
                }
            }
            Heard::Report { locked } => {
                if pending.get(&device_id).is_some_and(|left| !locked || *left == 0) {
                    pending.remove(&device_id);
                }
            }
            Heard::Other => {}
        }
        if pending.is_empty() {
            conn.phase = Phase::Ready;
        }
        true
    }

    /// First reply on a new port: send unlock, absolute mode and a fresh query.
    fn begin_unlock(&mut self, port: &str, now: Instant, effects: &mut Vec<Effect>) {
        if self.connections.get(port).map(|c| &c.phase) != Some(&Phase::Querying) {
            return;
        }

        let ids = self.ids_on_port(port);
        let mut lines = Vec::with_capacity(ids.len() * 3);
        for id in &ids {
            lines.push(protocol::command_line(*id, protocol::UNLOCK));
            lines.push(protocol::command_line(*id, protocol::ABSOLUTE_MODE));
            if let Some(device) = self.devices.get_mut(id) {
                device.is_move_absolute = true;
            }
        }
        lines.extend(query_lines(&ids));
        if let Some(conn) = self.connections.get_mut(port) {
            conn.phase = Phase::Unlocking(ids.iter().map(|id| (*id, UNLOCK_COMMANDS)).collect());
            conn.last_query = now;
        }
        effects.push(Effect::Notify(
            Signal::Info,
            format!("Unlocking {} device(s) on {port}", ids.len()),
        ));
        effects.push(Effect::Send {
            port: port.to_string(),
            lines,
        });
    }

    fn compute_status(&self) -> MachineStatus {
        if self.connections.is_empty() {
            return MachineStatus::Disconnected;
        }
        if self.connections.values().any(|c| c.phase != Phase::Ready) {
            return MachineStatus::New;
        }
        self.expected()
            .map(readiness)
            .min()
            .unwrap_or(MachineStatus::Idle)
    }

    /// Recompute the aggregate and emit transition effects.
    fn refresh(&mut self, effects: &mut Vec<Effect>) {
        let previous = self.status;
        let next = self.compute_status();
        if previous == next {
            return;
        }
        self.status = next;
        match next {
            MachineStatus::Idle => {
                effects.push(Effect::ClearToSend(true));
                let message = if previous == MachineStatus::New {
                    "machine ready"
                } else {
                    "machine idle"
                };
                effects.push(Effect::Notify(Signal::Info, message.to_string()));
            }
            MachineStatus::Busy => {
                effects.push(Effect::Notify(Signal::Info, "machine busy".to_string()));
            }
            MachineStatus::Locked => {
                effects.push(Effect::ClearToSend(true));
                effects.push(Effect::Notify(
                    Signal::Error,
                    "machine locked; unlock or home required".to_string(),
                ));
            }
            MachineStatus::New => {
                effects.push(Effect::ClearToSend(false));
                effects.push(Effect::Notify(Signal::Info, "machine connecting".to_string()));
            }
            MachineStatus::Disconnected => {
                effects.push(Effect::ClearToSend(true));
                effects.push(Effect::Notify(Signal::Info, "machine disconnected".to_string()));
            }
        }
    }
}

fn query_lines(ids: &[u32]) -> Vec<String> {
    ids.iter()
        .map(|id| protocol::command_line(*id, protocol::STATUS_QUERY))
        .collect()
}

fn target_reached(response: &SerialResponse, target: &Position) -> bool {
    response.idle && response.position.map_or(true, |p| p.approx_eq(target))
}

fn readiness(device: &Device) -> MachineStatus {
    if device.last_response.as_ref().is_some_and(|r| r.locked) {
        MachineStatus::Locked
    } else if device.target.is_some() {
        MachineStatus::Busy
    } else {
        MachineStatus::Idle
    }
}
