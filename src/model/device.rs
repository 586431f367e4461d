//! Device records and parsed device replies.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Tolerance used when comparing reported positions against dispatched targets.
pub const POSITION_TOLERANCE: f64 = 1e-3;

/// Kind of device attached to the rig.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Motorized pan/tilt/XYZ positioner on a serial link
    Positioner,
    /// Wired shutter release driven through a serial controller
    RemoteShutter,
    /// Camera driven through the vendor capture SDK
    RemoteCapture,
}

impl DeviceKind {
    /// True for devices reached over a serial link.
    pub fn is_serial(&self) -> bool {
        !matches!(self, DeviceKind::RemoteCapture)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Positioner => write!(f, "positioner"),
            DeviceKind::RemoteShutter => write!(f, "remote shutter"),
            DeviceKind::RemoteCapture => write!(f, "remote capture"),
        }
    }
}

/// Five degrees of freedom: linear x/y/z plus pan and tilt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Linear x
    pub x: f64,
    /// Linear y
    pub y: f64,
    /// Linear z
    pub z: f64,
    /// Pan
    pub p: f64,
    /// Tilt
    pub t: f64,
}

impl Position {
    /// Origin of every axis.
    pub const ORIGIN: Position = Position {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        p: 0.0,
        t: 0.0,
    };

    /// Create a position from its five axis values.
    pub fn new(x: f64, y: f64, z: f64, p: f64, t: f64) -> Self {
        Self { x, y, z, p, t }
    }

    /// Axis value by wire letter.
    pub fn axis(&self, axis: char) -> Option<f64> {
        match axis {
            'X' => Some(self.x),
            'Y' => Some(self.y),
            'Z' => Some(self.z),
            'P' => Some(self.p),
            'T' => Some(self.t),
            _ => None,
        }
    }

    /// Mutable axis value by wire letter.
    pub fn axis_mut(&mut self, axis: char) -> Option<&mut f64> {
        match axis {
            'X' => Some(&mut self.x),
            'Y' => Some(&mut self.y),
            'Z' => Some(&mut self.z),
            'P' => Some(&mut self.p),
            'T' => Some(&mut self.t),
            _ => None,
        }
    }

    /// Equality within [`POSITION_TOLERANCE`] on every axis.
    pub fn approx_eq(&self, other: &Position) -> bool {
        AXES.iter().all(|&axis| {
            match (self.axis(axis), other.axis(axis)) {
                (Some(a), Some(b)) => (a - b).abs() <= POSITION_TOLERANCE,
                _ => false,
            }
        })
    }
}

/// Axis letters in wire order.
pub const AXES: [char; 5] = ['X', 'Y', 'Z', 'P', 'T'];

/// Parsed reply from a device. Superseded, never merged, by the next reply for the same device.
#[derive(Debug, Clone, PartialEq)]
pub struct SerialResponse {
    /// Owning device
    pub device_id: u32,
    /// Device reports it is not executing anything
    pub idle: bool,
    /// Device answered a command with an error
    pub error: bool,
    /// Device is alarm-locked and needs an unlock
    pub locked: bool,
    /// Reported position, present in status reports only
    pub position: Option<Position>,
    /// Raw state word of a status report (`Idle`, `Run`, ...)
    pub state: Option<String>,
    /// Monotonic time the line was read
    pub reported_at: Instant,
}

impl SerialResponse {
    /// True when this reply carries a status report.
    pub fn is_status_report(&self) -> bool {
        self.state.is_some()
    }
}

/// A device attached to the rig.
///
/// Status fields are written by the listener, motion fields by the sender and run
/// controllers, always under the machine lock.
#[derive(Debug, Clone)]
pub struct Device {
    /// Address used in the wire prefix
    pub device_id: u32,
    /// Display name
    pub name: String,
    /// How the device is reached
    pub kind: DeviceKind,
    /// Serial port name or hardware path
    pub port: Option<String>,
    /// Camera body serial, matched against the SDK camera list
    pub hardware_id: Option<String>,
    /// Identifier assigned by the host software
    pub software_id: Option<String>,
    /// Last reported position, authoritative only once `reported_since_connect` is set
    pub position: Position,
    /// Target of the most recently dispatched move
    pub target: Option<Position>,
    /// Homed since it was last connected
    pub is_homed: bool,
    /// `G90` is in effect
    pub is_move_absolute: bool,
    /// A capture is in flight
    pub is_writing: bool,
    /// Most recent parsed reply
    pub last_response: Option<SerialResponse>,
    /// At least one status report arrived since the port was connected
    pub reported_since_connect: bool,
}

impl Device {
    /// Create a device with no connection state.
    pub fn new(device_id: u32, name: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            device_id,
            name: name.into(),
            kind,
            port: None,
            hardware_id: None,
            software_id: None,
            position: Position::ORIGIN,
            target: None,
            is_homed: false,
            is_move_absolute: false,
            is_writing: false,
            last_response: None,
            reported_since_connect: false,
        }
    }

    /// Builder-style port assignment.
    pub fn on_port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }

    /// Position is unknown until a report has been received post-connect.
    pub fn is_stale(&self) -> bool {
        !self.reported_since_connect
    }

    /// Clears every field that only holds while a port is connected.
    pub fn reset_connection_state(&mut self) {
        self.target = None;
        self.last_response = None;
        self.reported_since_connect = false;
        self.is_move_absolute = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_tolerance() {
        let a = Position::new(10.0, 0.0, 0.0, 0.0, 0.0);
        let b = Position::new(10.0004, 0.0, 0.0, 0.0, 0.0);
        let c = Position::new(10.01, 0.0, 0.0, 0.0, 0.0);
        assert!(a.approx_eq(&b));
        assert!(!a.approx_eq(&c));
    }

    #[test]
    fn test_new_device_is_stale() {
        let device = Device::new(1, "pan", DeviceKind::Positioner).on_port("COM3");
        assert!(device.is_stale());
        assert_eq!(device.port.as_deref(), Some("COM3"));
    }
}
