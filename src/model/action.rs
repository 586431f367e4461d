//! Wire-level instructions.

use super::device::{Position, AXES};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Type tag of an [`Action`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// `G0` rapid move
    RapidMove,
    /// `G1` linear move
    LinearMove,
    /// `C0` shutter release
    Shutter,
    /// `C1` autofocus
    Autofocus,
    /// Capture through the vendor SDK; never written to the serial link
    RemoteSnap,
    /// `G90`
    AbsoluteMode,
    /// `G91`
    RelativeMode,
    /// `$H`
    Home,
}

impl ActionKind {
    /// Wire code, `None` for camera-only actions.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            ActionKind::RapidMove => Some("G0"),
            ActionKind::LinearMove => Some("G1"),
            ActionKind::Shutter => Some("C0"),
            ActionKind::Autofocus => Some("C1"),
            ActionKind::RemoteSnap => None,
            ActionKind::AbsoluteMode => Some("G90"),
            ActionKind::RelativeMode => Some("G91"),
            ActionKind::Home => Some("$H"),
        }
    }

    /// Bare type tag, as written by the run export for camera-only actions.
    pub fn tag(&self) -> &'static str {
        match self {
            ActionKind::RapidMove => "rapid_move",
            ActionKind::LinearMove => "linear_move",
            ActionKind::Shutter => "shutter",
            ActionKind::Autofocus => "autofocus",
            ActionKind::RemoteSnap => "remote_snap",
            ActionKind::AbsoluteMode => "absolute_mode",
            ActionKind::RelativeMode => "relative_mode",
            ActionKind::Home => "home",
        }
    }

    /// `G0` or `G1`.
    pub fn is_move(&self) -> bool {
        matches!(self, ActionKind::RapidMove | ActionKind::LinearMove)
    }

    /// Actions that leave a positioner busy until it reports idle again.
    pub fn is_motion(&self) -> bool {
        self.is_move() || matches!(self, ActionKind::Home)
    }

    /// True when the action has a wire form.
    pub fn is_serial(&self) -> bool {
        self.code().is_some()
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// One wire-level instruction. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    kind: ActionKind,
    device_id: u32,
    /// Single-letter keys with pre-formatted numeric values, in wire order
    args: Vec<(char, String)>,
}

fn format_value(value: f64) -> String {
    format!("{value:.3}")
}

impl Action {
    /// Action from raw parts; `args` must already be formatted.
    pub fn new(kind: ActionKind, device_id: u32, args: Vec<(char, String)>) -> Self {
        Self {
            kind,
            device_id,
            args,
        }
    }

    /// `G1` (or `G0` when `rapid`) to every axis of `target`.
    pub fn move_to(device_id: u32, target: Position, rapid: bool) -> Self {
        let kind = if rapid {
            ActionKind::RapidMove
        } else {
            ActionKind::LinearMove
        };
        let args = AXES
            .iter()
            .filter_map(|&axis| target.axis(axis).map(|v| (axis, format_value(v))))
            .collect();
        Self::new(kind, device_id, args)
    }

    /// Shutter release, optionally held for `seconds`.
    pub fn shutter(device_id: u32, seconds: Option<f64>) -> Self {
        let args = seconds.map(|s| vec![('S', format_value(s))]).unwrap_or_default();
        Self::new(ActionKind::Shutter, device_id, args)
    }

    /// Autofocus, optionally held for `seconds`.
    pub fn autofocus(device_id: u32, seconds: Option<f64>) -> Self {
        let args = seconds.map(|s| vec![('S', format_value(s))]).unwrap_or_default();
        Self::new(ActionKind::Autofocus, device_id, args)
    }

    /// Capture through the vendor SDK.
    pub fn remote_snap(device_id: u32, auto_focus: bool) -> Self {
        let flag = if auto_focus { "1" } else { "0" };
        Self::new(ActionKind::RemoteSnap, device_id, vec![('F', flag.to_string())])
    }

    /// `G90` when `absolute`, `G91` otherwise.
    pub fn mode(device_id: u32, absolute: bool) -> Self {
        let kind = if absolute {
            ActionKind::AbsoluteMode
        } else {
            ActionKind::RelativeMode
        };
        Self::new(kind, device_id, Vec::new())
    }

    /// `$H` homing cycle.
    pub fn home(device_id: u32) -> Self {
        Self::new(ActionKind::Home, device_id, Vec::new())
    }

    /// Type tag.
    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    /// Addressed device.
    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    /// Arguments in wire order.
    pub fn args(&self) -> &[(char, String)] {
        &self.args
    }

    /// Value of argument `key`, if present.
    pub fn arg(&self, key: char) -> Option<&str> {
        self.args
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Autofocus flag of a remote snap.
    pub fn auto_focus(&self) -> bool {
        self.arg('F') == Some("1")
    }

    /// Grouping key: actions group together by type and device only.
    pub fn same_group(&self, other: &Action) -> bool {
        self.kind == other.kind && self.device_id == other.device_id
    }

    /// Where a move leaves the device, starting from `current`.
    ///
    /// Returns `None` for non-moves. Axes without an argument keep their value.
    pub fn resolve_target(&self, current: Position, absolute: bool) -> Option<Position> {
        if !self.kind.is_move() {
            return None;
        }
        let mut target = current;
        for (key, value) in &self.args {
            let Ok(value) = value.parse::<f64>() else {
                continue;
            };
            if let Some(axis) = target.axis_mut(*key) {
                if absolute {
                    *axis = value;
                } else {
                    *axis += value;
                }
            }
        }
        Some(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_move_args_in_axis_order() {
        let action = Action::move_to(1, Position::new(10.0, 0.0, 0.0, 0.0, 0.0), false);
        let keys: Vec<char> = action.args().iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec!['X', 'Y', 'Z', 'P', 'T']);
        assert_eq!(action.arg('X'), Some("10.000"));
        assert_eq!(action.kind(), ActionKind::LinearMove);
    }

    #[test]
    fn test_resolve_target_relative_and_absolute() {
        let action = Action::new(
            ActionKind::LinearMove,
            0,
            vec![('X', "5.000".into()), ('T', "-2.500".into())],
        );
        let start = Position::new(1.0, 2.0, 3.0, 4.0, 5.0);

        let abs = action.resolve_target(start, true).unwrap();
        assert_eq!(abs, Position::new(5.0, 2.0, 3.0, 4.0, -2.5));

        let rel = action.resolve_target(start, false).unwrap();
        assert_eq!(rel, Position::new(6.0, 2.0, 3.0, 4.0, 2.5));

        assert!(Action::shutter(0, None).resolve_target(start, true).is_none());
    }

    #[test]
    fn test_grouping_ignores_args() {
        let a = Action::shutter(2, Some(1.0));
        let b = Action::shutter(2, None);
        let c = Action::shutter(3, None);
        assert!(a.same_group(&b));
        assert!(!a.same_group(&c));
        assert_ne!(a, b);
    }

    #[test]
    fn test_remote_snap_is_not_serial() {
        let snap = Action::remote_snap(4, true);
        assert!(!snap.kind().is_serial());
        assert!(snap.auto_focus());
    }
}
