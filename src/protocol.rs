//! Line-oriented ASCII wire protocol.
//!
//! Outbound, one command per line:
//! - device prefix `>{id}`, omitted for device 0
//! - `G90` / `G91` motion mode
//! - `G0` / `G1` followed by `X`,`Y`,`Z`,`P`,`T` values at 3-decimal precision
//! - `C0` shutter / `C1` autofocus, optional `S{seconds}`
//! - `?` status query, `$X` unlock, `$H` home
//!
//! Inbound, one reply per line, with the same optional prefix:
//! - `<State|X..Y..Z..P..T..>` status report (`Idle`, `Run`, `Home`, `Jog`, `Hold`, `Alarm`, `Door`)
//! - `ok`, `error:{n}`, `ALARM:{n}`
//! - anything else is passed through as raw text

use crate::model::{Action, Position, SerialResponse};
use regex::Regex;
use std::sync::LazyLock;
use std::time::Instant;

/// Real-time status query.
pub const STATUS_QUERY: &str = "?";
/// Clears an alarm lock.
pub const UNLOCK: &str = "$X";
/// Homing cycle.
pub const HOME: &str = "$H";
/// Absolute motion mode.
pub const ABSOLUTE_MODE: &str = "G90";

static LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:>(?P<id>\d+)\s*)?(?P<body>.*)$").expect("Invalid line regex")
});

static STATUS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^<(?P<state>[A-Za-z]+)(?::\d+)?(?:\|(?P<fields>[^>]*))?>$")
        .expect("Invalid status regex")
});

static AXIS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<axis>[XYZPT])(?P<value>-?\d+(?:\.\d+)?)").expect("Invalid axis regex")
});

/// `>{id}` for every device except device 0.
pub fn device_prefix(device_id: u32) -> String {
    if device_id == 0 {
        String::new()
    } else {
        format!(">{device_id}")
    }
}

/// A bare command addressed to one device, e.g. `>2?`.
pub fn command_line(device_id: u32, code: &str) -> String {
    format!("{}{}", device_prefix(device_id), code)
}

/// Wire line for a serial action; `None` for camera-only actions.
pub fn format_action(action: &Action) -> Option<String> {
    let code = action.kind().code()?;
    let mut line = command_line(action.device_id(), code);
    for (key, value) in action.args() {
        line.push(*key);
        line.push_str(value);
    }
    Some(line)
}

/// Line written by the run export.
///
/// Camera-only actions serialize only their type tag; their arguments are not
/// part of the export schema.
pub fn export_line(action: &Action) -> String {
    format_action(action).unwrap_or_else(|| action.kind().tag().to_string())
}

/// A classified inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Status report, error or alarm
    Response(SerialResponse),
    /// Command acknowledgement
    Ack {
        /// Answering device, 0 when unprefixed
        device_id: u32,
    },
    /// Anything the protocol does not recognise
    Other {
        /// Addressed device, 0 when unprefixed
        device_id: u32,
        /// Line body after the prefix
        text: String,
    },
}

/// Split a line into its addressed device (0 when unprefixed) and body.
pub fn split_device_prefix(line: &str) -> (u32, &str) {
    let Some(caps) = LINE_RE.captures(line) else {
        return (0, line);
    };
    let device_id = caps
        .name("id")
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .unwrap_or(0);
    let body = caps.name("body").map(|m| m.as_str().trim()).unwrap_or("");
    (device_id, body)
}

/// Every `{axis}{value}` pair in `text`, in order of appearance.
pub fn parse_axis_values(text: &str) -> Vec<(char, f64)> {
    AXIS_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let axis = caps.name("axis")?.as_str().chars().next()?;
            let value = caps.name("value")?.as_str().parse::<f64>().ok()?;
            Some((axis, value))
        })
        .collect()
}

/// Classify one inbound line. Returns `None` for blank lines.
pub fn parse_line(line: &str, now: Instant) -> Option<Reply> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (device_id, body) = split_device_prefix(line);

    if body.eq_ignore_ascii_case("ok") {
        return Some(Reply::Ack { device_id });
    }

    let mut response = SerialResponse {
        device_id,
        idle: false,
        error: false,
        locked: false,
        position: None,
        state: None,
        reported_at: now,
    };

    if let Some(status) = STATUS_RE.captures(body) {
        let state = status.name("state").map(|m| m.as_str()).unwrap_or("");
        response.idle = state.eq_ignore_ascii_case("idle");
        response.locked = state.eq_ignore_ascii_case("alarm");
        response.state = Some(state.to_string());
        response.position = status
            .name("fields")
            .and_then(|fields| parse_position(fields.as_str()));
        return Some(Reply::Response(response));
    }

    if body.starts_with("error:") {
        response.error = true;
        return Some(Reply::Response(response));
    }

    if body.starts_with("ALARM:") {
        response.locked = true;
        return Some(Reply::Response(response));
    }

    Some(Reply::Other {
        device_id,
        text: body.to_string(),
    })
}

/// Parse `X..Y..Z..P..T..` (any separators); all five axes must be present.
fn parse_position(fields: &str) -> Option<Position> {
    let mut position = Position::ORIGIN;
    let mut seen = 0u8;
    for (axis, value) in parse_axis_values(fields) {
        if let Some(slot) = position.axis_mut(axis) {
            *slot = value;
            seen += 1;
        }
    }
    (seen >= 5).then_some(position)
}

/// Format a status report the way a controller would send it.
pub fn format_status(device_id: u32, state: &str, position: &Position) -> String {
    format!(
        "{}<{}|X{:.3}Y{:.3}Z{:.3}P{:.3}T{:.3}>",
        device_prefix(device_id),
        state,
        position.x,
        position.y,
        position.z,
        position.p,
        position.t
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_zero_has_no_prefix() {
        let action = Action::move_to(0, Position::new(10.0, 0.0, 0.0, 0.0, 0.0), false);
        assert_eq!(
            format_action(&action).unwrap(),
            "G1X10.000Y0.000Z0.000P0.000T0.000"
        );
    }

    #[test]
    fn test_addressed_payload_lines() {
        assert_eq!(
            format_action(&Action::shutter(1, Some(1.5))).unwrap(),
            ">1C0S1.500"
        );
        assert_eq!(format_action(&Action::autofocus(2, None)).unwrap(), ">2C1");
        assert_eq!(format_action(&Action::mode(3, true)).unwrap(), ">3G90");
        assert_eq!(format_action(&Action::mode(0, false)).unwrap(), "G91");
        assert_eq!(command_line(4, STATUS_QUERY), ">4?");
    }

    #[test]
    fn test_remote_snap_exports_bare_tag() {
        let snap = Action::remote_snap(5, true);
        assert!(format_action(&snap).is_none());
        assert_eq!(export_line(&snap), "remote_snap");
    }

    #[test]
    fn test_parse_status_report() {
        let now = Instant::now();
        let reply = parse_line(">2<Idle|X1.000Y2.000Z3.000P-4.500T0.000>\r", now).unwrap();
        let Reply::Response(response) = reply else {
            panic!("expected a response");
        };
        assert_eq!(response.device_id, 2);
        assert!(response.idle);
        assert!(!response.locked);
        assert_eq!(
            response.position,
            Some(Position::new(1.0, 2.0, 3.0, -4.5, 0.0))
        );
        assert_eq!(response.state.as_deref(), Some("Idle"));
    }

    #[test]
    fn test_parse_error_alarm_and_ack() {
        let now = Instant::now();
        match parse_line("error:9", now) {
            Some(Reply::Response(r)) => assert!(r.error && !r.idle && r.device_id == 0),
            other => panic!("unexpected: {:?}", other),
        }
        match parse_line(">1ALARM:2", now) {
            Some(Reply::Response(r)) => assert!(r.locked && r.device_id == 1),
            other => panic!("unexpected: {:?}", other),
        }
        match parse_line(">1<Alarm|X0Y0Z0P0T0>", now) {
            Some(Reply::Response(r)) => assert!(r.locked && r.position.is_some()),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(parse_line(">3ok", now), Some(Reply::Ack { device_id: 3 }));
        assert!(parse_line("   ", now).is_none());
        assert!(matches!(
            parse_line("[MSG:boot]", now),
            Some(Reply::Other { device_id: 0, .. })
        ));
    }

    #[test]
    fn test_split_prefix() {
        assert_eq!(split_device_prefix(">12G90"), (12, "G90"));
        assert_eq!(split_device_prefix("$H"), (0, "$H"));
        assert_eq!(
            parse_axis_values("G1X1.5T-2"),
            vec![('X', 1.5), ('T', -2.0)]
        );
    }

    #[test]
    fn test_status_round_trip_through_formatter() {
        let position = Position::new(0.5, 0.0, 12.25, 90.0, -15.0);
        let line = format_status(1, "Run", &position);
        match parse_line(&line, Instant::now()) {
            Some(Reply::Response(r)) => {
                assert!(!r.idle);
                assert!(r.position.unwrap().approx_eq(&position));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
