//! Pose-to-Action compilation.
//!
//! A run is compiled in two stages. [`compile`] flattens poses into the linear
//! [`Action`] stream, rejecting the whole run if any action addresses a device
//! outside the active set. [`route`] then turns that stream into the
//! [`Outbound`] items the pipeline consumes: wire lines bound to a port, or
//! capture triggers for remote-capture devices.

use crate::error::{AppResult, RigError};
use crate::model::{Action, ActionKind, Device, Pose};
use crate::pipeline::Outbound;
use crate::protocol;
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, instrument};

/// Flatten `poses` into one action stream: each pose's move, then its payload.
///
/// Fails fast with [`RigError::DeviceReference`] before anything is emitted.
pub fn compile(poses: &[Pose], devices: &[Device]) -> AppResult<Vec<Action>> {
    let known: Vec<u32> = devices.iter().map(|d| d.device_id).collect();
    if let Some(stray) = poses
        .iter()
        .flat_map(Pose::actions)
        .find(|a| !known.contains(&a.device_id()))
    {
        return Err(RigError::DeviceReference {
            device_id: stray.device_id(),
        });
    }
    Ok(poses
        .iter()
        .flat_map(Pose::actions)
        .cloned()
        .collect())
}

/// Bind compiled actions to their transports.
pub fn route(actions: &[Action], devices: &[Device]) -> AppResult<Vec<Outbound>> {
    let ports: BTreeMap<u32, Option<&str>> = devices
        .iter()
        .map(|d| (d.device_id, d.port.as_deref()))
        .collect();

    actions
        .iter()
        .map(|action| {
            let device_id = action.device_id();
            if action.kind() == ActionKind::RemoteSnap {
                return Ok(Outbound::Capture {
                    device_id,
                    auto_focus: action.auto_focus(),
                });
            }
            let port = ports
                .get(&device_id)
                .ok_or(RigError::DeviceReference { device_id })?
                .ok_or_else(|| {
                    RigError::Configuration(format!(
                        "device {device_id} receives '{}' but has no serial port",
                        action.kind()
                    ))
                })?;
            let line = protocol::format_action(action).ok_or_else(|| {
                RigError::Configuration(format!("'{}' has no wire form", action.kind()))
            })?;
            Ok(Outbound::Serial {
                port: port.to_string(),
                line,
                action: Some(action.clone()),
            })
        })
        .collect()
}

/// Compile and route in one step.
pub fn build_run(poses: &[Pose], devices: &[Device]) -> AppResult<Vec<Outbound>> {
    let actions = compile(poses, devices)?;
    route(&actions, devices)
}

/// Export lines for a compiled run: wire syntax for serial actions, a bare
/// type tag for camera-only ones.
pub fn export_lines(actions: &[Action]) -> Vec<String> {
    actions.iter().map(protocol::export_line).collect()
}

/// Write one line per action to `path`.
#[instrument(skip(actions), fields(count = actions.len()))]
pub fn export(actions: &[Action], path: &Path) -> AppResult<()> {
    let mut writer = BufWriter::new(fs::File::create(path)?);
    for line in export_lines(actions) {
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;
    debug!(path = %path.display(), "Run exported");
    Ok(())
}

/// Read a JSON array of poses.
pub fn load_poses(path: &Path) -> AppResult<Vec<Pose>> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}
