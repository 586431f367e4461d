//! Shared fixtures for integration tests.
#![allow(dead_code)]

use rig_control::adapters::MockTransportFactory;
use rig_control::capture::sdk::CaptureSdk;
use rig_control::capture::MockCaptureSdk;
use rig_control::config::{DeviceDefinition, RigConfig};
use rig_control::model::DeviceKind;
use rig_control::notify::LogBuffer;
use rig_control::Orchestrator;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Large fine JPEG: one file per shutter release.
pub const JPEG_ONLY: u32 = 0x0013_FF0F;
/// RAW + large fine JPEG: two files per shutter release.
pub const RAW_JPEG: u32 = 0x0064_1300;

pub const PORT: &str = "COM1";

pub fn device(device_id: u32, name: &str, kind: DeviceKind) -> DeviceDefinition {
    DeviceDefinition {
        device_id,
        name: name.to_string(),
        kind,
        port: kind.is_serial().then(|| PORT.to_string()),
        hardware_id: (kind == DeviceKind::RemoteCapture).then(|| format!("CAM-{device_id}")),
        software_id: None,
    }
}

/// Two positioners and a shutter box on one port plus camera 5, with fast pacing.
pub fn rig_config(save_dir: &Path) -> RigConfig {
    let mut config = RigConfig::default();
    config.pipeline.yield_interval_ms = 2;
    config.pipeline.queue_wait_ms = 5;
    config.pipeline.stale_after_ms = 100;
    config.capture.save_dir = save_dir.to_path_buf();
    config.capture.event_pump_interval_ms = 2;
    config.capture.evf_retry_interval_ms = 1;
    config.devices = vec![
        device(1, "arm", DeviceKind::Positioner),
        device(2, "turntable", DeviceKind::Positioner),
        device(3, "shutter", DeviceKind::RemoteShutter),
        device(5, "body", DeviceKind::RemoteCapture),
    ];
    config
}

pub struct SimulatedRig {
    pub rig: Orchestrator,
    pub log: LogBuffer,
    pub factory: Arc<MockTransportFactory>,
    pub sdk: Arc<MockCaptureSdk>,
}

/// Orchestrator over a simulated serial rig and one simulated camera.
pub fn simulated_rig(config: &RigConfig, quality: u32) -> SimulatedRig {
    let log = LogBuffer::new();
    let factory = Arc::new(MockTransportFactory::simulated_locked());
    let sdk = Arc::new(MockCaptureSdk::new());
    sdk.add_camera("CAM-5", quality);
    let capture: Arc<dyn CaptureSdk> = sdk.clone();
    let rig = Orchestrator::new(config, Arc::new(log.clone()), factory.clone(), Some(capture));
    SimulatedRig {
        rig,
        log,
        factory,
        sdk,
    }
}

pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
