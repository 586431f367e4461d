//! Remote-capture devices of the rig.
//!
//! [`CameraBank`] owns one [`CaptureSession`] per remote-capture device and is
//! what the sender fires snaps through. It also runs the worker that pumps
//! vendor events, since the library only calls handlers from its event loop.

use super::controller::CaptureController;
use super::session::{CaptureSession, CompletionHook};
use crate::config::CaptureConfig;
use crate::error::{AppResult, RigError};
use crate::model::{Device, DeviceKind};
use crate::notify::{SharedNotifier, Signal};
use crate::pipeline::CaptureTrigger;
use crate::worker::{StopOutcome, Worker};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Sessions for every remote-capture device plus the event pump.
pub struct CameraBank {
    controller: Arc<CaptureController>,
    notifier: SharedNotifier,
    config: CaptureConfig,
    sessions: RwLock<BTreeMap<u32, Arc<CaptureSession>>>,
    pump: Mutex<Option<Worker>>,
}

impl CameraBank {
    /// Empty bank over `controller`. Register devices before starting it.
    pub fn new(
        controller: Arc<CaptureController>,
        notifier: SharedNotifier,
        config: CaptureConfig,
    ) -> Self {
        Self {
            controller,
            notifier,
            config,
            sessions: RwLock::new(BTreeMap::new()),
            pump: Mutex::new(None),
        }
    }

    /// Owner of the SDK lifetime.
    pub fn controller(&self) -> &Arc<CaptureController> {
        &self.controller
    }

    /// Create sessions for the remote-capture devices in `devices`.
    ///
    /// A device is matched to a camera by hardware id, falling back to its name.
    pub fn register(&self, devices: &[Device]) {
        let mut sessions = self.sessions.write();
        for device in devices
            .iter()
            .filter(|d| d.kind == DeviceKind::RemoteCapture)
        {
            let hardware_id = device
                .hardware_id
                .clone()
                .unwrap_or_else(|| device.name.clone());
            let session = CaptureSession::new(
                device.device_id,
                hardware_id,
                self.controller.sdk(),
                Arc::clone(&self.notifier),
                &self.config,
            );
            sessions.insert(device.device_id, session);
        }
    }

    /// Session for `device_id`, if registered.
    pub fn session(&self, device_id: u32) -> Option<Arc<CaptureSession>> {
        self.sessions.read().get(&device_id).cloned()
    }

    /// Registered remote-capture devices, in id order.
    pub fn device_ids(&self) -> Vec<u32> {
        self.sessions.read().keys().copied().collect()
    }

    /// Run `hook` whenever a session finishes a capture.
    pub fn set_completion_hook(&self, hook: impl Fn(u32) + Send + Sync + 'static) {
        let hook: CompletionHook = Arc::new(hook);
        for session in self.sessions.read().values() {
            session.set_completion_hook(Arc::clone(&hook));
        }
    }

    /// Initialize the library and start delivering its events.
    pub fn start(&self) -> AppResult<()> {
        self.controller.initialize()?;
        let mut pump = self.pump.lock();
        if pump.as_ref().is_some_and(|w| !w.is_finished()) {
            return Ok(());
        }
        let controller = Arc::clone(&self.controller);
        let notifier = Arc::clone(&self.notifier);
        let interval = Duration::from_millis(self.config.event_pump_interval_ms);
        *pump = Some(Worker::spawn("rig-capture-events", move |stop| {
            while !stop.is_set() {
                if let Err(e) = controller.pump_events() {
                    notifier.log(Signal::Error, &format!("Capture event pump: {e}"));
                }
                stop.sleep(interval);
            }
        })?);
        Ok(())
    }

    /// True while the event pump worker runs.
    pub fn is_pumping(&self) -> bool {
        self.pump.lock().as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Close every session, stop the pump and terminate the library.
    pub fn shutdown(&self) -> AppResult<()> {
        let mut errors = Vec::new();
        for session in self.sessions.read().values() {
            if let Err(e) = session.disconnect(true) {
                errors.push(e);
            }
        }
        let worker = self.pump.lock().take();
        if let Some(worker) = worker {
            let outcome: StopOutcome = worker.stop();
            self.notifier
                .log(Signal::Debug, &format!("Capture event pump stopped: {outcome:?}"));
        }
        if let Err(e) = self.controller.dispose() {
            errors.push(e);
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(RigError::ShutdownFailed(errors))
        }
    }
}

impl CaptureTrigger for CameraBank {
    fn snap(&self, device_id: u32, auto_focus: bool) -> AppResult<()> {
        let session = self
            .session(device_id)
            .ok_or_else(|| RigError::CameraNotFound(device_id.to_string()))?;
        if !session.is_connected() {
            let camera = self.controller.find_camera(session.hardware_id())?;
            session.connect(camera)?;
        }
        session.take_picture(auto_focus)
    }

    fn is_busy(&self) -> bool {
        self.sessions.read().values().any(|s| s.is_writing())
    }

    fn is_writing(&self, device_id: u32) -> bool {
        self.session(device_id).is_some_and(|s| s.is_writing())
    }
}

impl Drop for CameraBank {
    fn drop(&mut self) {
        if let Some(worker) = self.pump.get_mut().take() {
            worker.stop();
        }
    }
}
