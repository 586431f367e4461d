//! One camera's remote-capture session.
//!
//! A session is connected on demand, fires one shutter release, and closes
//! itself once the expected number of files has been downloaded. Completion
//! is driven by vendor events, never by the return value of
//! [`CaptureSession::take_picture`].

use super::sdk::{
    codes, files_per_capture, props, CameraCommand, CameraEvent, CameraRef, CaptureSdk, DirItem,
    EventHandler, ObjectEvent, PropertyEvent, ShutterButton, StateEvent,
};
use crate::config::CaptureConfig;
use crate::error::{AppResult, RigError};
use crate::notify::{SharedNotifier, Signal};
use crate::worker::StopFlag;
use parking_lot::{Mutex, RwLock};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Called with the device id once a capture burst has been fully downloaded.
pub type CompletionHook = Arc<dyn Fn(u32) + Send + Sync>;

#[derive(Debug, Default)]
struct SessionState {
    camera: Option<CameraRef>,
    save_dir: PathBuf,
    file_stem: Option<String>,
    /// Files downloaded for the capture in flight
    counter: u32,
    /// Files one shutter release produces; zero until first inspected
    expected: u32,
    is_writing: bool,
    live_view: bool,
    downloaded: Vec<PathBuf>,
}

/// Remote-capture session bound to one rig device.
pub struct CaptureSession {
    device_id: u32,
    hardware_id: String,
    sdk: Arc<dyn CaptureSdk>,
    notifier: SharedNotifier,
    evf_attempts: u32,
    evf_interval: Duration,
    state: Mutex<SessionState>,
    on_complete: RwLock<Option<CompletionHook>>,
    me: Weak<CaptureSession>,
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("device_id", &self.device_id)
            .field("hardware_id", &self.hardware_id)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl CaptureSession {
    /// Session for `device_id`, not yet connected to a camera.
    pub fn new(
        device_id: u32,
        hardware_id: impl Into<String>,
        sdk: Arc<dyn CaptureSdk>,
        notifier: SharedNotifier,
        config: &CaptureConfig,
    ) -> Arc<Self> {
        let hardware_id = hardware_id.into();
        let save_dir = config.save_dir.clone();
        Arc::new_cyclic(|me| Self {
            device_id,
            hardware_id,
            sdk,
            notifier,
            evf_attempts: config.evf_retry_attempts.max(1),
            evf_interval: Duration::from_millis(config.evf_retry_interval_ms),
            state: Mutex::new(SessionState {
                save_dir,
                ..SessionState::default()
            }),
            on_complete: RwLock::new(None),
            me: me.clone(),
        })
    }

    /// Device this session serves.
    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    /// Hardware id matched against the SDK camera list.
    pub fn hardware_id(&self) -> &str {
        &self.hardware_id
    }

    /// True while a camera session is open.
    pub fn is_connected(&self) -> bool {
        self.state.lock().camera.is_some()
    }

    /// True while a shutter release still has files to deliver.
    pub fn is_writing(&self) -> bool {
        self.state.lock().is_writing
    }

    /// `(counter, expected)` for the capture in flight.
    pub fn buffer(&self) -> (u32, u32) {
        let state = self.state.lock();
        (state.counter, state.expected)
    }

    /// Every file written by this session so far.
    pub fn downloaded(&self) -> Vec<PathBuf> {
        self.state.lock().downloaded.clone()
    }

    /// Called on the event pump once a capture has fully downloaded.
    pub fn set_completion_hook(&self, hook: CompletionHook) {
        *self.on_complete.write() = Some(hook);
    }

    /// Directory and optional file stem for downloaded images.
    pub fn set_save_target(&self, dir: impl Into<PathBuf>, stem: Option<String>) {
        let mut state = self.state.lock();
        state.save_dir = dir.into();
        state.file_stem = stem;
    }

    fn notify(&self, signal: Signal, message: &str) {
        self.notifier.log(signal, message);
    }

    /// Open a session on `camera`, route its images to the host and install
    /// the event handler.
    pub fn connect(&self, camera: CameraRef) -> AppResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.sdk
            .open_session(camera)
            .map_err(|e| RigError::sdk("open_session", e))?;

        if let Err(e) = self.configure(camera) {
            if let Err(close) = self.sdk.close_session(camera) {
                self.notify(
                    Signal::Debug,
                    &format!("Closing half-open session for {}: {close}", self.hardware_id),
                );
            }
            return Err(e);
        }

        let mut state = self.state.lock();
        state.camera = Some(camera);
        state.counter = 0;
        state.expected = 0;
        drop(state);
        self.notify(
            Signal::Info,
            &format!("Camera {} connected (device {})", self.hardware_id, self.device_id),
        );
        Ok(())
    }

    fn configure(&self, camera: CameraRef) -> AppResult<()> {
        self.sdk
            .set_property(camera, props::SAVE_TO, props::SAVE_TO_HOST)
            .map_err(|e| RigError::sdk("set_property(SaveTo)", e))?;

        let weak = self.me.clone();
        let handler: EventHandler = Arc::new(move |event| match weak.upgrade() {
            Some(session) => session.handle_event(event),
            None => codes::OK,
        });
        self.sdk
            .set_event_handler(camera, Some(handler))
            .map_err(|e| RigError::sdk("set_event_handler", e))
    }

    fn camera(&self) -> AppResult<CameraRef> {
        self.state.lock().camera.ok_or(RigError::SessionNotOpen)
    }

    /// Release the shutter. Files arrive later through transfer-request events.
    pub fn take_picture(&self, auto_focus: bool) -> AppResult<()> {
        let camera = self.camera()?;

        let needs_quality = self.state.lock().expected == 0;
        if needs_quality {
            let quality = match self.sdk.get_property(camera, props::IMAGE_QUALITY) {
                Ok(quality) => quality,
                Err(e) => {
                    self.notify(
                        Signal::Debug,
                        &format!("Image quality unreadable on {}: {e}", self.hardware_id),
                    );
                    props::QUALITY_UNKNOWN
                }
            };
            self.state.lock().expected = files_per_capture(quality);
        }

        {
            let mut state = self.state.lock();
            state.counter = 0;
            state.is_writing = true;
        }

        let press = if auto_focus {
            ShutterButton::Completely
        } else {
            ShutterButton::CompletelyNonAf
        };
        if let Err(e) = self
            .sdk
            .send_command(camera, CameraCommand::PressShutterButton(press))
        {
            self.state.lock().is_writing = false;
            return Err(RigError::sdk("press_shutter_button", e));
        }
        // The burst may already have completed and closed the session.
        if let Err(e) = self
            .sdk
            .send_command(camera, CameraCommand::PressShutterButton(ShutterButton::Off))
        {
            self.notify(
                Signal::Debug,
                &format!("Releasing shutter on {}: {e}", self.hardware_id),
            );
        }
        Ok(())
    }

    /// Single dispatch point for every vendor callback on this camera.
    pub fn handle_event(&self, event: CameraEvent) -> u32 {
        match event {
            CameraEvent::Object(ObjectEvent::DirItemRequestTransfer(item)) => {
                self.receive_image(&item)
            }
            CameraEvent::Object(ObjectEvent::Other(id)) => {
                self.notify(Signal::Debug, &format!("Object event 0x{id:04X} ignored"));
                codes::OK
            }
            CameraEvent::Property(PropertyEvent::Changed { property, param }) => {
                self.notify(
                    Signal::Debug,
                    &format!("Property 0x{property:X} changed (param {param})"),
                );
                codes::OK
            }
            CameraEvent::Property(PropertyEvent::Other(id)) => {
                self.notify(Signal::Debug, &format!("Property event 0x{id:04X} ignored"));
                codes::OK
            }
            CameraEvent::State(StateEvent::WillSoonShutDown) => self.keep_alive(),
            CameraEvent::State(StateEvent::Shutdown) => {
                if self.is_connected() {
                    self.notify(
                        Signal::Info,
                        &format!("Camera {} shut down", self.hardware_id),
                    );
                    if let Err(e) = self.disconnect(false) {
                        self.notify(Signal::Debug, &format!("Teardown after shutdown: {e}"));
                    }
                }
                codes::OK
            }
            CameraEvent::State(StateEvent::Other(id)) => {
                self.notify(Signal::Debug, &format!("State event 0x{id:04X} ignored"));
                codes::OK
            }
        }
    }

    fn keep_alive(&self) -> u32 {
        let Some(camera) = self.state.lock().camera else {
            return codes::OK;
        };
        match self.sdk.send_command(camera, CameraCommand::ExtendShutDownTimer) {
            Ok(()) => {
                self.notify(
                    Signal::Debug,
                    &format!("Extended shutdown timer on {}", self.hardware_id),
                );
                codes::OK
            }
            Err(e) => {
                self.notify(
                    Signal::Error,
                    &format!("Keep-alive for {} failed: {e}", self.hardware_id),
                );
                e.code()
            }
        }
    }

    fn target_path(&self, item: &DirItem) -> PathBuf {
        let state = self.state.lock();
        let name = match (&state.file_stem, Path::new(&item.file_name).extension()) {
            (Some(stem), Some(ext)) => format!("{stem}.{}", ext.to_string_lossy()),
            (Some(stem), None) => stem.clone(),
            (None, _) => item.file_name.clone(),
        };
        state.save_dir.join(name)
    }

    fn receive_image(&self, item: &DirItem) -> u32 {
        let Some(camera) = self.state.lock().camera else {
            self.notify(
                Signal::Error,
                &format!("Transfer of {} requested with no open session", item.file_name),
            );
            return codes::SESSION_NOT_OPEN;
        };

        let path = self.target_path(item);
        if let Err(e) = self.fetch(camera, item, &path) {
            self.notify(
                Signal::Error,
                &format!("Download of {} failed: {e}; abandoning capture", item.file_name),
            );
            self.finish_burst();
            return match e {
                RigError::Sdk { source, .. } => source.code(),
                _ => codes::INTERNAL_ERROR,
            };
        }

        let done = {
            let mut state = self.state.lock();
            state.downloaded.push(path.clone());
            state.counter = (state.counter + 1).min(state.expected.max(1));
            state.counter >= state.expected
        };
        self.notify(Signal::Info, &format!("Saved {}", path.display()));
        if done {
            self.finish_burst();
        }
        codes::OK
    }

    fn fetch(&self, camera: CameraRef, item: &DirItem, path: &Path) -> AppResult<()> {
        let bytes = self
            .sdk
            .download(camera, item)
            .map_err(|e| RigError::sdk("download", e))?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, bytes)?;
        self.sdk
            .download_complete(camera, item)
            .map_err(|e| RigError::sdk("download_complete", e))
    }

    fn finish_burst(&self) {
        if let Err(e) = self.disconnect(true) {
            self.notify(Signal::Error, &format!("Closing {} failed: {e}", self.hardware_id));
        }
        let hook = self.on_complete.read().clone();
        if let Some(hook) = hook {
            hook(self.device_id);
        }
    }

    /// Download every file in camera storage into `destination`.
    pub fn transfer_pictures(&self, destination: &Path) -> AppResult<Vec<PathBuf>> {
        let camera = self.camera()?;
        let items = self
            .sdk
            .list_storage(camera)
            .map_err(|e| RigError::sdk("list_storage", e))?;
        fs::create_dir_all(destination)?;

        let mut written = Vec::new();
        for item in items.iter().filter(|item| !item.is_folder) {
            let path = destination.join(&item.file_name);
            self.fetch(camera, item, &path)?;
            written.push(path);
        }
        self.notify(
            Signal::Info,
            &format!(
                "Transferred {} file(s) from {} to {}",
                written.len(),
                self.hardware_id,
                destination.display()
            ),
        );
        Ok(written)
    }

    /// Tear the session down. `close_session` is false when the camera has
    /// already gone away and only local state should be released.
    pub fn disconnect(&self, close_session: bool) -> AppResult<()> {
        let result = self.release_camera(close_session);
        self.state.lock().is_writing = false;
        result
    }

    /// Busy stays set until the session is released, so a new capture cannot
    /// open the camera while the old session is still closing.
    fn release_camera(&self, close_session: bool) -> AppResult<()> {
        let camera = {
            let mut state = self.state.lock();
            let camera = state.camera.take();
            state.counter = 0;
            state.expected = 0;
            state.live_view = false;
            camera
        };
        let Some(camera) = camera else {
            return Ok(());
        };

        if let Err(e) = self.sdk.set_event_handler(camera, None) {
            self.notify(
                Signal::Debug,
                &format!("Removing event handler for {}: {e}", self.hardware_id),
            );
        }
        if close_session {
            self.sdk
                .close_session(camera)
                .map_err(|e| RigError::sdk("close_session", e))?;
        }
        self.notify(
            Signal::Info,
            &format!("Camera {} disconnected", self.hardware_id),
        );
        Ok(())
    }

    /// True while live view streams to the host.
    pub fn is_live_view(&self) -> bool {
        self.state.lock().live_view
    }

    /// Route live view to the host.
    pub fn start_live_view(&self) -> AppResult<()> {
        let camera = self.camera()?;
        self.sdk
            .set_property(camera, props::EVF_OUTPUT_DEVICE, props::EVF_OUTPUT_PC)
            .map_err(|e| RigError::sdk("set_property(Evf_OutputDevice)", e))?;
        self.state.lock().live_view = true;
        Ok(())
    }

    /// Fetch one live-view frame.
    ///
    /// `OBJECT_NOTREADY` is retried on the configured interval. A
    /// communications loss ends the session and yields `Ok(None)`, as does a
    /// frame that never becomes ready.
    pub fn live_view_frame(&self) -> AppResult<Option<Vec<u8>>> {
        let camera = self.camera()?;
        for _ in 0..self.evf_attempts {
            match self.sdk.download_evf_image(camera) {
                Ok(frame) => return Ok(Some(frame)),
                Err(e) if e.is_object_not_ready() => std::thread::sleep(self.evf_interval),
                Err(e) if e.is_comm_disconnected() => {
                    self.notify(
                        Signal::Debug,
                        &format!("Live view on {} lost: {e}", self.hardware_id),
                    );
                    self.disconnect(false)?;
                    return Ok(None);
                }
                Err(e) => return Err(RigError::sdk("download_evf_image", e)),
            }
        }
        self.notify(
            Signal::Error,
            &format!("Live view frame from {} never became ready", self.hardware_id),
        );
        Ok(None)
    }

    /// Hand frames to `on_frame` until `stop` is set or the stream ends.
    /// Returns the number of frames delivered.
    pub fn stream_live_view(
        &self,
        stop: &StopFlag,
        mut on_frame: impl FnMut(Vec<u8>),
    ) -> AppResult<usize> {
        let mut frames = 0;
        while !stop.is_set() && self.is_live_view() {
            match self.live_view_frame()? {
                Some(frame) => {
                    on_frame(frame);
                    frames += 1;
                }
                None => break,
            }
        }
        Ok(frames)
    }

    /// Stop streaming live view to the host.
    pub fn stop_live_view(&self) -> AppResult<()> {
        let camera = {
            let mut state = self.state.lock();
            state.live_view = false;
            state.camera
        };
        if let Some(camera) = camera {
            self.sdk
                .set_property(camera, props::EVF_OUTPUT_DEVICE, props::EVF_OUTPUT_OFF)
                .map_err(|e| RigError::sdk("set_property(Evf_OutputDevice)", e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::mock::MockCaptureSdk;
    use crate::notify::LogBuffer;
    use tempfile::TempDir;

    const JPEG_ONLY: u32 = 0x0013_FF0F;
    const RAW_JPEG: u32 = 0x0064_1300;

    fn session(quality: u32, dir: &TempDir) -> (Arc<MockCaptureSdk>, Arc<CaptureSession>, LogBuffer, CameraRef) {
        let sdk = Arc::new(MockCaptureSdk::new());
        let camera = sdk.add_camera("CAM-1", quality);
        let log = LogBuffer::new();
        let config = CaptureConfig {
            save_dir: dir.path().to_path_buf(),
            evf_retry_attempts: 3,
            evf_retry_interval_ms: 1,
            ..CaptureConfig::default()
        };
        let session = CaptureSession::new(5, "CAM-1", sdk.clone(), Arc::new(log.clone()), &config);
        (sdk, session, log, camera)
    }

    #[test]
    fn test_connect_routes_to_host() {
        let dir = TempDir::new().unwrap();
        let (sdk, session, log, camera) = session(JPEG_ONLY, &dir);
        session.connect(camera).unwrap();
        assert!(session.is_connected());
        assert!(sdk.is_session_open(camera));
        assert!(sdk.has_handler(camera));
        assert_eq!(sdk.property(camera, props::SAVE_TO), Some(props::SAVE_TO_HOST));
        assert_eq!(log.count_containing(Signal::Info, "CAM-1 connected"), 1);
    }

    #[test]
    fn test_take_picture_requires_session() {
        let dir = TempDir::new().unwrap();
        let (_sdk, session, _log, _camera) = session(JPEG_ONLY, &dir);
        assert!(matches!(session.take_picture(true), Err(RigError::SessionNotOpen)));
    }

    #[test]
    fn test_single_file_quality() {
        let dir = TempDir::new().unwrap();
        let (sdk, session, _log, camera) = session(JPEG_ONLY, &dir);
        session.connect(camera).unwrap();
        session.take_picture(false).unwrap();
        assert_eq!(session.buffer(), (0, 1));
        assert!(session.is_writing());
        assert_eq!(
            sdk.commands(camera),
            vec![
                CameraCommand::PressShutterButton(ShutterButton::CompletelyNonAf),
                CameraCommand::PressShutterButton(ShutterButton::Off),
            ]
        );

        sdk.pump_events().unwrap();
        assert!(!session.is_writing());
        assert!(!session.is_connected());
        assert!(!sdk.is_session_open(camera));
        assert_eq!(session.downloaded().len(), 1);
        assert_eq!(sdk.download_count(), 1);
    }

    #[test]
    fn test_dual_file_quality_waits_for_both() {
        let dir = TempDir::new().unwrap();
        let (sdk, session, _log, camera) = session(RAW_JPEG, &dir);
        session.set_save_target(dir.path().join("pose_003"), Some("pose_003".into()));
        session.connect(camera).unwrap();
        session.take_picture(true).unwrap();
        assert_eq!(session.buffer(), (0, 2));

        assert!(sdk.pump_one());
        assert_eq!(session.buffer(), (1, 2));
        assert!(session.is_writing());
        assert!(session.is_connected());

        assert!(sdk.pump_one());
        assert!(!session.is_writing());
        assert!(!session.is_connected());

        let mut names: Vec<String> = session
            .downloaded()
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        names.sort();
        assert_eq!(names, vec!["pose_003.CR3", "pose_003.JPG"]);
    }

    #[test]
    fn test_shutdown_event_skips_close() {
        let dir = TempDir::new().unwrap();
        let (sdk, session, log, camera) = session(JPEG_ONLY, &dir);
        session.connect(camera).unwrap();
        let code = session.handle_event(CameraEvent::State(StateEvent::Shutdown));
        assert_eq!(code, codes::OK);
        assert!(!session.is_connected());
        assert_eq!(sdk.close_count(), 0);
        assert!(!sdk.has_handler(camera));
        assert_eq!(log.count_containing(Signal::Info, "shut down"), 1);
    }

    #[test]
    fn test_will_soon_shut_down_extends_timer() {
        let dir = TempDir::new().unwrap();
        let (sdk, session, _log, camera) = session(JPEG_ONLY, &dir);
        session.handle_event(CameraEvent::State(StateEvent::WillSoonShutDown));
        assert!(sdk.commands(camera).is_empty());

        session.connect(camera).unwrap();
        session.handle_event(CameraEvent::State(StateEvent::WillSoonShutDown));
        assert_eq!(sdk.commands(camera), vec![CameraCommand::ExtendShutDownTimer]);
    }

    #[test]
    fn test_live_view_retries_not_ready() {
        let dir = TempDir::new().unwrap();
        let (sdk, session, _log, camera) = session(JPEG_ONLY, &dir);
        session.connect(camera).unwrap();
        session.start_live_view().unwrap();
        assert_eq!(
            sdk.property(camera, props::EVF_OUTPUT_DEVICE),
            Some(props::EVF_OUTPUT_PC)
        );

        sdk.script_evf(vec![codes::OBJECT_NOTREADY, codes::OBJECT_NOTREADY]);
        assert!(session.live_view_frame().unwrap().is_some());

        sdk.script_evf(vec![codes::OBJECT_NOTREADY; 3]);
        assert!(session.live_view_frame().unwrap().is_none());
        assert!(session.is_connected());
    }

    #[test]
    fn test_live_view_comm_loss_ends_session() {
        let dir = TempDir::new().unwrap();
        let (sdk, session, _log, camera) = session(JPEG_ONLY, &dir);
        session.connect(camera).unwrap();
        session.start_live_view().unwrap();
        sdk.script_evf(vec![codes::COMM_DISCONNECTED]);

        let frames = session.stream_live_view(&StopFlag::new(), |_| {}).unwrap();
        assert_eq!(frames, 0);
        assert!(!session.is_connected());
        assert_eq!(sdk.close_count(), 0);
    }

    #[test]
    fn test_transfer_pictures() {
        let dir = TempDir::new().unwrap();
        let (sdk, session, _log, camera) = session(JPEG_ONLY, &dir);
        sdk.store_file(camera, "IMG_0100.JPG", b"jpeg".to_vec());
        sdk.store_file(camera, "IMG_0101.CR3", b"raw".to_vec());
        session.connect(camera).unwrap();

        let out = dir.path().join("export");
        let written = session.transfer_pictures(&out).unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(fs::read(out.join("IMG_0101.CR3")).unwrap(), b"raw");
    }

    #[test]
    fn test_sdk_failure_is_named() {
        let dir = TempDir::new().unwrap();
        let (sdk, session, _log, camera) = session(JPEG_ONLY, &dir);
        sdk.fail_next("open_session", codes::DEVICE_BUSY);
        let err = session.connect(camera).unwrap_err();
        assert!(err.to_string().contains("DEVICE_BUSY"));
        assert!(!session.is_connected());
    }
}
