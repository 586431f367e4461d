//! In-memory vendor SDK for tests and `--simulate`.
//!
//! A shutter release adds one or two files to the camera card (depending on
//! the image-quality property) and queues a transfer request per file. Queued
//! events reach the installed handlers only on [`CaptureSdk::pump_events`] or
//! [`MockCaptureSdk::pump_one`], the way the vendor library delivers them on
//! its own message loop.

use super::sdk::{
    codes, files_per_capture, props, CameraCommand, CameraEvent, CameraInfo, CameraRef,
    CaptureSdk, DirItem, EventHandler, ObjectEvent, SdkError, SdkResult, ShutterButton,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

#[derive(Default)]
struct MockCamera {
    info: Option<CameraInfo>,
    card: Vec<(DirItem, Vec<u8>)>,
    commands: Vec<CameraCommand>,
}

#[derive(Default)]
struct MockState {
    initialized: bool,
    cameras: BTreeMap<CameraRef, MockCamera>,
    open: BTreeSet<CameraRef>,
    properties: HashMap<(CameraRef, u32), u32>,
    handlers: BTreeMap<CameraRef, EventHandler>,
    pending: VecDeque<(CameraRef, CameraEvent)>,
    failures: HashMap<&'static str, u32>,
    evf_script: VecDeque<u32>,
    next_handle: u64,
    shots: u32,
    downloads: usize,
    closes: usize,
    acks: Vec<u32>,
}

impl MockState {
    fn take_failure(&mut self, operation: &'static str) -> SdkResult<()> {
        match self.failures.remove(operation) {
            Some(code) => Err(SdkError::new(code)),
            None => Ok(()),
        }
    }

    fn require_open(&self, camera: CameraRef) -> SdkResult<()> {
        if self.open.contains(&camera) {
            Ok(())
        } else {
            Err(SdkError::new(codes::SESSION_NOT_OPEN))
        }
    }

    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn store(&mut self, camera: CameraRef, file_name: &str, bytes: Vec<u8>) -> Option<DirItem> {
        let item = DirItem {
            handle: self.next_handle(),
            file_name: file_name.to_string(),
            size: bytes.len() as u64,
            is_folder: false,
        };
        let entry = self.cameras.get_mut(&camera)?;
        entry.card.push((item.clone(), bytes));
        Some(item)
    }

    fn release_shutter(&mut self, camera: CameraRef) {
        let quality = self
            .properties
            .get(&(camera, props::IMAGE_QUALITY))
            .copied()
            .unwrap_or(props::QUALITY_UNKNOWN);
        self.shots += 1;
        let stem = format!("IMG_{:04}", self.shots);
        let mut names = vec![format!("{stem}.JPG")];
        if files_per_capture(quality) == 2 {
            names.push(format!("{stem}.CR3"));
        }
        for name in names {
            let bytes = name.as_bytes().to_vec();
            if let Some(item) = self.store(camera, &name, bytes) {
                self.pending.push_back((
                    camera,
                    CameraEvent::Object(ObjectEvent::DirItemRequestTransfer(item)),
                ));
            }
        }
    }
}

/// Scriptable stand-in for the vendor capture SDK.
#[derive(Default)]
pub struct MockCaptureSdk {
    state: Mutex<MockState>,
}

impl MockCaptureSdk {
    /// SDK with no cameras attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a camera reporting `quality` for the image-quality property.
    pub fn add_camera(&self, hardware_id: &str, quality: u32) -> CameraRef {
        let mut state = self.state.lock();
        let camera = CameraRef(state.next_handle());
        state.cameras.insert(
            camera,
            MockCamera {
                info: Some(CameraInfo {
                    hardware_id: hardware_id.to_string(),
                    description: "Simulated EOS".to_string(),
                    firmware: "1.0.0".to_string(),
                }),
                ..MockCamera::default()
            },
        );
        state.properties.insert((camera, props::IMAGE_QUALITY), quality);
        camera
    }

    /// Place a file on the camera card without raising a transfer request.
    pub fn store_file(&self, camera: CameraRef, file_name: &str, bytes: Vec<u8>) {
        self.state.lock().store(camera, file_name, bytes);
    }

    /// Queue an event for `camera`'s handler.
    pub fn push_event(&self, camera: CameraRef, event: CameraEvent) {
        self.state.lock().pending.push_back((camera, event));
    }

    /// Make the next call to `operation` fail with `code`.
    pub fn fail_next(&self, operation: &'static str, code: u32) {
        self.state.lock().failures.insert(operation, code);
    }

    /// Error codes returned, in order, by the next live-view downloads.
    pub fn script_evf(&self, errors: Vec<u32>) {
        self.state.lock().evf_script = errors.into();
    }

    /// Deliver the oldest pending event. Returns false when none was queued.
    pub fn pump_one(&self) -> bool {
        let next = {
            let mut state = self.state.lock();
            state.pending.pop_front().map(|(camera, event)| {
                let handler = state.handlers.get(&camera).cloned();
                (handler, event)
            })
        };
        let Some((handler, event)) = next else {
            return false;
        };
        if let Some(handler) = handler {
            let ack = handler(event);
            self.state.lock().acks.push(ack);
        }
        true
    }

    /// Events queued and not yet pumped.
    pub fn pending_events(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// True between `initialize` and `terminate`.
    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// True while `camera` has an open session.
    pub fn is_session_open(&self, camera: CameraRef) -> bool {
        self.state.lock().open.contains(&camera)
    }

    /// True while `camera` has an event handler installed.
    pub fn has_handler(&self, camera: CameraRef) -> bool {
        self.state.lock().handlers.contains_key(&camera)
    }

    /// Current value of `property` on `camera`.
    pub fn property(&self, camera: CameraRef, property: u32) -> Option<u32> {
        self.state.lock().properties.get(&(camera, property)).copied()
    }

    /// Commands sent to `camera`, oldest first.
    pub fn commands(&self, camera: CameraRef) -> Vec<CameraCommand> {
        self.state
            .lock()
            .cameras
            .get(&camera)
            .map(|c| c.commands.clone())
            .unwrap_or_default()
    }

    /// Files downloaded across all cameras.
    pub fn download_count(&self) -> usize {
        self.state.lock().downloads
    }

    /// Sessions closed across all cameras.
    pub fn close_count(&self) -> usize {
        self.state.lock().closes
    }

    /// Acknowledgement codes returned by handlers, in delivery order.
    pub fn acks(&self) -> Vec<u32> {
        self.state.lock().acks.clone()
    }
}

impl CaptureSdk for MockCaptureSdk {
    fn initialize(&self) -> SdkResult<()> {
        let mut state = self.state.lock();
        state.take_failure("initialize")?;
        state.initialized = true;
        Ok(())
    }

    fn terminate(&self) -> SdkResult<()> {
        let mut state = self.state.lock();
        state.take_failure("terminate")?;
        state.initialized = false;
        state.open.clear();
        state.handlers.clear();
        state.pending.clear();
        Ok(())
    }

    fn camera_list(&self) -> SdkResult<Vec<CameraRef>> {
        let mut state = self.state.lock();
        state.take_failure("camera_list")?;
        Ok(state.cameras.keys().copied().collect())
    }

    fn camera_info(&self, camera: CameraRef) -> SdkResult<CameraInfo> {
        let state = self.state.lock();
        state
            .cameras
            .get(&camera)
            .and_then(|c| c.info.clone())
            .ok_or(SdkError::new(codes::DEVICE_NOT_FOUND))
    }

    fn open_session(&self, camera: CameraRef) -> SdkResult<()> {
        let mut state = self.state.lock();
        state.take_failure("open_session")?;
        if !state.cameras.contains_key(&camera) {
            return Err(SdkError::new(codes::DEVICE_NOT_FOUND));
        }
        state.open.insert(camera);
        Ok(())
    }

    fn close_session(&self, camera: CameraRef) -> SdkResult<()> {
        let mut state = self.state.lock();
        state.take_failure("close_session")?;
        state.require_open(camera)?;
        state.open.remove(&camera);
        state.closes += 1;
        Ok(())
    }

    fn get_property(&self, camera: CameraRef, property: u32) -> SdkResult<u32> {
        let mut state = self.state.lock();
        state.take_failure("get_property")?;
        state.require_open(camera)?;
        Ok(state
            .properties
            .get(&(camera, property))
            .copied()
            .unwrap_or(props::QUALITY_UNKNOWN))
    }

    fn set_property(&self, camera: CameraRef, property: u32, value: u32) -> SdkResult<()> {
        let mut state = self.state.lock();
        state.take_failure("set_property")?;
        state.require_open(camera)?;
        state.properties.insert((camera, property), value);
        Ok(())
    }

    fn send_command(&self, camera: CameraRef, command: CameraCommand) -> SdkResult<()> {
        let mut state = self.state.lock();
        state.take_failure("send_command")?;
        state.require_open(camera)?;
        if let Some(entry) = state.cameras.get_mut(&camera) {
            entry.commands.push(command);
        }
        let fires = matches!(
            command,
            CameraCommand::TakePicture
                | CameraCommand::PressShutterButton(
                    ShutterButton::Completely | ShutterButton::CompletelyNonAf
                )
        );
        if fires {
            state.release_shutter(camera);
        }
        Ok(())
    }

    fn set_event_handler(&self, camera: CameraRef, handler: Option<EventHandler>) -> SdkResult<()> {
        let mut state = self.state.lock();
        state.take_failure("set_event_handler")?;
        match handler {
            Some(handler) => {
                state.handlers.insert(camera, handler);
            }
            None => {
                state.handlers.remove(&camera);
            }
        }
        Ok(())
    }

    fn list_storage(&self, camera: CameraRef) -> SdkResult<Vec<DirItem>> {
        let mut state = self.state.lock();
        state.take_failure("list_storage")?;
        state.require_open(camera)?;
        let folder = DirItem {
            handle: 0,
            file_name: "DCIM".to_string(),
            size: 0,
            is_folder: true,
        };
        let files = state
            .cameras
            .get(&camera)
            .map(|c| c.card.iter().map(|(item, _)| item.clone()).collect::<Vec<_>>())
            .unwrap_or_default();
        Ok(std::iter::once(folder).chain(files).collect())
    }

    fn download(&self, camera: CameraRef, item: &DirItem) -> SdkResult<Vec<u8>> {
        let mut state = self.state.lock();
        state.take_failure("download")?;
        state.require_open(camera)?;
        let bytes = state
            .cameras
            .get(&camera)
            .and_then(|c| c.card.iter().find(|(i, _)| i.handle == item.handle))
            .map(|(_, bytes)| bytes.clone())
            .ok_or(SdkError::new(codes::INTERNAL_ERROR))?;
        state.downloads += 1;
        Ok(bytes)
    }

    fn download_complete(&self, camera: CameraRef, _item: &DirItem) -> SdkResult<()> {
        let mut state = self.state.lock();
        state.take_failure("download_complete")?;
        state.require_open(camera)
    }

    fn download_evf_image(&self, camera: CameraRef) -> SdkResult<Vec<u8>> {
        let mut state = self.state.lock();
        state.require_open(camera)?;
        if let Some(code) = state.evf_script.pop_front() {
            return Err(SdkError::new(code));
        }
        match state.properties.get(&(camera, props::EVF_OUTPUT_DEVICE)) {
            Some(&props::EVF_OUTPUT_PC) => Ok(vec![0xFF, 0xD8, 0xFF, 0xD9]),
            _ => Err(SdkError::new(codes::OBJECT_NOTREADY)),
        }
    }

    fn pump_events(&self) -> SdkResult<()> {
        while self.pump_one() {}
        Ok(())
    }
}
