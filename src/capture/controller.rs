//! Owned lifecycle for the vendor capture library.

use super::sdk::{CameraInfo, CameraRef, CaptureSdk};
use crate::error::{AppResult, RigError};
use crate::notify::{SharedNotifier, Signal};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Explicit owner of an initialized [`CaptureSdk`].
///
/// The vendor library must be initialized once before any camera call and
/// terminated after the last session closes. Dropping an initialized
/// controller terminates the library.
pub struct CaptureController {
    sdk: Arc<dyn CaptureSdk>,
    notifier: SharedNotifier,
    initialized: AtomicBool,
}

impl CaptureController {
    /// Controller for `sdk`; the library stays uninitialized until first use.
    pub fn new(sdk: Arc<dyn CaptureSdk>, notifier: SharedNotifier) -> Self {
        Self {
            sdk,
            notifier,
            initialized: AtomicBool::new(false),
        }
    }

    /// Shared handle to the library.
    pub fn sdk(&self) -> Arc<dyn CaptureSdk> {
        Arc::clone(&self.sdk)
    }

    /// True between a successful initialize and dispose.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Initialize the library. Repeated calls are no-ops.
    pub fn initialize(&self) -> AppResult<()> {
        if self.is_initialized() {
            return Ok(());
        }
        self.sdk
            .initialize()
            .map_err(|e| RigError::sdk("initialize", e))?;
        self.initialized.store(true, Ordering::SeqCst);
        self.notifier.log(Signal::Debug, "Capture SDK initialized");
        Ok(())
    }

    /// Terminate the library if it was initialized.
    pub fn dispose(&self) -> AppResult<()> {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.sdk
            .terminate()
            .map_err(|e| RigError::sdk("terminate", e))?;
        self.notifier.log(Signal::Debug, "Capture SDK terminated");
        Ok(())
    }

    fn ensure_initialized(&self) -> AppResult<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(RigError::SdkNotInitialized)
        }
    }

    /// Every attached camera with its identity.
    pub fn cameras(&self) -> AppResult<Vec<(CameraRef, CameraInfo)>> {
        self.ensure_initialized()?;
        let list = self
            .sdk
            .camera_list()
            .map_err(|e| RigError::sdk("camera_list", e))?;
        list.into_iter()
            .map(|camera| {
                self.sdk
                    .camera_info(camera)
                    .map(|info| (camera, info))
                    .map_err(|e| RigError::sdk("camera_info", e))
            })
            .collect()
    }

    /// Camera whose hardware id matches `hardware_id`.
    pub fn find_camera(&self, hardware_id: &str) -> AppResult<CameraRef> {
        self.cameras()?
            .into_iter()
            .find(|(_, info)| info.hardware_id == hardware_id)
            .map(|(camera, _)| camera)
            .ok_or_else(|| RigError::CameraNotFound(hardware_id.to_string()))
    }

    /// Deliver queued vendor events to session handlers.
    pub fn pump_events(&self) -> AppResult<()> {
        self.ensure_initialized()?;
        self.sdk
            .pump_events()
            .map_err(|e| RigError::sdk("get_event", e))
    }
}

impl Drop for CaptureController {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            self.notifier
                .log(Signal::Error, &format!("Capture SDK shutdown failed: {e}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::mock::MockCaptureSdk;
    use crate::capture::sdk::codes;
    use crate::notify::LogBuffer;

    #[test]
    fn test_lifecycle() {
        let sdk = Arc::new(MockCaptureSdk::new());
        let controller = CaptureController::new(sdk.clone(), Arc::new(LogBuffer::new()));
        assert!(matches!(controller.cameras(), Err(RigError::SdkNotInitialized)));

        controller.initialize().unwrap();
        controller.initialize().unwrap();
        assert!(sdk.is_initialized());

        controller.dispose().unwrap();
        assert!(!sdk.is_initialized());
        controller.dispose().unwrap();
    }

    #[test]
    fn test_drop_terminates() {
        let sdk = Arc::new(MockCaptureSdk::new());
        {
            let controller = CaptureController::new(sdk.clone(), Arc::new(LogBuffer::new()));
            controller.initialize().unwrap();
        }
        assert!(!sdk.is_initialized());
    }

    #[test]
    fn test_find_camera() {
        let sdk = Arc::new(MockCaptureSdk::new());
        sdk.add_camera("CAM-A", 0);
        let b = sdk.add_camera("CAM-B", 0);
        let controller = CaptureController::new(sdk, Arc::new(LogBuffer::new()));
        controller.initialize().unwrap();

        assert_eq!(controller.cameras().unwrap().len(), 2);
        assert_eq!(controller.find_camera("CAM-B").unwrap(), b);
        assert!(matches!(
            controller.find_camera("CAM-Z"),
            Err(RigError::CameraNotFound(id)) if id == "CAM-Z"
        ));
    }

    #[test]
    fn test_initialize_failure_is_named() {
        let sdk = Arc::new(MockCaptureSdk::new());
        sdk.fail_next("initialize", codes::INTERNAL_ERROR);
        let controller = CaptureController::new(sdk, Arc::new(LogBuffer::new()));
        let err = controller.initialize().unwrap_err();
        assert!(err.to_string().contains("INTERNAL_ERROR"));
        assert!(!controller.is_initialized());
    }
}
