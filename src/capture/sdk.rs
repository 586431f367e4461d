//! Vendor capture SDK capability.
//!
//! The vendor library is reference counted and callback driven. Everything
//! above this module sees it through [`CaptureSdk`]: open a session, set or read
//! a property, send a command, enumerate storage, download a byte stream and
//! receive [`CameraEvent`]s through one handler per camera.

use std::fmt;
use std::sync::Arc;

/// Result of a vendor SDK call.
pub type SdkResult<T> = Result<T, SdkError>;

/// Numeric result codes the orchestration layer recognises.
pub mod codes {
    /// Success
    pub const OK: u32 = 0x0000_0000;
    /// Unexpected library failure
    pub const INTERNAL_ERROR: u32 = 0x0000_0002;
    /// Camera not attached
    pub const DEVICE_NOT_FOUND: u32 = 0x0000_0080;
    /// Camera is busy, retry later
    pub const DEVICE_BUSY: u32 = 0x0000_0081;
    /// Another application holds the camera
    pub const COMM_PORT_IS_IN_USE: u32 = 0x0000_00C0;
    /// Camera went away
    pub const COMM_DISCONNECTED: u32 = 0x0000_00C1;
    /// Call needs an open session
    pub const SESSION_NOT_OPEN: u32 = 0x0000_2003;
    /// Autofocus failed to lock
    pub const TAKE_PICTURE_AF_NG: u32 = 0x0000_8D01;
    /// Object not ready; live view frames are retried on this
    pub const OBJECT_NOTREADY: u32 = 0x0000_A102;
}

/// Event ids carried by [`CameraEvent`] variants.
pub mod events {
    /// A property value changed
    pub const PROPERTY_CHANGED: u32 = 0x0000_0101;
    /// A captured file waits for download
    pub const DIR_ITEM_REQUEST_TRANSFER: u32 = 0x0000_0208;
    /// Camera shut down or was unplugged
    pub const STATE_SHUTDOWN: u32 = 0x0000_0301;
    /// Camera is about to power down
    pub const STATE_WILL_SOON_SHUT_DOWN: u32 = 0x0000_0303;
}

/// Property ids and values used by the session.
pub mod props {
    /// Where captured images are stored
    pub const SAVE_TO: u32 = 0x0000_000B;
    /// Output format and size of captured images
    pub const IMAGE_QUALITY: u32 = 0x0000_0100;
    /// Live view output destination
    pub const EVF_OUTPUT_DEVICE: u32 = 0x0000_0500;

    /// `SAVE_TO` value sending images to the host
    pub const SAVE_TO_HOST: u32 = 2;
    /// `EVF_OUTPUT_DEVICE` value streaming live view to the host
    pub const EVF_OUTPUT_PC: u32 = 2;
    /// `EVF_OUTPUT_DEVICE` value turning host live view off
    pub const EVF_OUTPUT_OFF: u32 = 0;
    /// `IMAGE_QUALITY` value the camera reports when it cannot tell
    pub const QUALITY_UNKNOWN: u32 = 0xFFFF_FFFF;
}

/// A non-OK vendor result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SdkError {
    code: u32,
}

impl SdkError {
    /// Error for raw `code`.
    pub const fn new(code: u32) -> Self {
        Self { code }
    }

    /// Raw vendor code.
    pub fn code(&self) -> u32 {
        self.code
    }

    /// Symbolic name for codes the layer knows about.
    pub fn name(&self) -> Option<&'static str> {
        let name = match self.code {
            codes::INTERNAL_ERROR => "INTERNAL_ERROR",
            codes::DEVICE_NOT_FOUND => "DEVICE_NOT_FOUND",
            codes::DEVICE_BUSY => "DEVICE_BUSY",
            codes::COMM_PORT_IS_IN_USE => "COMM_PORT_IS_IN_USE",
            codes::COMM_DISCONNECTED => "COMM_DISCONNECTED",
            codes::SESSION_NOT_OPEN => "SESSION_NOT_OPEN",
            codes::TAKE_PICTURE_AF_NG => "TAKE_PICTURE_AF_NG",
            codes::OBJECT_NOTREADY => "OBJECT_NOTREADY",
            _ => return None,
        };
        Some(name)
    }

    /// Live view frame not available yet.
    pub fn is_object_not_ready(&self) -> bool {
        self.code == codes::OBJECT_NOTREADY
    }

    /// Camera connection dropped.
    pub fn is_comm_disconnected(&self) -> bool {
        self.code == codes::COMM_DISCONNECTED
    }

    /// Convert a raw vendor return value.
    pub fn check(code: u32) -> SdkResult<()> {
        if code == codes::OK {
            Ok(())
        } else {
            Err(Self::new(code))
        }
    }
}

impl fmt::Display for SdkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "EDS_ERR_{} (0x{:08X})", name, self.code),
            None => write!(f, "vendor error 0x{:08X}", self.code),
        }
    }
}

impl std::error::Error for SdkError {}

/// Opaque handle to a camera known to the SDK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CameraRef(pub u64);

/// Identity reported for a camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraInfo {
    /// Body serial number or USB path
    pub hardware_id: String,
    /// Model description
    pub description: String,
    /// Firmware version
    pub firmware: String,
}

/// File or folder in camera storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirItem {
    /// Vendor handle of the item
    pub handle: u64,
    /// File name as stored on the card
    pub file_name: String,
    /// Size in bytes
    pub size: u64,
    /// True for a folder
    pub is_folder: bool,
}

/// Position of the shutter button.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutterButton {
    /// Released
    Off,
    /// Half pressed, focusing
    Halfway,
    /// Fully pressed
    Completely,
    /// Fully pressed without autofocus
    CompletelyNonAf,
}

impl ShutterButton {
    /// Vendor parameter value.
    pub fn code(&self) -> u32 {
        match self {
            ShutterButton::Off => 0x0000_0000,
            ShutterButton::Halfway => 0x0000_0001,
            ShutterButton::Completely => 0x0000_0003,
            ShutterButton::CompletelyNonAf => 0x0001_0003,
        }
    }
}

/// Commands sent to a camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraCommand {
    /// Release the shutter
    TakePicture,
    /// Keep the camera from powering down
    ExtendShutDownTimer,
    /// Move the shutter button
    PressShutterButton(ShutterButton),
}

impl CameraCommand {
    /// Vendor command id.
    pub fn code(&self) -> u32 {
        match self {
            CameraCommand::TakePicture => 0x0000_0000,
            CameraCommand::ExtendShutDownTimer => 0x0000_0001,
            CameraCommand::PressShutterButton(_) => 0x0000_0004,
        }
    }
}

/// Object events. Only a transfer request is acted on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectEvent {
    /// A file is ready to download
    DirItemRequestTransfer(DirItem),
    /// Any other object event id
    Other(u32),
}

/// Property events. Received but without side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyEvent {
    /// `property` changed; `param` is vendor detail
    Changed {
        /// Property id
        property: u32,
        /// Vendor detail
        param: u32,
    },
    /// Any other property event id
    Other(u32),
}

/// Camera state events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    /// Camera is about to power down
    WillSoonShutDown,
    /// Camera is gone; the session must be dropped without closing
    Shutdown,
    /// Any other state event id
    Other(u32),
}

/// One vendor callback, tagged by category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraEvent {
    /// Storage object event
    Object(ObjectEvent),
    /// Property event
    Property(PropertyEvent),
    /// Camera state event
    State(StateEvent),
}

impl CameraEvent {
    /// Vendor event id.
    pub fn id(&self) -> u32 {
        match self {
            CameraEvent::Object(ObjectEvent::DirItemRequestTransfer(_)) => {
                events::DIR_ITEM_REQUEST_TRANSFER
            }
            CameraEvent::Property(PropertyEvent::Changed { .. }) => events::PROPERTY_CHANGED,
            CameraEvent::State(StateEvent::WillSoonShutDown) => events::STATE_WILL_SOON_SHUT_DOWN,
            CameraEvent::State(StateEvent::Shutdown) => events::STATE_SHUTDOWN,
            CameraEvent::Object(ObjectEvent::Other(id))
            | CameraEvent::Property(PropertyEvent::Other(id))
            | CameraEvent::State(StateEvent::Other(id)) => *id,
        }
    }
}

/// Single dispatch entry point for a camera's events; returns a vendor result code.
pub type EventHandler = Arc<dyn Fn(CameraEvent) -> u32 + Send + Sync>;

/// Number of files one shutter release produces for an `IMAGE_QUALITY` value.
///
/// Single-format qualities carry `0xFF` in the secondary-format byte; every
/// other value, including an unknown quality, is treated as RAW+JPEG.
pub fn files_per_capture(quality: u32) -> u32 {
    if quality != props::QUALITY_UNKNOWN && (quality >> 8) & 0xFF == 0xFF {
        1
    } else {
        2
    }
}

/// The vendor capture library.
pub trait CaptureSdk: Send + Sync {
    /// Load the library. Reference counted.
    fn initialize(&self) -> SdkResult<()>;
    /// Release one reference to the library.
    fn terminate(&self) -> SdkResult<()>;

    /// Cameras currently attached.
    fn camera_list(&self) -> SdkResult<Vec<CameraRef>>;
    /// Identity of `camera`.
    fn camera_info(&self, camera: CameraRef) -> SdkResult<CameraInfo>;

    /// Open a session on `camera`.
    fn open_session(&self, camera: CameraRef) -> SdkResult<()>;
    /// Close the session on `camera`.
    fn close_session(&self, camera: CameraRef) -> SdkResult<()>;

    /// Read a property value.
    fn get_property(&self, camera: CameraRef, property: u32) -> SdkResult<u32>;
    /// Write a property value.
    fn set_property(&self, camera: CameraRef, property: u32, value: u32) -> SdkResult<()>;
    /// Send one command.
    fn send_command(&self, camera: CameraRef, command: CameraCommand) -> SdkResult<()>;

    /// Install (`Some`) or remove (`None`) the handler for all three event categories.
    fn set_event_handler(&self, camera: CameraRef, handler: Option<EventHandler>) -> SdkResult<()>;

    /// Every item in camera storage, folders included, depth first.
    fn list_storage(&self, camera: CameraRef) -> SdkResult<Vec<DirItem>>;
    /// Read the full content of `item`.
    fn download(&self, camera: CameraRef, item: &DirItem) -> SdkResult<Vec<u8>>;
    /// Tell the camera `item` has been transferred.
    fn download_complete(&self, camera: CameraRef, item: &DirItem) -> SdkResult<()>;
    /// Fetch the current live view frame.
    fn download_evf_image(&self, camera: CameraRef) -> SdkResult<Vec<u8>>;

    /// Deliver pending events to their handlers.
    fn pump_events(&self) -> SdkResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_names() {
        let err = SdkError::new(codes::OBJECT_NOTREADY);
        assert!(err.is_object_not_ready());
        assert_eq!(err.to_string(), "EDS_ERR_OBJECT_NOTREADY (0x0000A102)");
        assert_eq!(SdkError::new(0x1234).name(), None);
        assert!(SdkError::check(codes::OK).is_ok());
        assert!(SdkError::check(codes::COMM_DISCONNECTED)
            .unwrap_err()
            .is_comm_disconnected());
    }

    #[test]
    fn test_files_per_capture() {
        // Large fine JPEG only
        assert_eq!(files_per_capture(0x0013_FF0F), 1);
        // RAW + large fine JPEG
        assert_eq!(files_per_capture(0x0064_1300), 2);
        assert_eq!(files_per_capture(props::QUALITY_UNKNOWN), 2);
    }

    #[test]
    fn test_event_ids() {
        assert_eq!(CameraEvent::State(StateEvent::Shutdown).id(), 0x301);
        assert_eq!(CameraEvent::Object(ObjectEvent::Other(0x204)).id(), 0x204);
    }
}
