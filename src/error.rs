//! Custom error types for the application.
//!
//! This module defines the primary error type, `RigError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the kinds of errors that can occur, from configuration and I/O problems to
//! transport failures and vendor capture SDK result codes.
//!
//! ## Error Hierarchy
//!
//! - **`Config`** / **`Configuration`**: file parsing failures from `figment` and semantic
//!   validation failures respectively.
//! - **`Io`**: wraps `std::io::Error` (exports, downloads, raw port I/O).
//! - **Transport errors** (`SerialPortNotConnected`, `PortNotOpen`, `Transport`): logged at the
//!   boundary by the sender and listener and never re-raised into run controllers.
//! - **`DeviceReference`**: the only error raised synchronously to a caller that asked for a
//!   compile, since nothing has been sent yet.
//! - **`Sdk`**: a non-OK result from the vendor capture SDK, carrying the numeric code.
//!
//! By using `#[from]`, `RigError` can be created from underlying error types with `?`.

use crate::capture::sdk::SdkError;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, RigError>;

/// Every failure the orchestration layer reports. Variants are described by
/// their display messages.
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum RigError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Serial port not connected")]
    SerialPortNotConnected,

    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    #[error("Port '{0}' is not open")]
    PortNotOpen(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Device Reference error: device {device_id} is not in the active device set")]
    DeviceReference { device_id: u32 },

    #[error("Failed to start worker '{name}': {source}")]
    WorkerSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("A run of kind {0} is already active")]
    RunActive(String),

    #[error("Capture SDK error during {operation}: {source}")]
    Sdk {
        operation: &'static str,
        #[source]
        source: SdkError,
    },

    #[error("Capture SDK is not initialized")]
    SdkNotInitialized,

    #[error("No capture session is open")]
    SessionNotOpen,

    #[error("No camera matches device '{0}'")]
    CameraNotFound(String),

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<RigError>),
}

impl From<figment::Error> for RigError {
    fn from(err: figment::Error) -> Self {
        RigError::Config(Box::new(err))
    }
}

#[cfg(feature = "instrument_serial")]
impl From<serialport::Error> for RigError {
    fn from(err: serialport::Error) -> Self {
        RigError::Transport(err.to_string())
    }
}

impl RigError {
    /// Wraps a vendor SDK result code with the operation that produced it.
    pub fn sdk(operation: &'static str, source: SdkError) -> Self {
        RigError::Sdk { operation, source }
    }

    /// True for the transport-class errors that are logged and dropped rather than retried.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RigError::SerialPortNotConnected
                | RigError::PortNotOpen(_)
                | RigError::Transport(_)
                | RigError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RigError::DeviceReference { device_id: 7 };
        assert!(err.to_string().contains("Device Reference"));
        assert!(err.to_string().contains('7'));
    }

    #[test]
    fn test_sdk_error_carries_code() {
        let err = RigError::sdk("open_session", SdkError::new(0xA102));
        let text = err.to_string();
        assert!(text.contains("open_session"));
        assert!(text.contains("OBJECT_NOTREADY"));
    }

    #[test]
    fn test_transport_classification() {
        assert!(RigError::Transport("wedged".into()).is_transport());
        assert!(RigError::PortNotOpen("COM3".into()).is_transport());
        assert!(!RigError::DeviceReference { device_id: 1 }.is_transport());
    }

    #[test]
    fn test_shutdown_failed_error() {
        let err = RigError::ShutdownFailed(vec![
            RigError::Transport("listener join".into()),
            RigError::SessionNotOpen,
        ]);
        assert!(err.to_string().contains("Shutdown failed"));
    }
}
