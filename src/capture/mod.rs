//! Remote-capture cameras behind the vendor SDK.
//!
//! - [`sdk`]: the SDK capability, its result codes and tagged event type
//! - [`controller`]: explicit initialize / dispose ownership of the library
//! - [`session`]: one camera session with image-buffer accounting and live view
//! - [`bank`]: sessions for every remote-capture device, fired by the sender
//! - [`mock`]: in-memory SDK for tests and simulation

pub mod bank;
pub mod controller;
pub mod mock;
pub mod sdk;
pub mod session;

pub use bank::CameraBank;
pub use controller::CaptureController;
pub use mock::MockCaptureSdk;
pub use sdk::{CameraEvent, CameraRef, CaptureSdk, SdkError};
pub use session::CaptureSession;
