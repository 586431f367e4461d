//! # Rig Control Core Library
//!
//! Device orchestration for a motorized photogrammetry camera rig: serial
//! positioners and shutter controllers on half-duplex links, plus cameras driven
//! through a vendor remote-capture SDK.
//!
//! ## Crate Structure
//!
//! - **`model`**: `Device`, `Position`, `Action` and `Pose` value types.
//! - **`protocol`**: wire formatting of actions and parsing of device replies.
//! - **`compiler`**: turns poses into the ordered action stream and routes it to transports.
//! - **`adapters`**: the `Transport` capability with serial, mock and simulated implementations.
//! - **`pipeline`**: side-queue, clear-to-send handshake and the steady-state sender.
//! - **`machine`**: the machine readiness state machine over the device table.
//! - **`listener`**: one read thread per open port feeding the state machine.
//! - **`runner`**: homing and imaging run controllers with pause, resume and cancel.
//! - **`capture`**: remote-capture sessions over the vendor SDK.
//! - **`orchestrator`**: composes all of the above behind connect / run / disconnect.
//! - **`config`**, **`logging`**, **`notify`**, **`error`**: ambient configuration,
//!   tracing setup, the notification interface and the crate error type.

pub mod adapters;
pub mod capture;
pub mod compiler;
pub mod config;
pub mod error;
pub mod listener;
pub mod logging;
pub mod machine;
pub mod model;
pub mod notify;
pub mod orchestrator;
pub mod pipeline;
pub mod protocol;
pub mod runner;
pub mod worker;

pub use error::{AppResult, RigError};
pub use orchestrator::Orchestrator;
