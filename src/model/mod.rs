//! Command/pose model.
//!
//! Value types shared by every layer: devices and their parsed replies, the
//! wire-level [`Action`], and the [`Pose`] that bundles a move with its payload.

pub mod action;
pub mod device;
pub mod pose;

pub use action::{Action, ActionKind};
pub use device::{Device, DeviceKind, Position, SerialResponse, AXES, POSITION_TOLERANCE};
pub use pose::Pose;
