//! Poses: a target position plus the camera actions run once it is reached.

use super::action::Action;
use super::device::Position;
use serde::{Deserialize, Serialize};

/// A move plus an ordered payload of further actions.
///
/// Downstream consumers index into the two flattenings positionally, so their
/// shapes must not change: [`Pose::actions`] skips an absent move while
/// [`Pose::sequence_actions`] always reserves slot 0 for it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    /// Move to the pose, if the pose moves at all
    #[serde(default)]
    pub position: Option<Action>,
    /// Actions run once the move completes
    #[serde(default)]
    pub payload: Vec<Action>,
}

impl Pose {
    /// Pose from an optional move and its payload.
    pub fn new(position: Option<Action>, payload: Vec<Action>) -> Self {
        Self { position, payload }
    }

    /// Pose moving `device_id` to `target` with a `G1` and no payload.
    pub fn at(device_id: u32, target: Position) -> Self {
        Self::new(Some(Action::move_to(device_id, target, false)), Vec::new())
    }

    /// Append a payload action.
    pub fn with_payload(mut self, action: Action) -> Self {
        self.payload.push(action);
        self
    }

    /// Device addressed by the move, if any.
    pub fn device_id(&self) -> Option<u32> {
        self.position.as_ref().map(Action::device_id)
    }

    /// Move (when present) followed by the payload.
    pub fn actions(&self) -> Vec<&Action> {
        self.position.iter().chain(self.payload.iter()).collect()
    }

    /// Move slot (placeholder `None` when absent) followed by the payload.
    pub fn sequence_actions(&self) -> Vec<Option<&Action>> {
        std::iter::once(self.position.as_ref())
            .chain(self.payload.iter().map(Some))
            .collect()
    }
}
