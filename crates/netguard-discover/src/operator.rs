//! Operator actions on persisted devices.

use std::fmt;

use chrono::{DateTime, Utc};
use netguard_core::{DeviceState, LifecycleState, StateTransition, TransitionOrigin};

/// An explicit state change requested by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorAction {
    Block,
    /// The only way out of `blocked`. The next cycle reclassifies the device.
    Unblock,
    MarkSafe,
}

impl OperatorAction {
    pub fn target(&self) -> LifecycleState {
        match self {
            Self::Block => LifecycleState::Blocked,
            Self::Unblock => LifecycleState::Unknown,
            Self::MarkSafe => LifecycleState::Safe,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::Block => "blocked by operator",
            Self::Unblock => "unblocked by operator",
            Self::MarkSafe => "marked safe by operator",
        }
    }
}

impl fmt::Display for OperatorAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Block => "block",
            Self::Unblock => "unblock",
            Self::MarkSafe => "mark-safe",
        };
        f.write_str(name)
    }
}

/// Apply `action` to `device`. Returns the updated record and, when the
/// state actually changed, its transition.
pub fn apply(
    action: OperatorAction,
    device: &DeviceState,
    at: DateTime<Utc>,
) -> (DeviceState, Option<StateTransition>) {
    let target = action.target();
    if device.state == target {
        return (device.clone(), None);
    }

    // Only unblock leaves `blocked`, and it does nothing anywhere else.
    let blocked = device.state == LifecycleState::Blocked;
    if blocked != (action == OperatorAction::Unblock) {
        return (device.clone(), None);
    }

    let transition = StateTransition::new(
        device,
        device.state,
        target,
        action.reason(),
        TransitionOrigin::Operator,
        at,
    );
    let mut updated = device.clone();
    updated.state = target;
    (updated, Some(transition))
}
