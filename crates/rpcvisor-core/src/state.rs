use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of the supervised child.
///
/// ```text
/// Stopped ──launch──▶ Starting ──ready──▶ Running ──stop──▶ Stopped
///                        │                   │
///                        │ exit              │ unexpected exit
///                        ▼                   ▼
///                 Stopped / Crashed ◀──── Crashed ──relaunch──▶ Starting
/// ```
///
/// `Starting → Crashed` only happens for automatic relaunch attempts; an
/// explicit launch that never becomes ready falls back to `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SupervisorState {
    #[default]
    Stopped,
    Starting,
    Running,
    Crashed,
}

impl SupervisorState {
    pub fn can_transition_to(self, next: SupervisorState) -> bool {
        use SupervisorState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Starting, Crashed)
                | (Running, Crashed)
                | (Running, Stopped)
                | (Crashed, Starting)
                | (Crashed, Stopped)
        )
    }

    pub fn is_running(self) -> bool {
        self == SupervisorState::Running
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Stopped => "stopped",
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

/// Rejected state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid supervisor transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: SupervisorState,
    pub to: SupervisorState,
}

/// Current state plus the checked transition operation.
#[derive(Debug, Default)]
pub struct StateCell {
    current: SupervisorState,
}

impl StateCell {
    pub fn get(&self) -> SupervisorState {
        self.current
    }

    pub fn transition(&mut self, next: SupervisorState) -> Result<SupervisorState, InvalidTransition> {
        let from = self.current;
        if !from.can_transition_to(next) {
            return Err(InvalidTransition { from, to: next });
        }
        self.current = next;
        tracing::debug!(%from, to = %next, "supervisor state transition");
        Ok(from)
    }
}
