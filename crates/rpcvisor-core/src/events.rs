use crate::process::{ExitInfo, ProcessId};
use crate::state::SupervisorState;
use serde::Serialize;

/// Lifecycle notifications published by a supervisor.
///
/// Delivered over a broadcast channel; slow subscribers lose the oldest
/// events rather than blocking the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SupervisorEvent {
    /// A process is being started; `restart` is the crash count for automatic
    /// relaunches and `None` for an explicit launch
    Starting { restart: Option<u32> },
    /// The process passed the readiness gate
    Ready { pid: Option<ProcessId>, assumed: bool },
    /// A process exited, for whatever reason
    Exited { pid: Option<ProcessId>, exit: ExitInfo },
    /// The running process exited unexpectedly
    Crashed { exit: ExitInfo, crash_count: u32 },
    /// An automatic relaunch reached Running
    Restarted { pid: Option<ProcessId>, crash_count: u32 },
    /// The restart budget is spent; only an explicit launch recovers
    RestartsExhausted { crash_count: u32, max_restarts: u32 },
    /// The supervisor was stopped explicitly
    Stopped { previous: SupervisorState },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = SupervisorEvent::Crashed {
            exit: ExitInfo::code(1),
            crash_count: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "crashed");
        assert_eq!(json["exit"]["code"], 1);
        assert_eq!(json["crashCount"], 2);
    }
}
