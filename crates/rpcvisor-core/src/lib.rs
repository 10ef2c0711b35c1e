//! rpcvisor core - platform-independent supervision of RPC child processes
//!
//! This crate provides the configuration, error taxonomy, process traits,
//! line protocol, request correlation and the generic [`Supervisor`] that
//! platform launchers plug into.

mod config;
mod connection;
mod correlator;
mod crash;
mod discovery;
mod error;
mod events;
mod logs;
mod monitor;
mod process;
mod protocol;
mod readiness;
mod state;
mod supervisor;
mod transport;

#[cfg(test)]
mod test_support;

pub use config::*;
pub use connection::{ChildConnection, ConnectionOptions};
pub use correlator::{CallResult, CloseReason, IdSequence, PendingCall, PendingSummary, RequestCorrelator};
pub use crash::RestartBudget;
pub use discovery::{candidates_with_override, find_executable};
pub use error::*;
pub use events::SupervisorEvent;
pub use logs::{LogBuffer, LogEntry, LogFilter, StreamKind};
pub use monitor::{ExitWatch, ProcessMonitor};
pub use process::*;
pub use protocol::{Incoming, Notification, RemoteError, Request, Response, UNSPECIFIED_ERROR_CODE, parse_line};
pub use readiness::{ReadinessGate, ReadinessOutcome, ReadySignal};
pub use state::{InvalidTransition, StateCell, SupervisorState};
pub use supervisor::Supervisor;
pub use transport::{EnvelopeCodec, LineCodec, LineWriter, MAX_LINE_LENGTH, encode_request, envelope_frames, line_frames};
