use crate::process::ExitInfo;
use crate::protocol::RemoteError;
use crate::state::{InvalidTransition, SupervisorState};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure to start a child process. Never retried by the launcher itself.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Executable not found; checked: {}", display_paths(.candidates))]
    NotFound { candidates: Vec<PathBuf> },

    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Spawned process has no {0} pipe")]
    MissingPipe(&'static str),

    #[error("Build step `{command}` failed:\n{output}")]
    Build { command: String, output: String },
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Which part of the system a failure affects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Only this call failed; retrying immediately is safe
    Call,
    /// The child died; wait for relaunch before retrying
    Process,
    /// The supervisor needs an explicit `launch`
    Supervisor,
}

/// Errors surfaced by the supervisor API
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Launch failed: {0}")]
    Launch(#[from] LaunchError),

    #[error("Process failed to become ready: {reason}{}", display_output(.output))]
    StartupFailure { reason: String, output: Vec<String> },

    #[error("Request {id} ({method}) timed out after {timeout:?}")]
    RequestTimeout {
        id: u64,
        method: String,
        timeout: Duration,
    },

    #[error("Remote error: {0}")]
    Remote(RemoteError),

    #[error("Process crashed ({exit})")]
    ProcessCrash { exit: ExitInfo },

    #[error("Supervisor is not running (state: {state})")]
    NotRunning { state: SupervisorState },

    #[error("Request cancelled: supervisor stopped")]
    Cancelled,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

fn display_output(output: &[String]) -> String {
    if output.is_empty() {
        String::new()
    } else {
        format!("\ncaptured output:\n{}", output.join("\n"))
    }
}

impl SupervisorError {
    pub fn scope(&self) -> ErrorScope {
        match self {
            SupervisorError::RequestTimeout { .. }
            | SupervisorError::Remote(_)
            | SupervisorError::Transport(_) => ErrorScope::Call,
            SupervisorError::ProcessCrash { .. } => ErrorScope::Process,
            SupervisorError::NotRunning { state } if *state == SupervisorState::Starting => {
                ErrorScope::Process
            }
            _ => ErrorScope::Supervisor,
        }
    }

    /// Check if this error is retryable without caller intervention
    pub fn is_retryable(&self) -> bool {
        matches!(self.scope(), ErrorScope::Call | ErrorScope::Process)
            && !matches!(self, SupervisorError::Remote(_))
    }

    /// Check if this error indicates a permanent failure
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            SupervisorError::Configuration(_)
                | SupervisorError::Launch(LaunchError::NotFound { .. })
                | SupervisorError::Launch(LaunchError::Build { .. })
        )
    }
}
