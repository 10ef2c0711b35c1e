use crate::config::LaunchSpec;
use crate::error::LaunchError;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};

/// Platform process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId {
    fn from(pid: u32) -> Self {
        ProcessId(pid)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExitInfo {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Terminating signal (Unix only)
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// Exit status could not be collected
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Result of a process termination operation
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Signal delivered / process terminated
    Success,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// Insufficient privileges
    AccessDenied,
    /// Operation failed with specific error message
    Failed(String),
}

/// Handle to one running child.
///
/// Owned exclusively by the task that watches the process for exit.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Process ID (None once the process has been reaped)
    fn pid(&self) -> Option<ProcessId>;

    /// Command that started this process
    fn command(&self) -> &str;

    /// Wait for the process to exit
    async fn wait(&mut self) -> Result<ExitInfo>;

    /// Forcibly kill the process
    async fn kill(&mut self) -> Result<()>;
}

#[async_trait]
impl ProcessHandle for Box<dyn ProcessHandle> {
    fn pid(&self) -> Option<ProcessId> {
        (**self).pid()
    }

    fn command(&self) -> &str {
        (**self).command()
    }

    async fn wait(&mut self) -> Result<ExitInfo> {
        (**self).wait().await
    }

    async fn kill(&mut self) -> Result<()> {
        (**self).kill().await
    }
}

/// Signal-level termination, addressed by pid so the handle can stay with
/// its watcher task.
#[async_trait]
pub trait ProcessTermination: Send + Sync {
    /// Ask the process to exit (SIGTERM on Unix)
    async fn terminate_gracefully(&self, pid: ProcessId) -> TerminationResult;

    /// Kill the process outright (SIGKILL on Unix)
    async fn force_kill(&self, pid: ProcessId) -> TerminationResult;

    /// Terminate the process and every descendant, including ones that
    /// left its process group
    async fn terminate_process_tree(&self, root_pid: ProcessId) -> TerminationResult;
}

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// A started child with its standard streams detached from the handle.
pub struct LaunchedProcess {
    pub handle: Box<dyn ProcessHandle>,
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
}

impl fmt::Debug for LaunchedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchedProcess")
            .field("pid", &self.handle.pid())
            .field("command", &self.handle.command())
            .finish()
    }
}

/// Starts child processes from a [`LaunchSpec`].
///
/// Implementations own the OS specifics (process groups, pipes, signal
/// delivery). No retry happens at this layer.
#[async_trait]
pub trait Launcher: ProcessTermination + Send + Sync + 'static {
    /// Spawn one process with piped stdin/stdout/stderr
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedProcess, LaunchError>;
}

/// Compile-time selection of the platform launcher
pub trait LauncherFactory {
    type Launcher: Launcher;

    fn create_launcher() -> Self::Launcher;

    /// Platform name for logging and debugging
    fn platform_name() -> &'static str;
}
