use anyhow::Result;
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid as NixPid;
use rpcvisor_core::{
    ExitInfo, LaunchError, LaunchSpec, LaunchedProcess, Launcher, LauncherFactory, ProcessHandle,
    ProcessId, ProcessTermination, TerminationResult,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use sysinfo::System;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Time descendants get between SIGTERM and SIGKILL during tree termination
const TREE_GRACE: Duration = Duration::from_millis(500);

type ActiveProcesses = Arc<Mutex<HashMap<ProcessId, String>>>;

fn lock(active: &ActiveProcesses) -> MutexGuard<'_, HashMap<ProcessId, String>> {
    active.lock().unwrap_or_else(PoisonError::into_inner)
}

fn nix_pid(pid: ProcessId) -> NixPid {
    NixPid::from_raw(pid.0 as i32)
}

/// Unix process handle backed by a tokio [`Child`]
pub struct UnixProcessHandle {
    child: Child,
    pid: Option<ProcessId>,
    command: String,
    active: ActiveProcesses,
}

impl UnixProcessHandle {
    fn untrack(&self) {
        if let Some(pid) = self.pid {
            lock(&self.active).remove(&pid);
        }
    }
}

#[async_trait]
impl ProcessHandle for UnixProcessHandle {
    fn pid(&self) -> Option<ProcessId> {
        self.child.id().map(ProcessId::from)
    }

    fn command(&self) -> &str {
        &self.command
    }

    async fn wait(&mut self) -> Result<ExitInfo> {
        let status = self.child.wait().await?;
        self.untrack();
        Ok(ExitInfo::from(status))
    }

    async fn kill(&mut self) -> Result<()> {
        self.child
            .kill()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to kill process: {}", e))
    }
}

/// Spawns children in their own process group with piped stdio.
///
/// Every child is tracked until it is reaped, so `Drop` can terminate
/// whatever is still alive.
pub struct UnixLauncher {
    system: Mutex<System>,
    active_processes: ActiveProcesses,
}

impl Default for UnixLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl UnixLauncher {
    pub fn new() -> Self {
        info!("Initializing Unix launcher with system monitoring");
        Self {
            system: Mutex::new(System::new()),
            active_processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Pids of launched children that have not been reaped yet
    pub fn active_processes(&self) -> Vec<ProcessId> {
        let mut pids: Vec<ProcessId> = lock(&self.active_processes).keys().copied().collect();
        pids.sort();
        pids
    }

    /// All descendants of `parent`, deepest first
    pub fn descendants(&self, parent: ProcessId) -> Vec<ProcessId> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::All,
            true,
            sysinfo::ProcessRefreshKind::default(),
        );

        let mut children = Vec::new();
        Self::find_children_recursive(&system, parent.0, &mut children);
        children.into_iter().map(ProcessId::from).collect()
    }

    fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
        for (pid, process) in system.processes() {
            if process.parent().is_some_and(|ppid| ppid.as_u32() == parent_pid) {
                let child_pid = pid.as_u32();
                // grandchildren first
                Self::find_children_recursive(system, child_pid, result);
                result.push(child_pid);
            }
        }
    }

    /// Signal the process group led by `pid`, falling back to the process
    /// alone when it no longer leads a group
    fn signal_group(pid: ProcessId, sig: Signal) -> TerminationResult {
        let result = match signal::killpg(nix_pid(pid), sig) {
            Err(Errno::ESRCH) => signal::kill(nix_pid(pid), sig),
            other => other,
        };
        match result {
            Ok(()) => {
                debug!(pid = pid.0, signal = %sig, "signal delivered");
                TerminationResult::Success
            }
            Err(Errno::ESRCH) => {
                debug!(pid = pid.0, "process not found (already terminated)");
                TerminationResult::ProcessNotFound
            }
            Err(Errno::EPERM) => {
                warn!(pid = pid.0, "permission denied to signal process");
                TerminationResult::AccessDenied
            }
            Err(e) => {
                warn!(pid = pid.0, signal = %sig, error = %e, "failed to signal process");
                TerminationResult::Failed(format!("{sig} failed: {e}"))
            }
        }
    }

    fn signal_single(pid: ProcessId, sig: Signal) -> TerminationResult {
        match signal::kill(nix_pid(pid), sig) {
            Ok(()) => TerminationResult::Success,
            Err(Errno::ESRCH) => TerminationResult::ProcessNotFound,
            Err(Errno::EPERM) => TerminationResult::AccessDenied,
            Err(e) => TerminationResult::Failed(format!("{sig} failed: {e}")),
        }
    }
}

#[async_trait]
impl ProcessTermination for UnixLauncher {
    async fn terminate_gracefully(&self, pid: ProcessId) -> TerminationResult {
        let result = Self::signal_group(pid, Signal::SIGTERM);
        if result == TerminationResult::Success {
            info!(pid = pid.0, "Sent SIGTERM to process group");
        }
        result
    }

    async fn force_kill(&self, pid: ProcessId) -> TerminationResult {
        let result = Self::signal_group(pid, Signal::SIGKILL);
        if result == TerminationResult::Success {
            info!(pid = pid.0, "Sent SIGKILL to process group");
        }
        result
    }

    async fn terminate_process_tree(&self, root_pid: ProcessId) -> TerminationResult {
        let descendants = self.descendants(root_pid);
        info!(
            pid = root_pid.0,
            descendants = descendants.len(),
            "Terminating process tree"
        );

        // bottom-up so parents cannot respawn what was just killed
        for pid in &descendants {
            Self::signal_single(*pid, Signal::SIGTERM);
        }
        let root = Self::signal_group(root_pid, Signal::SIGTERM);
        if root == TerminationResult::ProcessNotFound && descendants.is_empty() {
            return root;
        }

        tokio::time::sleep(TREE_GRACE).await;

        for pid in &descendants {
            match Self::signal_single(*pid, Signal::SIGKILL) {
                TerminationResult::Success | TerminationResult::ProcessNotFound => {}
                result => warn!(pid = pid.0, ?result, "failed to kill descendant"),
            }
        }
        match Self::signal_group(root_pid, Signal::SIGKILL) {
            TerminationResult::ProcessNotFound => TerminationResult::Success,
            result => result,
        }
    }
}

#[async_trait]
impl Launcher for UnixLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedProcess, LaunchError> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &spec.working_directory {
            cmd.current_dir(dir);
        }

        // own process group, so signals reach everything the child forks
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                LaunchError::NotFound {
                    candidates: vec![PathBuf::from(&spec.command)],
                }
            } else {
                LaunchError::Spawn {
                    command: spec.display_command(),
                    source,
                }
            }
        })?;

        let stdin = child.stdin.take().ok_or(LaunchError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(LaunchError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take();

        let pid = child.id().map(ProcessId::from);
        let command = spec.display_command();
        if let Some(pid) = pid {
            info!(pid = pid.0, %command, "Spawned Unix process");
            lock(&self.active_processes).insert(pid, command.clone());
        }

        Ok(LaunchedProcess {
            handle: Box::new(UnixProcessHandle {
                child,
                pid,
                command,
                active: self.active_processes.clone(),
            }),
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: stderr.map(|stderr| Box::new(stderr) as _),
        })
    }
}

impl Drop for UnixLauncher {
    fn drop(&mut self) {
        let active = self.active_processes();
        if active.is_empty() {
            return;
        }

        warn!(
            count = active.len(),
            "Emergency cleanup: terminating processes during drop"
        );
        for pid in active {
            match Self::signal_group(pid, Signal::SIGTERM) {
                TerminationResult::Success | TerminationResult::ProcessNotFound => {}
                result => {
                    warn!(pid = pid.0, ?result, "SIGTERM failed during drop, sending SIGKILL");
                    Self::signal_group(pid, Signal::SIGKILL);
                }
            }
        }
    }
}

/// Compile-time launcher selection for Unix targets
pub struct UnixLauncherFactory;

impl LauncherFactory for UnixLauncherFactory {
    type Launcher = UnixLauncher;

    fn create_launcher() -> Self::Launcher {
        UnixLauncher::new()
    }

    fn platform_name() -> &'static str {
        "unix"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::time::timeout;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_target(false)
            .with_line_number(true)
            .try_init();
    }

    fn is_running(pid: ProcessId) -> bool {
        let mut system = System::new();
        let pid = sysinfo::Pid::from_u32(pid.0);
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
        system
            .process(pid)
            .is_some_and(|p| p.status() != sysinfo::ProcessStatus::Zombie)
    }

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec::builder()
            .command("sh")
            .args(["-c", script])
            .build()
            .expect("valid spec")
    }

    #[tokio::test]
    async fn test_launch_pipes_stdio() {
        init_tracing();
        let launcher = UnixLauncher::new();
        let spec = sh("read line; echo \"got $line\"; echo oops >&2; exit 3");
        let mut process = launcher.launch(&spec).await.expect("launch");
        let pid = process.handle.pid().expect("pid");
        assert_eq!(launcher.active_processes(), vec![pid]);

        process.stdin.write_all(b"ping\n").await.expect("write");
        let mut stdout = BufReader::new(process.stdout).lines();
        let line = stdout.next_line().await.expect("read").expect("line");
        assert_eq!(line, "got ping");

        let mut stderr = BufReader::new(process.stderr.expect("stderr")).lines();
        let line = stderr.next_line().await.expect("read").expect("line");
        assert_eq!(line, "oops");

        let exit = process.handle.wait().await.expect("wait");
        assert_eq!(exit, ExitInfo::code(3));
        assert!(launcher.active_processes().is_empty());
    }

    #[tokio::test]
    async fn test_environment_and_working_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let launcher = UnixLauncher::new();
        let spec = LaunchSpec::builder()
            .command("sh")
            .args(["-c", "echo \"$GREETING $(pwd)\""])
            .env("GREETING", "hello")
            .working_directory(dir.path().to_path_buf())
            .build()
            .expect("valid spec");

        let mut process = launcher.launch(&spec).await.expect("launch");
        let mut stdout = BufReader::new(process.stdout).lines();
        let line = stdout.next_line().await.expect("read").expect("line");
        let expected = dir.path().canonicalize().expect("canonical");
        assert_eq!(line, format!("hello {}", expected.display()));
        process.handle.wait().await.expect("wait");
    }

    #[tokio::test]
    async fn test_missing_executable_is_not_found() {
        let launcher = UnixLauncher::new();
        let spec = LaunchSpec::builder()
            .command("/nonexistent/rpcvisor-child")
            .build()
            .expect("valid spec");

        let err = launcher.launch(&spec).await.expect_err("should fail");
        assert!(matches!(err, LaunchError::NotFound { .. }), "{err}");
        assert!(launcher.active_processes().is_empty());
    }

    #[tokio::test]
    async fn test_graceful_termination_delivers_sigterm() {
        let launcher = UnixLauncher::new();
        let mut process = launcher.launch(&sh("exec sleep 30")).await.expect("launch");
        let pid = process.handle.pid().expect("pid");

        assert_eq!(
            launcher.terminate_gracefully(pid).await,
            TerminationResult::Success
        );
        let exit = timeout(Duration::from_secs(5), process.handle.wait())
            .await
            .expect("exited")
            .expect("wait");
        assert_eq!(exit.signal, Some(Signal::SIGTERM as i32));
    }

    #[tokio::test]
    async fn test_force_kill_ignores_trap() {
        let launcher = UnixLauncher::new();
        let spec = sh("trap '' TERM; echo armed; while true; do sleep 1; done");
        let mut process = launcher.launch(&spec).await.expect("launch");
        let pid = process.handle.pid().expect("pid");

        let mut stdout = BufReader::new(process.stdout).lines();
        stdout.next_line().await.expect("read").expect("armed");

        launcher.terminate_gracefully(pid).await;
        let still_running = timeout(Duration::from_millis(300), process.handle.wait()).await;
        assert!(still_running.is_err(), "SIGTERM should be ignored");

        assert_eq!(launcher.force_kill(pid).await, TerminationResult::Success);
        let exit = timeout(Duration::from_secs(5), process.handle.wait())
            .await
            .expect("exited")
            .expect("wait");
        assert_eq!(exit.signal, Some(Signal::SIGKILL as i32));
    }

    #[tokio::test]
    async fn test_signal_after_exit_reports_not_found() {
        let launcher = UnixLauncher::new();
        let mut process = launcher.launch(&sh("exit 0")).await.expect("launch");
        let pid = process.handle.pid().expect("pid");
        process.handle.wait().await.expect("wait");

        assert_eq!(
            launcher.terminate_gracefully(pid).await,
            TerminationResult::ProcessNotFound
        );
    }

    #[tokio::test]
    async fn test_process_tree_termination() {
        init_tracing();
        let launcher = UnixLauncher::new();
        let spec = sh("sleep 30 & sleep 30 & echo started; wait");
        let mut process = launcher.launch(&spec).await.expect("launch");
        let pid = process.handle.pid().expect("pid");

        let mut stdout = BufReader::new(process.stdout).lines();
        stdout.next_line().await.expect("read").expect("started");
        let descendants = launcher.descendants(pid);
        assert!(descendants.len() >= 2);

        assert_eq!(
            launcher.terminate_process_tree(pid).await,
            TerminationResult::Success
        );
        // sh may exit 0 once its children die, so only require that it exited
        timeout(Duration::from_secs(5), process.handle.wait())
            .await
            .expect("exited")
            .expect("wait");
        for descendant in descendants {
            assert!(!is_running(descendant), "{descendant} survived");
        }
    }

    #[test]
    fn test_factory_platform_name() {
        assert_eq!(UnixLauncherFactory::platform_name(), "unix");
        let launcher = UnixLauncherFactory::create_launcher();
        assert!(launcher.active_processes().is_empty());
    }
}
