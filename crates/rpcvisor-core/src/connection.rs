use crate::correlator::{CallResult, CloseReason, IdSequence, RequestCorrelator};
use crate::error::SupervisorError;
use crate::logs::{LogBuffer, StreamKind};
use crate::monitor::{ExitWatch, ProcessMonitor};
use crate::process::{BoxedReader, ExitInfo, LaunchedProcess, ProcessId, ProcessTermination};
use crate::protocol::{Incoming, Request};
use crate::readiness::ReadySignal;
use crate::transport::{LineWriter, envelope_frames, line_frames};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

/// Upper bound on waiting for the output readers to hit EOF after exit.
/// Descendants that inherited the pipes can keep them open indefinitely.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Extra time granted after the grace period for the forced kill to land
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Per-launch wiring options
#[derive(Clone)]
pub struct ConnectionOptions {
    pub incarnation: u64,
    pub protocol_version: String,
    pub ids: IdSequence,
    /// Notification method that marks the child ready
    pub ready_notification: Option<String>,
    /// Output substring that marks the child ready
    pub ready_marker: Option<String>,
    pub logs: Arc<LogBuffer>,
}

/// Everything bound to one running child: the stdin writer, the output
/// readers, the correlator and the exit monitor.
///
/// A relaunch creates a fresh connection; nothing is carried over except the
/// id sequence.
pub struct ChildConnection {
    incarnation: u64,
    pid: Option<ProcessId>,
    command: String,
    protocol_version: String,
    started_at: SystemTime,
    writer: LineWriter,
    correlator: Arc<RequestCorrelator>,
    ready: ReadySignal,
    monitor: ProcessMonitor,
}

impl ChildConnection {
    pub fn start<T>(process: LaunchedProcess, terminator: Arc<T>, options: ConnectionOptions) -> Self
    where
        T: ProcessTermination + ?Sized + 'static,
    {
        let started_at = SystemTime::now();
        let LaunchedProcess {
            handle,
            stdin,
            stdout,
            stderr,
        } = process;
        let pid = handle.pid();
        let command = handle.command().to_string();

        let correlator = RequestCorrelator::new(options.ids.clone());
        let ready = ReadySignal::new();

        let stdout_task = spawn_stdout_reader(stdout, correlator.clone(), ready.clone(), &options);
        let stderr_task = stderr.map(|stderr| spawn_stderr_reader(stderr, ready.clone(), &options));

        let exit_correlator = correlator.clone();
        let monitor = ProcessMonitor::spawn(handle, terminator, move |exit, intentional| async move {
            drain(stdout_task).await;
            if let Some(task) = stderr_task {
                drain(task).await;
            }

            let reason = if intentional {
                CloseReason::Stopped
            } else {
                CloseReason::Crashed(exit)
            };
            let rejected = exit_correlator.fail_all(reason);
            if rejected > 0 {
                warn!(rejected, %exit, "rejected outstanding requests after process exit");
            }
        });

        info!(pid = ?pid.map(|p| p.0), incarnation = options.incarnation, %command, "process connected");

        Self {
            incarnation: options.incarnation,
            pid,
            command,
            protocol_version: options.protocol_version,
            started_at,
            writer: LineWriter::new(stdin),
            correlator,
            ready,
            monitor,
        }
    }

    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }

    pub fn pid(&self) -> Option<ProcessId> {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    pub fn ready(&self) -> &ReadySignal {
        &self.ready
    }

    pub fn correlator(&self) -> &Arc<RequestCorrelator> {
        &self.correlator
    }

    pub fn exit_watch(&self) -> ExitWatch {
        self.monitor.exit_watch()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.monitor.exit_info()
    }

    pub fn has_exited(&self) -> bool {
        self.monitor.has_exited()
    }

    pub async fn exited(&self) -> ExitInfo {
        self.monitor.exited().await
    }

    /// Issue one request and wait for its completion
    pub async fn call(&self, method: &str, params: Option<Value>, timeout: Duration) -> CallResult {
        let pending = self.correlator.issue(method, timeout)?;
        let id = pending.id();
        let request = Request::new(self.protocol_version.as_str(), id, method, params);

        debug!(pid = ?self.pid.map(|p| p.0), id, method, "sending request");
        match self.writer.send(&request).await {
            Ok(()) => pending.wait().await,
            // the child is going away; exit handling will reject the call
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                debug!(id, method, "stdin closed while sending request");
                pending.wait().await
            }
            Err(e) => match self.correlator.close_reason() {
                Some(reason) => Err(reason.to_error()),
                None => Err(SupervisorError::Transport(format!(
                    "failed to write request {id} ({method}): {e}"
                ))),
            },
        }
    }

    /// Cancel outstanding calls, then terminate the child and wait for it.
    ///
    /// Returns `None` if the child could not be confirmed dead.
    pub async fn shutdown(&self, grace: Duration) -> Option<ExitInfo> {
        let cancelled = self.correlator.fail_all(CloseReason::Stopped);
        if cancelled > 0 {
            debug!(cancelled, "cancelled outstanding requests for shutdown");
        }
        self.monitor.stop(grace);

        match tokio::time::timeout(grace + KILL_WAIT, self.monitor.exited()).await {
            Ok(exit) => Some(exit),
            Err(_) => {
                warn!(pid = ?self.pid.map(|p| p.0), "process did not exit after kill");
                None
            }
        }
    }
}

async fn drain(mut task: JoinHandle<()>) {
    if tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await.is_err() {
        debug!("output reader still open after exit, abandoning it");
        task.abort();
    }
}

fn marker_hit(marker: Option<&str>, line: &str) -> bool {
    marker.is_some_and(|marker| line.contains(marker))
}

fn spawn_stdout_reader(
    stdout: BoxedReader,
    correlator: Arc<RequestCorrelator>,
    ready: ReadySignal,
    options: &ConnectionOptions,
) -> JoinHandle<()> {
    let logs = options.logs.clone();
    let ready_notification = options.ready_notification.clone();
    let ready_marker = options.ready_marker.clone();

    tokio::spawn(async move {
        let mut frames = envelope_frames(stdout);
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(Incoming::Response(response)) => {
                    correlator.complete(response);
                }
                Ok(Incoming::Notification(notification)) => {
                    debug!(method = %notification.method, "notification received");
                    if ready_notification.as_deref() == Some(notification.method.as_str()) && ready.fire() {
                        info!(method = %notification.method, "ready notification received");
                    }
                    let text = json!({"method": notification.method, "params": notification.params});
                    logs.push(StreamKind::Stdout, text.to_string());
                }
                Ok(Incoming::Log(line)) => {
                    debug!(stream = "stdout", "{line}");
                    if marker_hit(ready_marker.as_deref(), &line) && ready.fire() {
                        info!("ready marker seen on stdout");
                    }
                    logs.push(StreamKind::Stdout, line);
                }
                Err(e) => {
                    warn!(error = %e, "stdout read failed");
                    break;
                }
            }
        }
        debug!("stdout closed");
    })
}

fn spawn_stderr_reader(stderr: BoxedReader, ready: ReadySignal, options: &ConnectionOptions) -> JoinHandle<()> {
    let logs = options.logs.clone();
    let ready_marker = options.ready_marker.clone();

    tokio::spawn(async move {
        let mut lines = line_frames(stderr);
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) => {
                    debug!(stream = "stderr", "{line}");
                    if marker_hit(ready_marker.as_deref(), &line) && ready.fire() {
                        info!("ready marker seen on stderr");
                    }
                    logs.push(StreamKind::Stderr, line);
                }
                Err(e) => {
                    warn!(error = %e, "stderr read failed");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::LogFilter;
    use crate::process::Launcher;
    use crate::test_support::{FakeLauncher, fake_spec};

    fn options(logs: Arc<LogBuffer>) -> ConnectionOptions {
        ConnectionOptions {
            incarnation: 1,
            protocol_version: "1.0".to_string(),
            ids: IdSequence::default(),
            ready_notification: Some("ready".to_string()),
            ready_marker: Some("listening".to_string()),
            logs,
        }
    }

    async fn connect() -> (Arc<FakeLauncher>, ChildConnection, Arc<LogBuffer>) {
        let launcher = Arc::new(FakeLauncher::new());
        let process = launcher.launch(&fake_spec()).await.unwrap();
        let logs = Arc::new(LogBuffer::new(100));
        let connection = ChildConnection::start(process, launcher.clone(), options(logs.clone()));
        (launcher, connection, logs)
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let (launcher, connection, _) = connect().await;
        let child = launcher.next_child().await;

        let responder = tokio::spawn(async move {
            let request = child.next_request().await;
            assert_eq!(request["method"], "ping");
            assert_eq!(request["version"], "1.0");
            child.respond(request["id"].as_u64().unwrap(), json!({"status": "ok"}));
        });

        let result = connection
            .call("ping", None, Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(result, json!({"status": "ok"}));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_crash_rejects_outstanding_calls() {
        let (launcher, connection, _) = connect().await;
        let child = launcher.next_child().await;
        let connection = Arc::new(connection);

        let mut calls = Vec::new();
        for _ in 0..3 {
            let connection = connection.clone();
            calls.push(tokio::spawn(async move {
                connection.call("work", None, Duration::from_secs(5)).await
            }));
        }
        for _ in 0..3 {
            child.next_request().await;
        }
        child.exit(1);

        for call in calls {
            match call.await.unwrap() {
                Err(SupervisorError::ProcessCrash { exit }) => assert_eq!(exit, ExitInfo::code(1)),
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert_eq!(connection.correlator().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_response_written_before_exit_is_delivered() {
        let (launcher, connection, _) = connect().await;
        let child = launcher.next_child().await;

        let responder = tokio::spawn(async move {
            let request = child.next_request().await;
            child.respond(request["id"].as_u64().unwrap(), json!("last words"));
            child.exit(0);
        });

        let result = connection.call("bye", None, Duration::from_secs(1)).await;
        assert_eq!(result.unwrap(), json!("last words"));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending() {
        let (launcher, connection, _) = connect().await;
        let child = launcher.next_child().await;
        let connection = Arc::new(connection);

        let pending = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.call("slow", None, Duration::from_secs(5)).await })
        };
        child.next_request().await;

        let exit = connection.shutdown(Duration::from_millis(200)).await;
        assert_eq!(exit, Some(ExitInfo::signal(15)));
        assert!(matches!(pending.await.unwrap(), Err(SupervisorError::Cancelled)));
        assert!(matches!(
            connection.call("late", None, Duration::from_secs(1)).await,
            Err(SupervisorError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_escalates_to_kill() {
        let launcher = Arc::new(FakeLauncher::new().ignoring_sigterm());
        let process = launcher.launch(&fake_spec()).await.unwrap();
        let connection = ChildConnection::start(process, launcher.clone(), options(Arc::new(LogBuffer::new(10))));

        let exit = connection.shutdown(Duration::from_millis(50)).await;
        assert_eq!(exit, Some(ExitInfo::signal(9)));
    }

    #[tokio::test]
    async fn test_logs_and_ready_marker() {
        let (launcher, connection, logs) = connect().await;
        let child = launcher.next_child().await;

        child.send_line("booting");
        child.stderr_line("listening on 8100");
        tokio::time::timeout(Duration::from_secs(1), connection.ready().fired())
            .await
            .unwrap();

        child.exit(0);
        connection.exited().await;
        let stdout = logs.query(&LogFilter::default().stream(StreamKind::Stdout));
        assert_eq!(stdout[0].text, "booting");
        let stderr = logs.query(&LogFilter::default().stream(StreamKind::Stderr));
        assert_eq!(stderr[0].text, "listening on 8100");
    }

    #[tokio::test]
    async fn test_ready_notification() {
        let (launcher, connection, _) = connect().await;
        let child = launcher.next_child().await;
        assert!(!connection.ready().is_fired());
        child.notify("ready");
        tokio::time::timeout(Duration::from_secs(1), connection.ready().fired())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unsolicited_response_has_no_effect() {
        let (launcher, connection, logs) = connect().await;
        let child = launcher.next_child().await;
        let connection = Arc::new(connection);

        let pending = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.call("echo", None, Duration::from_secs(1)).await })
        };
        let request = child.next_request().await;
        let id = request["id"].as_u64().unwrap();

        child.respond(id + 100, json!("stray"));
        child.respond(id, json!("mine"));

        assert_eq!(pending.await.unwrap().unwrap(), json!("mine"));
        assert_eq!(connection.correlator().pending_count(), 0);
        assert!(logs.is_empty());
    }
}
