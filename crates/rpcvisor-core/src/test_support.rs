//! In-memory child processes for exercising the supervisor without spawning
//! anything. Each launch wires duplex pipes to a [`FakeChild`] controller the
//! test drives by hand (or through a script).

use crate::config::LaunchSpec;
use crate::error::LaunchError;
use crate::process::{
    ExitInfo, LaunchedProcess, Launcher, ProcessHandle, ProcessId, ProcessTermination,
    TerminationResult,
};
use crate::transport::line_frames;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio_stream::StreamExt;

pub fn fake_spec() -> LaunchSpec {
    LaunchSpec::builder()
        .command("fake-companion")
        .args(["--stdio"])
        .build()
        .unwrap()
}

type Script = Box<dyn Fn(FakeChild) + Send + Sync>;

#[derive(Clone)]
pub struct FakeChild {
    pid: ProcessId,
    stdout: mpsc::UnboundedSender<String>,
    stderr: mpsc::UnboundedSender<String>,
    requests: Arc<AsyncMutex<mpsc::UnboundedReceiver<Value>>>,
    exit_tx: Arc<watch::Sender<Option<ExitInfo>>>,
}

impl FakeChild {
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn send_line(&self, line: impl Into<String>) {
        let _ = self.stdout.send(line.into());
    }

    pub fn stderr_line(&self, line: impl Into<String>) {
        let _ = self.stderr.send(line.into());
    }

    pub fn respond(&self, id: u64, result: Value) {
        self.send_line(json!({"version": "1.0", "id": id, "result": result}).to_string());
    }

    pub fn respond_error(&self, id: u64, code: i64, message: &str) {
        self.send_line(
            json!({"version": "1.0", "id": id, "error": {"code": code, "message": message}})
                .to_string(),
        );
    }

    pub fn notify(&self, method: &str) {
        self.send_line(json!({"version": "1.0", "method": method}).to_string());
    }

    /// Next request line written to the child's stdin
    pub async fn next_request(&self) -> Value {
        self.requests
            .lock()
            .await
            .recv()
            .await
            .expect("child stdin closed")
    }

    pub fn exit(&self, code: i32) {
        self.finish(ExitInfo::code(code));
    }

    pub fn exit_with_signal(&self, signal: i32) {
        self.finish(ExitInfo::signal(signal));
    }

    fn finish(&self, exit: ExitInfo) -> bool {
        self.exit_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(exit);
            true
        })
    }

    pub fn has_exited(&self) -> bool {
        self.exit_tx.borrow().is_some()
    }

    pub async fn exited(&self) -> ExitInfo {
        let mut rx = self.exit_tx.subscribe();
        let exit = rx.wait_for(Option::is_some).await.unwrap();
        exit.unwrap_or_default()
    }

    /// Answer every request with `handler(method, params)` until exit.
    /// `None` leaves the request unanswered.
    pub fn serve<F>(&self, handler: F)
    where
        F: Fn(&str, &Value) -> Option<Value> + Send + Sync + 'static,
    {
        let child = self.clone();
        tokio::spawn(async move {
            loop {
                let request = {
                    let mut requests = child.requests.lock().await;
                    match requests.recv().await {
                        Some(request) => request,
                        None => return,
                    }
                };
                let id = request["id"].as_u64().unwrap_or_default();
                let method = request["method"].as_str().unwrap_or_default().to_string();
                let params = request.get("params").cloned().unwrap_or(Value::Null);
                if let Some(result) = handler(&method, &params) {
                    child.respond(id, result);
                }
            }
        });
    }

    fn exit_watch(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit_tx.subscribe()
    }
}

/// Forwards queued lines into the pipe until the child exits, then drops the
/// pipe so the reader sees EOF.
fn spawn_output_pump(
    mut pipe: DuplexStream,
    mut lines: mpsc::UnboundedReceiver<String>,
    mut exit: watch::Receiver<Option<ExitInfo>>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                line = lines.recv() => match line {
                    Some(line) => {
                        if pipe.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                            return;
                        }
                    }
                    None => return,
                },
                _ = async { exit.wait_for(Option::is_some).await.map(|_| ()) } => break,
            }
        }
        while let Ok(line) = lines.try_recv() {
            let _ = pipe.write_all(format!("{line}\n").as_bytes()).await;
        }
    });
}

fn spawn_input_pump(
    pipe: DuplexStream,
    requests: mpsc::UnboundedSender<Value>,
    mut exit: watch::Receiver<Option<ExitInfo>>,
) {
    tokio::spawn(async move {
        let mut lines = line_frames(pipe);
        loop {
            tokio::select! {
                line = lines.next() => match line {
                    Some(Ok(line)) => {
                        let value = serde_json::from_str(&line).unwrap_or(Value::String(line));
                        let _ = requests.send(value);
                    }
                    _ => return,
                },
                _ = exit.wait_for(Option::is_some) => return,
            }
        }
    });
}

struct FakeHandle {
    pid: ProcessId,
    command: String,
    child: FakeChild,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

#[async_trait]
impl ProcessHandle for FakeHandle {
    fn pid(&self) -> Option<ProcessId> {
        Some(self.pid)
    }

    fn command(&self) -> &str {
        &self.command
    }

    async fn wait(&mut self) -> anyhow::Result<ExitInfo> {
        let exit = self.exit_rx.wait_for(Option::is_some).await?;
        Ok(exit.unwrap_or_default())
    }

    async fn kill(&mut self) -> anyhow::Result<()> {
        self.child.exit_with_signal(9);
        Ok(())
    }
}

/// Launcher whose children are [`FakeChild`] controllers
pub struct FakeLauncher {
    next_pid: AtomicU32,
    launches: AtomicUsize,
    terminations: AtomicUsize,
    tree_kills: AtomicUsize,
    ignore_sigterm: AtomicBool,
    fail_launches: AtomicBool,
    live: Mutex<HashMap<ProcessId, FakeChild>>,
    children_tx: mpsc::UnboundedSender<FakeChild>,
    children_rx: AsyncMutex<mpsc::UnboundedReceiver<FakeChild>>,
    script: Mutex<Option<Script>>,
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeLauncher {
    pub fn new() -> Self {
        let (children_tx, children_rx) = mpsc::unbounded_channel();
        Self {
            next_pid: AtomicU32::new(4000),
            launches: AtomicUsize::new(0),
            terminations: AtomicUsize::new(0),
            tree_kills: AtomicUsize::new(0),
            ignore_sigterm: AtomicBool::new(false),
            fail_launches: AtomicBool::new(false),
            live: Mutex::new(HashMap::new()),
            children_tx,
            children_rx: AsyncMutex::new(children_rx),
            script: Mutex::new(None),
        }
    }

    /// Run `script` against every child right after it is launched
    pub fn with_script<F>(self, script: F) -> Self
    where
        F: Fn(FakeChild) + Send + Sync + 'static,
    {
        *self.script.lock().unwrap() = Some(Box::new(script));
        self
    }

    pub fn ignoring_sigterm(self) -> Self {
        self.ignore_sigterm.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_fail_launches(&self, fail: bool) {
        self.fail_launches.store(fail, Ordering::SeqCst);
    }

    pub async fn next_child(&self) -> FakeChild {
        tokio::time::timeout(Duration::from_secs(5), async {
            self.children_rx.lock().await.recv().await
        })
        .await
        .expect("no child launched within 5s")
        .expect("launcher dropped")
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    pub fn tree_kills(&self) -> usize {
        self.tree_kills.load(Ordering::SeqCst)
    }

    fn child(&self, pid: ProcessId) -> Option<FakeChild> {
        self.live.lock().unwrap().get(&pid).cloned()
    }
}

#[async_trait]
impl ProcessTermination for FakeLauncher {
    async fn terminate_gracefully(&self, pid: ProcessId) -> TerminationResult {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        match self.child(pid) {
            Some(child) if !child.has_exited() => {
                if !self.ignore_sigterm.load(Ordering::SeqCst) {
                    child.exit_with_signal(15);
                }
                TerminationResult::Success
            }
            _ => TerminationResult::ProcessNotFound,
        }
    }

    async fn force_kill(&self, pid: ProcessId) -> TerminationResult {
        match self.child(pid) {
            Some(child) if !child.has_exited() => {
                child.exit_with_signal(9);
                TerminationResult::Success
            }
            _ => TerminationResult::ProcessNotFound,
        }
    }

    async fn terminate_process_tree(&self, root_pid: ProcessId) -> TerminationResult {
        self.tree_kills.fetch_add(1, Ordering::SeqCst);
        self.force_kill(root_pid).await
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedProcess, LaunchError> {
        if self.fail_launches.load(Ordering::SeqCst) {
            return Err(LaunchError::NotFound {
                candidates: vec![PathBuf::from(&spec.command)],
            });
        }
        self.launches.fetch_add(1, Ordering::SeqCst);
        let pid = ProcessId(self.next_pid.fetch_add(1, Ordering::SeqCst));

        let (stdin_parent, stdin_child) = tokio::io::duplex(64 * 1024);
        let (stdout_child, stdout_parent) = tokio::io::duplex(64 * 1024);
        let (stderr_child, stderr_parent) = tokio::io::duplex(64 * 1024);
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        let child = FakeChild {
            pid,
            stdout: stdout_tx,
            stderr: stderr_tx,
            requests: Arc::new(AsyncMutex::new(requests_rx)),
            exit_tx: Arc::new(exit_tx),
        };
        spawn_output_pump(stdout_child, stdout_rx, child.exit_watch());
        spawn_output_pump(stderr_child, stderr_rx, child.exit_watch());
        spawn_input_pump(stdin_child, requests_tx, child.exit_watch());

        self.live.lock().unwrap().insert(pid, child.clone());
        if let Some(script) = self.script.lock().unwrap().as_ref() {
            script(child.clone());
        }
        let _ = self.children_tx.send(child.clone());

        Ok(LaunchedProcess {
            handle: Box::new(FakeHandle {
                pid,
                command: spec.display_command(),
                child,
                exit_rx,
            }),
            stdin: Box::new(stdin_parent),
            stdout: Box::new(stdout_parent),
            stderr: Some(Box::new(stderr_parent)),
        })
    }
}
