use super::error::HttpError;
use super::health::HealthProber;
use super::port::PortAllocator;
use super::session::SessionManager;
use derive_builder::Builder;
use reqwest::Method;
use rpcvisor_core::{
    BoxedReader, BoxedWriter, LaunchSpec, Launcher, LogBuffer, LogEntry, LogFilter,
    ProcessMonitor, StateCell, StreamKind, SupervisorError, SupervisorState, line_frames,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

/// Placeholder in args and env values replaced with the allocated port
pub const PORT_PLACEHOLDER: &str = "{port}";

const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Settings for a server process that speaks HTTP
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate_builder"))]
#[serde(rename_all = "camelCase")]
pub struct HttpSupervisorConfig {
    #[builder(default = "String::from(\"127.0.0.1\")")]
    pub host: String,
    #[builder(default = "8100..=8199")]
    pub port_range: RangeInclusive<u16>,
    #[builder(default = "String::from(\"/status\")")]
    pub status_path: String,
    #[builder(default = "250")]
    pub probe_interval_ms: u64,
    #[builder(default = "1_000")]
    pub probe_timeout_ms: u64,
    #[builder(default = "60_000")]
    pub startup_timeout_ms: u64,
    /// Sent as `{"capabilities": ...}` when creating a session
    #[builder(default = "Value::Object(Default::default())")]
    pub capabilities: Value,
    #[builder(default = "30_000")]
    pub request_timeout_ms: u64,
    #[builder(default = "3_000")]
    pub stop_grace_ms: u64,
    #[builder(default = "1_000")]
    pub log_capacity: usize,
}

impl HttpSupervisorConfigBuilder {
    fn validate_builder(&self) -> Result<(), String> {
        if let Some(range) = &self.port_range {
            if range.is_empty() {
                return Err(format!("empty port range {range:?}"));
            }
        }
        Ok(())
    }
}

impl HttpSupervisorConfig {
    pub fn builder() -> HttpSupervisorConfigBuilder {
        HttpSupervisorConfigBuilder::default()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port_range.is_empty() {
            return Err(anyhow::anyhow!("port_range must not be empty"));
        }
        if self.probe_interval_ms == 0 || self.probe_timeout_ms == 0 {
            return Err(anyhow::anyhow!("probe interval and timeout must be greater than zero"));
        }
        if self.startup_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err(anyhow::anyhow!("startup and request timeouts must be greater than zero"));
        }
        if self.log_capacity == 0 {
            return Err(anyhow::anyhow!("log_capacity must be greater than zero"));
        }
        if !self.status_path.starts_with('/') {
            return Err(anyhow::anyhow!("status_path must start with '/'"));
        }
        Ok(())
    }

    fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

struct Server {
    port: u16,
    monitor: ProcessMonitor,
    sessions: SessionManager,
    // held open so the child never sees EOF on stdin
    _stdin: Mutex<BoxedWriter>,
}

#[derive(Default)]
struct Core {
    state: StateCell,
    spec: Option<LaunchSpec>,
    server: Option<Arc<Server>>,
}

/// Supervises a server process reached over HTTP.
///
/// There is no automatic restart: an exited server is noticed on the next
/// call and `ensure_running` relaunches it from the retained spec.
pub struct HttpSupervisor<L: Launcher> {
    config: HttpSupervisorConfig,
    launcher: Arc<L>,
    client: reqwest::Client,
    ports: PortAllocator,
    logs: Arc<LogBuffer>,
    control: tokio::sync::Mutex<()>,
    core: Mutex<Core>,
}

impl<L: Launcher> HttpSupervisor<L> {
    pub fn new(config: HttpSupervisorConfig, launcher: L) -> Result<Self, HttpError> {
        config
            .validate()
            .map_err(|e| SupervisorError::Configuration(format!("Invalid HTTP config: {e}")))?;
        // the server is local; never route it through a system proxy
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(HttpError::Request)?;

        Ok(Self {
            ports: PortAllocator::new(config.host.clone(), config.port_range.clone()),
            logs: Arc::new(LogBuffer::new(config.log_capacity)),
            config,
            launcher: Arc::new(launcher),
            client,
            control: tokio::sync::Mutex::new(()),
            core: Mutex::new(Core::default()),
        })
    }

    pub fn config(&self) -> &HttpSupervisorConfig {
        &self.config
    }

    /// Start the server and wait until its status endpoint is healthy.
    /// Returns the port it was started on.
    pub async fn launch(&self, spec: LaunchSpec) -> Result<u16, HttpError> {
        let _control = self.control.lock().await;
        self.shutdown_current().await;
        self.start(spec).await
    }

    /// Delete the session, then terminate the server
    pub async fn stop(&self) {
        let _control = self.control.lock().await;
        self.shutdown_current().await;
    }

    /// Relaunch from the last spec if the server has exited
    pub async fn ensure_running(&self) -> Result<u16, HttpError> {
        let _control = self.control.lock().await;
        if let Ok(server) = self.running_server() {
            return Ok(server.port);
        }
        let spec = self.core().spec.clone();
        let spec = spec.ok_or_else(|| SupervisorError::NotRunning {
            state: self.state(),
        })?;
        info!("server not running, relaunching");
        self.shutdown_current().await;
        self.start(spec).await
    }

    /// Send `method /session/{id}/{path}` on a verified session.
    ///
    /// A request rejected with `invalid session id` is retried once on a new
    /// session.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, HttpError> {
        let server = self.running_server()?;
        match server.sessions.request(method.clone(), path, body.clone()).await {
            Err(e) if e.is_invalid_session() => {
                warn!(path, "session invalidated by server, retrying on a new session");
                server.sessions.invalidate().await;
                server.sessions.request(method, path, body).await
            }
            result => result,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running_server().is_ok()
    }

    pub fn state(&self) -> SupervisorState {
        self.reconcile().state.get()
    }

    pub fn port(&self) -> Option<u16> {
        self.running_server().ok().map(|s| s.port)
    }

    pub fn base_url(&self) -> Option<String> {
        self.running_server()
            .ok()
            .map(|s| s.sessions.base_url().to_owned())
    }

    pub async fn session_id(&self) -> Option<String> {
        let server = self.running_server().ok()?;
        server.sessions.session_id().await
    }

    pub fn launch_spec(&self) -> Option<LaunchSpec> {
        self.core().spec.clone()
    }

    pub fn logs(&self, filter: &LogFilter) -> Vec<LogEntry> {
        self.logs.query(filter)
    }

    fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move Running to Crashed once the server process is seen to be gone
    fn reconcile(&self) -> MutexGuard<'_, Core> {
        let mut core = self.core();
        let exited = core
            .server
            .as_ref()
            .and_then(|server| server.monitor.exit_info());
        if let Some(exit) = exited {
            if core.state.get() == SupervisorState::Running {
                warn!(%exit, "server process exited");
                core.server = None;
                if let Err(e) = core.state.transition(SupervisorState::Crashed) {
                    warn!(error = %e, "cannot record server exit");
                }
            }
        }
        core
    }

    fn running_server(&self) -> Result<Arc<Server>, SupervisorError> {
        let core = self.reconcile();
        match (&core.server, core.state.get()) {
            (Some(server), SupervisorState::Running) => Ok(server.clone()),
            (_, state) => Err(SupervisorError::NotRunning { state }),
        }
    }

    fn settle(&self, state: SupervisorState) {
        if let Err(e) = self.core().state.transition(state) {
            warn!(error = %e, "unexpected state while settling");
        }
    }

    async fn shutdown_current(&self) {
        let server = {
            let mut core = self.core();
            let server = core.server.take();
            if matches!(
                core.state.get(),
                SupervisorState::Running | SupervisorState::Crashed
            ) {
                if let Err(e) = core.state.transition(SupervisorState::Stopped) {
                    warn!(error = %e, "cannot record stop");
                }
            }
            server
        };

        let Some(server) = server else {
            return;
        };
        if !server.monitor.has_exited() {
            server.sessions.close().await;
        }
        let grace = self.config.stop_grace();
        server.monitor.stop(grace);
        if tokio::time::timeout(grace + KILL_WAIT, server.monitor.exited())
            .await
            .is_err()
        {
            warn!(port = server.port, "server did not exit after kill");
        }
        info!(port = server.port, "server stopped");
    }

    async fn start(&self, spec: LaunchSpec) -> Result<u16, HttpError> {
        self.core()
            .state
            .transition(SupervisorState::Starting)
            .map_err(SupervisorError::from)?;

        let port = match self.ports.allocate().await {
            Ok(port) => port,
            Err(e) => {
                self.settle(SupervisorState::Stopped);
                return Err(e);
            }
        };
        let resolved = spec.substitute(PORT_PLACEHOLDER, &port.to_string());
        info!(port, command = %resolved.display_command(), "launching server");

        let process = match self.launcher.launch(&resolved).await {
            Ok(process) => process,
            Err(e) => {
                self.settle(SupervisorState::Stopped);
                return Err(e.into());
            }
        };

        let started_at = SystemTime::now();
        let mut pumps = vec![pump(process.stdout, StreamKind::Stdout, self.logs.clone())];
        if let Some(stderr) = process.stderr {
            pumps.push(pump(stderr, StreamKind::Stderr, self.logs.clone()));
        }
        let monitor = ProcessMonitor::spawn(process.handle, self.launcher.clone(), move |_, _| {
            drain(pumps)
        });

        let base_url = format!("http://{}:{}", self.config.host, port);
        let prober = HealthProber::new(
            self.client.clone(),
            format!("{base_url}{}", self.config.status_path),
            Duration::from_millis(self.config.probe_interval_ms),
            Duration::from_millis(self.config.probe_timeout_ms),
            Duration::from_millis(self.config.startup_timeout_ms),
        );

        if let Err(e) = prober.wait_until_healthy(Some(monitor.exit_watch())).await {
            monitor.stop(self.config.stop_grace());
            let _ = tokio::time::timeout(self.config.stop_grace() + KILL_WAIT, monitor.exited()).await;
            self.settle(SupervisorState::Stopped);
            return Err(SupervisorError::StartupFailure {
                reason: e.to_string(),
                output: self.logs.lines_since(started_at),
            }
            .into());
        }

        let server = Server {
            port,
            monitor,
            sessions: SessionManager::new(
                self.client.clone(),
                base_url,
                self.config.capabilities.clone(),
                Duration::from_millis(self.config.request_timeout_ms),
            ),
            _stdin: Mutex::new(process.stdin),
        };

        let mut core = self.core();
        core.state
            .transition(SupervisorState::Running)
            .map_err(SupervisorError::from)?;
        core.server = Some(Arc::new(server));
        core.spec = Some(spec);
        info!(port, "server running");
        Ok(port)
    }
}

impl<L: Launcher> Drop for HttpSupervisor<L> {
    fn drop(&mut self) {
        // ProcessMonitor kills the child when dropped
        self.core().server.take();
    }
}

fn pump(reader: BoxedReader, stream: StreamKind, logs: Arc<LogBuffer>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = line_frames(reader);
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) => {
                    debug!(%stream, %line, "server output");
                    logs.push(stream, line);
                }
                Err(e) => {
                    debug!(%stream, error = %e, "server output closed");
                    break;
                }
            }
        }
    })
}

async fn drain(pumps: Vec<JoinHandle<()>>) {
    let aborts: Vec<_> = pumps.iter().map(JoinHandle::abort_handle).collect();
    let all = async {
        for pump in pumps {
            let _ = pump.await;
        }
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, all).await.is_err() {
        aborts.iter().for_each(|a| a.abort());
    }
}
