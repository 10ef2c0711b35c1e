use crate::config::{LaunchSpec, ReadinessStrategy, SupervisorConfig};
use crate::connection::{ChildConnection, ConnectionOptions};
use crate::correlator::{IdSequence, PendingSummary};
use crate::error::SupervisorError;
use crate::events::SupervisorEvent;
use crate::logs::{LogBuffer, LogEntry, LogFilter};
use crate::process::{ExitInfo, Launcher, ProcessId};
use crate::readiness::{ReadinessGate, ReadinessOutcome};
use crate::state::{StateCell, SupervisorState};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 64;

/// Why a process is being started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Attempt {
    Explicit,
    /// Automatic relaunch after the given crash count
    Restart(u32),
}

pub(crate) struct Core {
    pub(crate) state: StateCell,
    /// Bumped by every explicit launch and stop; work tagged with an older
    /// generation is obsolete
    pub(crate) generation: u64,
    incarnations: u64,
    pub(crate) connection: Option<Arc<ChildConnection>>,
    /// Last spec that reached Running through an explicit launch
    pub(crate) spec: Option<LaunchSpec>,
    pub(crate) crash_count: u32,
    pub(crate) cancel: CancellationToken,
    ids: IdSequence,
}

pub(crate) struct Shared<L: Launcher> {
    pub(crate) config: SupervisorConfig,
    pub(crate) launcher: Arc<L>,
    /// Serializes launch, stop and relaunch attempts
    pub(crate) control: tokio::sync::Mutex<()>,
    core: Mutex<Core>,
    logs: Arc<LogBuffer>,
    events: broadcast::Sender<SupervisorEvent>,
}

/// Supervises one external process speaking the line protocol.
///
/// `launch` starts the process and waits for readiness, `call` issues
/// correlated requests, and unexpected exits are relaunched within the
/// restart budget. Dropping the supervisor kills the child.
pub struct Supervisor<L: Launcher> {
    shared: Arc<Shared<L>>,
}

impl<L: Launcher> Supervisor<L> {
    pub fn new(config: SupervisorConfig, launcher: L) -> Result<Self, SupervisorError> {
        config
            .validate()
            .map_err(|e| SupervisorError::Configuration(format!("Invalid supervisor config: {e}")))?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let logs = Arc::new(LogBuffer::new(config.log_capacity));
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                launcher: Arc::new(launcher),
                control: tokio::sync::Mutex::new(()),
                core: Mutex::new(Core {
                    state: StateCell::default(),
                    generation: 0,
                    incarnations: 0,
                    connection: None,
                    spec: None,
                    crash_count: 0,
                    cancel: CancellationToken::new(),
                    ids: IdSequence::default(),
                }),
                logs,
                events,
            }),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.shared.config
    }

    pub fn launcher(&self) -> &L {
        &self.shared.launcher
    }

    /// Start the process and wait until it is ready.
    ///
    /// Replaces any running process, resets the crash count and restarts
    /// request ids from 1.
    pub async fn launch(&self, spec: LaunchSpec) -> Result<(), SupervisorError> {
        let shared = &self.shared;
        shared.cancel_background_work();
        let _control = shared.control.lock().await;
        shared.shutdown_current().await;

        let (generation, cancel) = {
            let mut core = shared.core();
            core.crash_count = 0;
            core.ids = IdSequence::default();
            core.cancel = CancellationToken::new();
            (core.generation, core.cancel.clone())
        };

        info!(name = %shared.config.name, command = %spec.display_command(), "launching process");
        shared
            .start_process(&spec, generation, &cancel, Attempt::Explicit)
            .await
    }

    /// Terminate the process. Never triggers a restart.
    ///
    /// Outstanding calls fail with [`SupervisorError::Cancelled`].
    pub async fn stop(&self) {
        let shared = &self.shared;
        shared.cancel_background_work();
        let _control = shared.control.lock().await;
        shared.shutdown_current().await;
    }

    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, SupervisorError> {
        self.call_with_timeout(method, params, self.shared.config.default_call_timeout())
            .await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, SupervisorError> {
        let connection = self.shared.running_connection()?;
        connection.call(method, params, timeout).await
    }

    /// Typed wrapper around [`Supervisor::call`]
    pub async fn call_as<P, R>(&self, method: &str, params: &P) -> Result<R, SupervisorError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)
            .map_err(|e| SupervisorError::Transport(format!("failed to encode params for {method}: {e}")))?;
        let params = (!params.is_null()).then_some(params);
        let result = self.call(method, params).await?;
        serde_json::from_value(result)
            .map_err(|e| SupervisorError::Transport(format!("unexpected result for {method}: {e}")))
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn state(&self) -> SupervisorState {
        self.shared.core().state.get()
    }

    /// Crashes since the last explicit launch
    pub fn crash_count(&self) -> u32 {
        self.shared.core().crash_count
    }

    pub fn pid(&self) -> Option<ProcessId> {
        self.shared.core().connection.as_ref().and_then(|c| c.pid())
    }

    pub fn pending_requests(&self) -> Vec<PendingSummary> {
        self.shared
            .core()
            .connection
            .as_ref()
            .map(|c| c.correlator().outstanding())
            .unwrap_or_default()
    }

    pub fn launch_spec(&self) -> Option<LaunchSpec> {
        self.shared.core().spec.clone()
    }

    pub fn logs(&self, filter: &LogFilter) -> Vec<LogEntry> {
        self.shared.logs.query(filter)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.shared.events.subscribe()
    }
}

impl<L: Launcher> Drop for Supervisor<L> {
    fn drop(&mut self) {
        let connection = {
            let mut core = self.shared.core();
            core.cancel.cancel();
            core.generation += 1;
            core.connection.take()
        };
        // dropping the last handle kills the child through its monitor
        if let Some(connection) = connection {
            debug!(pid = ?connection.pid().map(|p| p.0), "supervisor dropped, killing process");
        }
    }
}

impl<L: Launcher> Shared<L> {
    pub(crate) fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn emit(&self, event: SupervisorEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn running_connection(&self) -> Result<Arc<ChildConnection>, SupervisorError> {
        let core = self.core();
        let state = core.state.get();
        match (&core.connection, state) {
            (Some(connection), SupervisorState::Running) => Ok(connection.clone()),
            _ => Err(SupervisorError::NotRunning { state }),
        }
    }

    /// Interrupt pending relaunches and in-flight startups
    fn cancel_background_work(&self) {
        self.core().cancel.cancel();
    }

    /// Take the current process out of service and terminate it.
    /// Caller holds `control`.
    async fn shutdown_current(&self) {
        let (connection, previous) = {
            let mut core = self.core();
            core.cancel.cancel();
            core.generation += 1;
            let previous = core.state.get();
            if previous != SupervisorState::Stopped {
                if let Err(e) = core.state.transition(SupervisorState::Stopped) {
                    warn!(error = %e, "unexpected state during shutdown");
                }
            }
            (core.connection.take(), previous)
        };

        if let Some(connection) = connection {
            info!(pid = ?connection.pid().map(|p| p.0), "stopping process");
            connection.shutdown(self.config.stop_grace()).await;
        }
        if previous != SupervisorState::Stopped {
            info!(name = %self.config.name, %previous, "supervisor stopped");
            self.emit(SupervisorEvent::Stopped { previous });
        }
    }

    /// Launch one process and take it through the readiness gate.
    /// Caller holds `control`.
    pub(crate) async fn start_process(
        self: &Arc<Self>,
        spec: &LaunchSpec,
        generation: u64,
        cancel: &CancellationToken,
        attempt: Attempt,
    ) -> Result<(), SupervisorError> {
        let failure_state = match attempt {
            Attempt::Explicit => SupervisorState::Stopped,
            Attempt::Restart(_) => SupervisorState::Crashed,
        };

        let (incarnation, ids) = {
            let mut core = self.core();
            if core.generation != generation || cancel.is_cancelled() {
                return Err(SupervisorError::Cancelled);
            }
            core.state.transition(SupervisorState::Starting)?;
            core.incarnations += 1;
            (core.incarnations, core.ids.clone())
        };
        self.emit(SupervisorEvent::Starting {
            restart: match attempt {
                Attempt::Explicit => None,
                Attempt::Restart(count) => Some(count),
            },
        });

        let process = match self.launcher.launch(spec).await {
            Ok(process) => process,
            Err(e) => {
                warn!(command = %spec.display_command(), error = %e, "launch failed");
                self.settle(failure_state);
                return Err(e.into());
            }
        };

        let (ready_notification, ready_marker) = match &self.config.readiness.strategy {
            ReadinessStrategy::Notification { method } => (Some(method.clone()), None),
            ReadinessStrategy::LogMarker { marker } => (None, Some(marker.clone())),
            _ => (None, None),
        };
        let connection = Arc::new(ChildConnection::start(
            process,
            self.launcher.clone(),
            ConnectionOptions {
                incarnation,
                protocol_version: self.config.protocol_version.clone(),
                ids,
                ready_notification,
                ready_marker,
                logs: self.logs.clone(),
            },
        ));
        self.watch_exit(&connection);

        let gate = ReadinessGate::from_config(&self.config.readiness);
        let outcome = tokio::select! {
            outcome = gate.wait(self.readiness_signal(&connection), connection.exit_watch()) => Some(outcome),
            _ = cancel.cancelled() => None,
        };

        let outcome = match outcome {
            Some(outcome) => outcome,
            None => {
                info!("startup interrupted by stop or relaunch");
                connection.shutdown(self.config.stop_grace()).await;
                self.settle(SupervisorState::Stopped);
                return Err(SupervisorError::Cancelled);
            }
        };

        match outcome {
            ReadinessOutcome::Signaled | ReadinessOutcome::Assumed => {
                let crash_count = {
                    let mut core = self.core();
                    // exits are published under the same ordering as this check,
                    // so a process that died here is reported as a startup failure
                    if !connection.has_exited() {
                        core.state.transition(SupervisorState::Running)?;
                        core.connection = Some(connection.clone());
                        if attempt == Attempt::Explicit {
                            core.spec = Some(spec.clone());
                        }
                        Some(core.crash_count)
                    } else {
                        None
                    }
                };

                let Some(crash_count) = crash_count else {
                    let exit = connection.exited().await;
                    return Err(self.startup_failure(&connection, failure_state, exit_reason(exit)));
                };

                let pid = connection.pid();
                info!(pid = ?pid.map(|p| p.0), assumed = outcome == ReadinessOutcome::Assumed, "process ready");
                self.emit(SupervisorEvent::Ready {
                    pid,
                    assumed: outcome == ReadinessOutcome::Assumed,
                });
                if let Attempt::Restart(_) = attempt {
                    self.emit(SupervisorEvent::Restarted { pid, crash_count });
                }
                Ok(())
            }
            ReadinessOutcome::Exited(exit) => {
                Err(self.startup_failure(&connection, failure_state, exit_reason(exit)))
            }
            ReadinessOutcome::TimedOut => {
                let timeout = self.config.readiness.startup_timeout();
                connection.shutdown(self.config.stop_grace()).await;
                Err(self.startup_failure(
                    &connection,
                    failure_state,
                    format!("no readiness signal within {timeout:?}"),
                ))
            }
        }
    }

    fn startup_failure(&self, connection: &ChildConnection, state: SupervisorState, reason: String) -> SupervisorError {
        self.settle(state);
        let output = self.logs.lines_since(connection.started_at());
        warn!(%reason, captured = output.len(), "process failed to start");
        SupervisorError::StartupFailure { reason, output }
    }

    /// Leave Starting after a failed attempt
    fn settle(&self, state: SupervisorState) {
        let mut core = self.core();
        if core.state.get() == SupervisorState::Starting {
            if let Err(e) = core.state.transition(state) {
                warn!(error = %e, "failed to settle supervisor state");
            }
        }
    }

    async fn readiness_signal(&self, connection: &ChildConnection) {
        let readiness = &self.config.readiness;
        match &readiness.strategy {
            ReadinessStrategy::Notification { .. } | ReadinessStrategy::LogMarker { .. } => {
                connection.ready().fired().await
            }
            ReadinessStrategy::Probe { method, params } => loop {
                match connection
                    .call(method, params.clone(), readiness.probe_timeout())
                    .await
                {
                    Ok(_) => return,
                    Err(e) => debug!(%method, error = %e, "readiness probe failed"),
                }
                tokio::time::sleep(readiness.probe_interval()).await;
            },
            ReadinessStrategy::Implicit => std::future::pending().await,
        }
    }

    fn watch_exit(self: &Arc<Self>, connection: &ChildConnection) {
        let shared = Arc::downgrade(self);
        let incarnation = connection.incarnation();
        let pid = connection.pid();
        let mut exit_rx = connection.exit_watch();

        tokio::spawn(async move {
            let exit = match exit_rx.wait_for(Option::is_some).await {
                Ok(exit) => exit.unwrap_or_default(),
                Err(_) => ExitInfo::unknown(),
            };
            if let Some(shared) = shared.upgrade() {
                shared.emit(SupervisorEvent::Exited { pid, exit });
                shared.handle_exit(incarnation, exit);
            }
        });
    }
}

fn exit_reason(exit: ExitInfo) -> String {
    format!("process exited before becoming ready ({exit})")
}
