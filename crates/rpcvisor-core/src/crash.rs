//! Crash handling and bounded automatic relaunch.
//!
//! An exit only counts as a crash when it belongs to the process currently
//! serving requests and the supervisor is Running. Explicit stops take the
//! process out of service before signalling it, so their exits never get
//! here. The crash count only grows; an explicit `launch` is the only reset.

use crate::config::RestartConfig;
use crate::error::SupervisorError;
use crate::events::SupervisorEvent;
use crate::process::{ExitInfo, Launcher};
use crate::state::SupervisorState;
use crate::supervisor::{Attempt, Shared};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Restart allowance and backoff schedule, indexed by crash count
pub struct RestartBudget {
    max_restarts: u32,
    delays: Vec<Duration>,
    fallback: Duration,
}

impl RestartBudget {
    pub fn new(config: &RestartConfig) -> Self {
        Self {
            max_restarts: config.max_restarts,
            delays: config.delays().collect(),
            fallback: config.backoff(),
        }
    }

    pub fn max_restarts(&self) -> u32 {
        self.max_restarts
    }

    /// A relaunch is allowed while the crash count is within the budget
    pub fn permits(&self, crash_count: u32) -> bool {
        crash_count <= self.max_restarts
    }

    /// Delay before the relaunch that follows crash number `crash_count`
    pub fn delay_for(&self, crash_count: u32) -> Duration {
        let index = crash_count.saturating_sub(1) as usize;
        self.delays
            .get(index)
            .or(self.delays.last())
            .copied()
            .unwrap_or(self.fallback)
    }
}

impl<L: Launcher> Shared<L> {
    /// Classify an exit reported by a process watcher
    pub(crate) fn handle_exit(self: &Arc<Self>, incarnation: u64, exit: ExitInfo) {
        let crashed = {
            let mut core = self.core();
            let current = core
                .connection
                .as_ref()
                .is_some_and(|c| c.incarnation() == incarnation);
            if !current || core.state.get() != SupervisorState::Running {
                debug!(incarnation, %exit, "exit of inactive process");
                return;
            }

            core.connection = None;
            if let Err(e) = core.state.transition(SupervisorState::Crashed) {
                warn!(error = %e, "cannot record crash");
                return;
            }
            core.crash_count += 1;
            (core.crash_count, core.generation, core.cancel.clone())
        };

        let (crash_count, generation, cancel) = crashed;
        warn!(name = %self.config.name, %exit, crash_count, "process crashed");
        self.emit(SupervisorEvent::Crashed { exit, crash_count });

        let shared = self.clone();
        tokio::spawn(async move { shared.recover(generation, cancel).await });
    }

    async fn recover(self: Arc<Self>, generation: u64, cancel: CancellationToken) {
        let budget = RestartBudget::new(&self.config.restart);

        loop {
            let (crash_count, spec) = {
                let core = self.core();
                if core.generation != generation || core.state.get() != SupervisorState::Crashed {
                    return;
                }
                (core.crash_count, core.spec.clone())
            };

            let Some(spec) = spec.filter(|_| budget.permits(crash_count)) else {
                error!(
                    name = %self.config.name,
                    crash_count,
                    max_restarts = budget.max_restarts(),
                    "restart budget exhausted, giving up"
                );
                self.emit(SupervisorEvent::RestartsExhausted {
                    crash_count,
                    max_restarts: budget.max_restarts(),
                });
                return;
            };

            let delay = budget.delay_for(crash_count);
            warn!(crash_count, ?delay, "restarting process after backoff");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let _control = tokio::select! {
                _ = cancel.cancelled() => return,
                guard = self.control.lock() => guard,
            };

            match self
                .start_process(&spec, generation, &cancel, Attempt::Restart(crash_count))
                .await
            {
                Ok(()) => {
                    info!(crash_count, "process restarted");
                    return;
                }
                Err(SupervisorError::Cancelled) => return,
                Err(e) => {
                    warn!(crash_count, error = %e, "restart attempt failed");
                    let mut core = self.core();
                    if core.generation != generation {
                        return;
                    }
                    core.crash_count += 1;
                }
            }
        }
    }
}
