use crate::config::ReadinessConfig;
use crate::process::ExitInfo;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// One-way latch set when the child announces readiness.
///
/// Fired by the output readers (notification or log marker); firing twice is
/// a no-op.
#[derive(Debug, Clone)]
pub struct ReadySignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ReadySignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadySignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Returns true only for the call that actually set the latch
    pub fn fire(&self) -> bool {
        self.tx.send_if_modified(|ready| {
            let first = !*ready;
            *ready = true;
            first
        })
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn fired(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives in self, so this cannot observe a closed channel
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

/// How a readiness wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessOutcome {
    /// The child signalled readiness
    Signaled,
    /// No signal, but the startup timeout elapsed with the child alive
    Assumed,
    /// The child exited first
    Exited(ExitInfo),
    /// No signal within the timeout and optimistic readiness is disabled
    TimedOut,
}

impl ReadinessOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, ReadinessOutcome::Signaled | ReadinessOutcome::Assumed)
    }
}

/// Races the readiness signal against process exit and the startup timeout.
///
/// All three are observed by a single `select!`, so exactly one outcome is
/// produced. When several are ready at once the priority is signal, then
/// exit, then timeout.
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    timeout: Duration,
    assume_ready_on_timeout: bool,
}

impl ReadinessGate {
    pub fn new(timeout: Duration, assume_ready_on_timeout: bool) -> Self {
        Self {
            timeout,
            assume_ready_on_timeout,
        }
    }

    pub fn from_config(config: &ReadinessConfig) -> Self {
        Self::new(config.startup_timeout(), config.assume_ready_on_timeout)
    }

    pub async fn wait<F>(&self, signal: F, mut exit: watch::Receiver<Option<ExitInfo>>) -> ReadinessOutcome
    where
        F: Future<Output = ()>,
    {
        let exited = async move {
            match exit.wait_for(Option::is_some).await {
                Ok(info) => info.unwrap_or_default(),
                // watcher went away without publishing; treat as an exit
                Err(_) => ExitInfo::unknown(),
            }
        };

        tokio::select! {
            biased;
            _ = signal => {
                debug!("readiness signalled");
                ReadinessOutcome::Signaled
            }
            info = exited => {
                debug!(exit = %info, "process exited before readiness");
                ReadinessOutcome::Exited(info)
            }
            _ = tokio::time::sleep(self.timeout) => {
                if self.assume_ready_on_timeout {
                    // The child may still be unable to serve requests here;
                    // early calls can time out spuriously.
                    warn!(timeout = ?self.timeout, "no readiness signal, assuming ready");
                    ReadinessOutcome::Assumed
                } else {
                    ReadinessOutcome::TimedOut
                }
            }
        }
    }
}
