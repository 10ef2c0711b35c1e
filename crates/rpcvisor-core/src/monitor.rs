use crate::process::{ExitInfo, ProcessHandle, ProcessId, ProcessTermination, TerminationResult};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

pub type ExitWatch = watch::Receiver<Option<ExitInfo>>;

/// Owns a child's [`ProcessHandle`] and reports its exit exactly once.
///
/// A background task waits on the child. A stop request (or dropping the
/// monitor) switches it to termination: SIGTERM, wait out the grace period,
/// then kill the whole process tree. When the child is gone the `before_publish` hook runs,
/// and only then is the exit published on the watch channel.
pub struct ProcessMonitor {
    pid: Option<ProcessId>,
    stop_tx: Mutex<Option<oneshot::Sender<Duration>>>,
    exit_rx: ExitWatch,
}

impl ProcessMonitor {
    pub fn spawn<T, F, Fut>(mut handle: Box<dyn ProcessHandle>, terminator: Arc<T>, before_publish: F) -> Self
    where
        T: ProcessTermination + ?Sized + 'static,
        F: FnOnce(ExitInfo, bool) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let pid = handle.pid();
        let (stop_tx, stop_rx) = oneshot::channel::<Duration>();
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(async move {
            let (exit, intentional) = tokio::select! {
                result = handle.wait() => (exit_or_unknown(result), false),
                grace = stop_rx => {
                    // a dropped monitor means kill now
                    let grace = grace.unwrap_or(Duration::ZERO);
                    (terminate(&mut handle, terminator.as_ref(), grace).await, true)
                }
            };

            match pid {
                Some(pid) if intentional => info!(%pid, %exit, "process stopped"),
                Some(pid) => info!(%pid, %exit, "process exited"),
                None => info!(%exit, "process exited"),
            }

            before_publish(exit, intentional).await;
            exit_tx.send_replace(Some(exit));
        });

        Self {
            pid,
            stop_tx: Mutex::new(Some(stop_tx)),
            exit_rx,
        }
    }

    pub fn pid(&self) -> Option<ProcessId> {
        self.pid
    }

    /// Ask the watcher task to terminate the child. Returns false if a stop
    /// was already requested or the child is already gone.
    pub fn stop(&self, grace: Duration) -> bool {
        let sender = self
            .stop_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(sender) => sender.send(grace).is_ok(),
            None => false,
        }
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_info().is_some()
    }

    pub fn exit_watch(&self) -> ExitWatch {
        self.exit_rx.clone()
    }

    /// Resolves once the exit has been published
    pub async fn exited(&self) -> ExitInfo {
        let mut rx = self.exit_rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(exit) => exit.unwrap_or_default(),
            Err(_) => ExitInfo::unknown(),
        }
    }
}

fn exit_or_unknown(result: anyhow::Result<ExitInfo>) -> ExitInfo {
    result.unwrap_or_else(|e| {
        warn!(error = %e, "failed to collect exit status");
        ExitInfo::unknown()
    })
}

async fn terminate<T>(handle: &mut Box<dyn ProcessHandle>, terminator: &T, grace: Duration) -> ExitInfo
where
    T: ProcessTermination + ?Sized,
{
    if let Some(pid) = handle.pid() {
        if !grace.is_zero() {
            match terminator.terminate_gracefully(pid).await {
                TerminationResult::Success => {
                    if let Ok(result) = tokio::time::timeout(grace, handle.wait()).await {
                        return exit_or_unknown(result);
                    }
                    warn!(%pid, ?grace, "process ignored SIGTERM, killing");
                }
                TerminationResult::ProcessNotFound => {}
                other => warn!(%pid, result = ?other, "graceful termination failed"),
            }
        }

        // descendants may have left the group, so kill by tree
        match terminator.terminate_process_tree(pid).await {
            TerminationResult::Success | TerminationResult::ProcessNotFound => {}
            other => warn!(%pid, result = ?other, "process tree kill failed"),
        }
    }

    if let Err(e) = handle.kill().await {
        debug!(error = %e, "kill after termination");
    }
    exit_or_unknown(handle.wait().await)
}

impl Drop for ProcessMonitor {
    fn drop(&mut self) {
        // dropping the sender wakes the watcher task, which kills the child
        self.stop_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}
