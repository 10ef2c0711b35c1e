//! One-time build of an artifact the child process needs before it can run.

use rpcvisor_core::{LaunchError, LaunchSpec};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    AlreadyBuilt,
    Built,
}

/// Runs `spec` only when `artifact_dir` is absent.
///
/// Clones share a lock, so concurrent callers wait for a single build.
#[derive(Debug, Clone)]
pub struct BuildStep {
    spec: LaunchSpec,
    artifact_dir: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl BuildStep {
    pub fn new(spec: LaunchSpec, artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            spec,
            artifact_dir: artifact_dir.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    pub fn is_built(&self) -> bool {
        self.artifact_dir.is_dir()
    }

    /// Build if needed. A failed build returns the tool's combined output
    /// untouched in [`LaunchError::Build`].
    pub async fn ensure_built(&self) -> Result<BuildOutcome, LaunchError> {
        let _guard = self.lock.lock().await;
        if self.is_built() {
            return Ok(BuildOutcome::AlreadyBuilt);
        }

        let command = self.spec.display_command();
        info!(%command, artifact_dir = %self.artifact_dir.display(), "Running build step");

        let mut cmd = Command::new(&self.spec.command);
        cmd.args(&self.spec.args)
            .envs(&self.spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.spec.working_directory {
            cmd.current_dir(dir);
        }

        let output = cmd.output().await.map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                LaunchError::NotFound {
                    candidates: vec![PathBuf::from(&self.spec.command)],
                }
            } else {
                LaunchError::Spawn {
                    command: command.clone(),
                    source,
                }
            }
        })?;

        let mut captured = String::from_utf8_lossy(&output.stdout).into_owned();
        captured.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            warn!(%command, status = %output.status, "Build step failed");
            return Err(LaunchError::Build {
                command,
                output: captured,
            });
        }
        if !self.is_built() {
            captured.push_str(&format!(
                "\nbuild finished without creating {}",
                self.artifact_dir.display()
            ));
            return Err(LaunchError::Build {
                command,
                output: captured,
            });
        }

        info!(%command, "Build step finished");
        Ok(BuildOutcome::Built)
    }
}
