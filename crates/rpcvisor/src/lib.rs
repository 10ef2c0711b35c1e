//! rpcvisor - supervise RPC child processes.
//!
//! Two variants share the same lifecycle rules:
//!
//! - [`ProcessSupervisor`] drives a long-lived child over newline-delimited
//!   JSON on stdio, correlating concurrent calls by id and restarting the
//!   child within a bounded budget when it crashes.
//! - [`http::HttpSupervisor`] drives a server process over HTTP: it picks a
//!   free port, waits for the status endpoint and keeps a verified session.
//!
//! ```no_run
//! use rpcvisor::{LaunchSpec, SupervisorConfig, new_process_supervisor};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let supervisor = new_process_supervisor(SupervisorConfig::default())?;
//! supervisor
//!     .launch(LaunchSpec::builder().command("companion").build()?)
//!     .await?;
//! let status = supervisor.call("ping", None).await?;
//! println!("{status}");
//! supervisor.stop().await;
//! # Ok(())
//! # }
//! ```

mod build_step;
#[cfg(unix)]
mod factory;
pub mod http;
pub mod telemetry;

pub use build_step::{BuildOutcome, BuildStep};
#[cfg(unix)]
pub use factory::{
    PlatformHttpSupervisor, PlatformLauncher, PlatformLauncherFactory, ProcessSupervisor,
    new_http_supervisor, new_process_supervisor,
};
pub use telemetry::{LogFormat, init_tracing};

// Re-export core functionality
pub use rpcvisor_core::*;
