//! Unix launcher for rpcvisor.
//!
//! Children run in their own process group so signals reach every process
//! they fork. Forced kills also walk the process tree, which catches
//! descendants that left the group.

#[cfg(unix)]
mod launcher;

#[cfg(unix)]
pub use launcher::{UnixLauncher, UnixLauncherFactory, UnixProcessHandle};
