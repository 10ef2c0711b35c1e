use crate::http::{HttpError, HttpSupervisor, HttpSupervisorConfig};
use rpcvisor_core::{LauncherFactory, Supervisor, SupervisorConfig, SupervisorError};

/// Platform-independent factory that selects the launcher at compile time
pub struct PlatformLauncherFactory;

impl LauncherFactory for PlatformLauncherFactory {
    #[cfg(unix)]
    type Launcher = rpcvisor_unix::UnixLauncher;

    fn create_launcher() -> Self::Launcher {
        rpcvisor_unix::UnixLauncherFactory::create_launcher()
    }

    fn platform_name() -> &'static str {
        rpcvisor_unix::UnixLauncherFactory::platform_name()
    }
}

pub type PlatformLauncher = <PlatformLauncherFactory as LauncherFactory>::Launcher;

/// Stdio supervisor bound to the launcher for the current platform
pub type ProcessSupervisor = Supervisor<PlatformLauncher>;

/// HTTP supervisor bound to the launcher for the current platform
pub type PlatformHttpSupervisor = HttpSupervisor<PlatformLauncher>;

/// Convenience function to create a supervisor with the platform launcher
pub fn new_process_supervisor(config: SupervisorConfig) -> Result<ProcessSupervisor, SupervisorError> {
    Supervisor::new(config, PlatformLauncherFactory::create_launcher())
}

pub fn new_http_supervisor(config: HttpSupervisorConfig) -> Result<PlatformHttpSupervisor, HttpError> {
    HttpSupervisor::new(config, PlatformLauncherFactory::create_launcher())
}
