//! HTTP variant: the supervised process serves a WebDriver-style API on a
//! local port instead of speaking the line protocol on stdio.

mod error;
mod health;
mod port;
mod session;
mod supervisor;

pub use error::{HttpError, INVALID_SESSION_ID};
pub use health::HealthProber;
pub use port::PortAllocator;
pub use session::{SessionManager, extract_session_id, remote_error};
pub use supervisor::{HttpSupervisor, HttpSupervisorConfig, HttpSupervisorConfigBuilder, PORT_PLACEHOLDER};
