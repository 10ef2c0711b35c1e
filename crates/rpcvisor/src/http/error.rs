use rpcvisor_core::{LaunchError, SupervisorError};
use thiserror::Error;

/// W3C error code the server returns for a session it no longer knows
pub const INVALID_SESSION_ID: &str = "invalid session id";

#[derive(Error, Debug)]
pub enum HttpError {
    #[error("No free port in range {start}..={end}")]
    NoFreePort { start: u16, end: u16 },

    #[error("Server at {url} is not healthy: {reason}")]
    Unhealthy { url: String, reason: String },

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Unexpected HTTP status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Remote error `{error}`: {message}")]
    Remote { error: String, message: String },

    #[error("Response did not contain a session id: {0}")]
    MissingSessionId(String),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

impl From<LaunchError> for HttpError {
    fn from(e: LaunchError) -> Self {
        HttpError::Supervisor(SupervisorError::Launch(e))
    }
}

impl HttpError {
    /// The server rejected the session id the request was sent with
    pub fn is_invalid_session(&self) -> bool {
        matches!(self, HttpError::Remote { error, .. } if error == INVALID_SESSION_ID)
    }
}
