use super::error::HttpError;
use std::ops::RangeInclusive;
use tokio::net::TcpListener;
use tracing::debug;

/// Finds a free local port by briefly binding each candidate in turn
#[derive(Debug, Clone)]
pub struct PortAllocator {
    host: String,
    range: RangeInclusive<u16>,
}

impl PortAllocator {
    pub fn new(host: impl Into<String>, range: RangeInclusive<u16>) -> Self {
        Self {
            host: host.into(),
            range,
        }
    }

    /// First port in the range that can be bound, released before returning
    pub async fn allocate(&self) -> Result<u16, HttpError> {
        for port in self.range.clone() {
            match TcpListener::bind((self.host.as_str(), port)).await {
                Ok(listener) => {
                    drop(listener);
                    debug!(port, "allocated port");
                    return Ok(port);
                }
                Err(e) => debug!(port, error = %e, "port unavailable"),
            }
        }
        Err(HttpError::NoFreePort {
            start: *self.range.start(),
            end: *self.range.end(),
        })
    }
}
