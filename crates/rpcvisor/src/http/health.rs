use super::error::HttpError;
use backon::{ConstantBuilder, Retryable};
use rpcvisor_core::{ExitInfo, ExitWatch};
use std::time::Duration;
use tracing::{debug, info};

/// Polls a status endpoint until it answers 2xx.
///
/// Each attempt has its own timeout, separate from the overall startup
/// deadline.
#[derive(Debug, Clone)]
pub struct HealthProber {
    client: reqwest::Client,
    url: String,
    interval: Duration,
    attempt_timeout: Duration,
    startup_timeout: Duration,
}

impl HealthProber {
    pub fn new(
        client: reqwest::Client,
        url: impl Into<String>,
        interval: Duration,
        attempt_timeout: Duration,
        startup_timeout: Duration,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            interval,
            attempt_timeout,
            startup_timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn probe_once(&self) -> Result<(), HttpError> {
        let response = self
            .client
            .get(&self.url)
            .timeout(self.attempt_timeout)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(HttpError::Status {
            status: status.as_u16(),
            body,
        })
    }

    /// Probe until healthy, the startup timeout elapses, or `exit` reports
    /// that the server process is gone
    pub async fn wait_until_healthy(&self, exit: Option<ExitWatch>) -> Result<(), HttpError> {
        let probes = (|| self.probe_once())
            .retry(
                ConstantBuilder::default()
                    .with_delay(self.interval)
                    .with_max_times(usize::MAX),
            )
            .notify(|e: &HttpError, _| debug!(url = %self.url, error = %e, "health probe failed"));
        let deadline = tokio::time::timeout(self.startup_timeout, probes);

        let result = tokio::select! {
            biased;
            result = deadline => match result {
                Ok(result) => result.map_err(|e| self.unhealthy(e.to_string())),
                Err(_) => Err(self.unhealthy(format!(
                    "no healthy response within {:?}",
                    self.startup_timeout
                ))),
            },
            exit = wait_for_exit(exit) => {
                Err(self.unhealthy(format!("process exited ({exit}) before becoming healthy")))
            }
        };

        if result.is_ok() {
            info!(url = %self.url, "server is healthy");
        }
        result
    }

    fn unhealthy(&self, reason: String) -> HttpError {
        HttpError::Unhealthy {
            url: self.url.clone(),
            reason,
        }
    }
}

async fn wait_for_exit(exit: Option<ExitWatch>) -> ExitInfo {
    if let Some(mut exit) = exit {
        if let Ok(info) = exit.wait_for(Option::is_some).await {
            return info.unwrap_or_default();
        }
    }
    std::future::pending().await
}
