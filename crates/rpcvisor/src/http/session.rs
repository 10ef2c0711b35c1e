//! WebDriver-style session handling on top of a healthy server.

use super::error::HttpError;
use reqwest::Method;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Pull the session id out of a `POST /session` response.
///
/// Servers disagree on where it lives. Checked in order:
/// `value.sessionId`, `sessionId`, `value.session_id`, `session_id`.
pub fn extract_session_id(body: &Value) -> Option<String> {
    let nested = body.get("value");
    [
        nested.and_then(|v| v.get("sessionId")),
        body.get("sessionId"),
        nested.and_then(|v| v.get("session_id")),
        body.get("session_id"),
    ]
    .into_iter()
    .flatten()
    .find_map(|id| id.as_str().filter(|id| !id.is_empty()).map(str::to_owned))
}

/// W3C error envelope: `{"value": {"error": ..., "message": ...}}`
pub fn remote_error(body: &Value) -> Option<HttpError> {
    let value = body.get("value")?;
    let error = value.get("error")?.as_str()?;
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Some(HttpError::Remote {
        error: error.to_owned(),
        message: message.to_owned(),
    })
}

async fn decode(response: reqwest::Response) -> Result<Value, HttpError> {
    let status = response.status();
    let text = response.text().await?;
    let body: Option<Value> = serde_json::from_str(&text).ok();

    if let Some(error) = body.as_ref().and_then(remote_error) {
        return Err(error);
    }
    if !status.is_success() {
        return Err(HttpError::Status {
            status: status.as_u16(),
            body: text,
        });
    }
    Ok(body.unwrap_or(Value::Null))
}

/// Owns at most one session and re-verifies it before every reuse
pub struct SessionManager {
    client: reqwest::Client,
    base_url: String,
    capabilities: Value,
    timeout: Duration,
    current: Mutex<Option<String>>,
}

impl SessionManager {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        capabilities: Value,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            capabilities,
            timeout,
            current: Mutex::new(None),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Cached session id, without verifying it
    pub async fn session_id(&self) -> Option<String> {
        self.current.lock().await.clone()
    }

    /// A session the server currently accepts, replacing a stale one
    pub async fn ensure_session(&self) -> Result<String, HttpError> {
        let mut current = self.current.lock().await;
        if let Some(id) = current.as_deref() {
            if self.verify(id).await {
                return Ok(id.to_owned());
            }
            warn!(session = %id, "session no longer valid, creating a new one");
            *current = None;
        }

        let id = self.create().await?;
        *current = Some(id.clone());
        Ok(id)
    }

    /// Forget the cached session so the next request creates a fresh one
    pub async fn invalidate(&self) {
        self.current.lock().await.take();
    }

    /// Send `method /session/{id}/{path}` and unwrap the `value` field
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, HttpError> {
        let id = self.ensure_session().await?;
        let url = format!(
            "{}/session/{}/{}",
            self.base_url,
            id,
            path.trim_start_matches('/')
        );
        debug!(%method, %url, "session request");

        let mut request = self.client.request(method, url).timeout(self.timeout);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let mut value = decode(request.send().await?).await?;
        Ok(match value.get_mut("value") {
            Some(inner) => inner.take(),
            None => value,
        })
    }

    /// Delete the current session. Errors are logged and ignored.
    pub async fn close(&self) {
        let Some(id) = self.current.lock().await.take() else {
            return;
        };
        let url = format!("{}/session/{}", self.base_url, id);
        match self
            .client
            .delete(&url)
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(response) => debug!(session = %id, status = %response.status(), "session deleted"),
            Err(e) => debug!(session = %id, error = %e, "session delete failed"),
        }
    }

    async fn verify(&self, id: &str) -> bool {
        let url = format!("{}/session/{}", self.base_url, id);
        match self.client.get(&url).timeout(self.timeout).send().await {
            Ok(response) => decode(response).await.is_ok(),
            Err(e) => {
                debug!(session = %id, error = %e, "session verification failed");
                false
            }
        }
    }

    async fn create(&self) -> Result<String, HttpError> {
        let url = format!("{}/session", self.base_url);
        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&json!({ "capabilities": self.capabilities }))
            .send()
            .await?;
        let body = decode(response).await?;
        let id = extract_session_id(&body).ok_or_else(|| HttpError::MissingSessionId(body.to_string()))?;
        info!(session = %id, "session created");
        Ok(id)
    }
}
