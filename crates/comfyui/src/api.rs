//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps the endpoints a farm task needs (liveness and client id,
//! workflow submission, history lookup) using [`reqwest`]. The
//! [`WorkerApi`] trait is the seam the queue manager, poll channel and
//! readiness wait are written against.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Response returned by the ComfyUI `/prompt` endpoint after
/// successfully queuing a workflow.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i64,
}

/// Body of `GET /prompt`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromptInfo {
    /// Present on some ComfyUI builds; a fresh UUID is used otherwise.
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub exec_info: Option<Value>,
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The task is stopping; the request was never sent.
    #[error("Request skipped, task is stopping")]
    Stopped,
}

impl ComfyUIApiError {
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ApiError { status: 404, .. })
    }
}

/// Operations against one worker instance.
pub trait WorkerApi: Send + Sync {
    /// `GET /prompt`: liveness check and client id.
    fn get_prompt(&self) -> impl Future<Output = Result<PromptInfo, ComfyUIApiError>> + Send;

    /// `POST /prompt` with body `{"prompt": workflow, "client_id": ...}`.
    fn submit_workflow(
        &self,
        workflow: &Value,
        client_id: &str,
    ) -> impl Future<Output = Result<SubmitResponse, ComfyUIApiError>> + Send;

    /// `GET /history/{prompt_id}`. `Ok(None)` while the worker has no
    /// entry for the prompt yet.
    fn get_history(
        &self,
        prompt_id: &str,
    ) -> impl Future<Output = Result<Option<Value>, ComfyUIApiError>> + Send;

    /// `GET /history`: every entry the worker still holds, keyed by id.
    fn get_all_history(&self) -> impl Future<Output = Result<Value, ComfyUIApiError>> + Send;
}

/// Upper bound on a single request. A worker that accepts the connection
/// but never answers must not hold the poll loop.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the shared [`reqwest::Client`] with a per-request timeout.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, ComfyUIApiError> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// HTTP client for a single ComfyUI instance.
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
    running: CancellationToken,
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    /// * `running` - once cancelled, every call short-circuits with
    ///   [`ComfyUIApiError::Stopped`].
    pub fn new(api_url: String, running: CancellationToken) -> Result<Self, ComfyUIApiError> {
        Ok(Self {
            client: http_client(REQUEST_TIMEOUT)?,
            api_url,
            running,
        })
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: String, running: CancellationToken) -> Self {
        Self {
            client,
            api_url,
            running,
        }
    }

    // ---- private helpers ----

    fn ensure_running(&self) -> Result<(), ComfyUIApiError> {
        if self.running.is_cancelled() {
            tracing::debug!(api_url = %self.api_url, "Skipping request, task is stopping");
            return Err(ComfyUIApiError::Stopped);
        }
        Ok(())
    }

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

impl WorkerApi for ComfyUIApi {
    async fn get_prompt(&self) -> Result<PromptInfo, ComfyUIApiError> {
        self.ensure_running()?;
        let response = self
            .client
            .get(format!("{}/prompt", self.api_url))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    async fn submit_workflow(
        &self,
        workflow: &Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        self.ensure_running()?;
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    async fn get_history(&self, prompt_id: &str) -> Result<Option<Value>, ComfyUIApiError> {
        self.ensure_running()?;
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await?;

        match Self::parse_response::<Value>(response).await {
            Ok(history) => Ok(history.get(prompt_id).cloned()),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_all_history(&self) -> Result<Value, ComfyUIApiError> {
        self.ensure_running()?;
        let response = self
            .client
            .get(format!("{}/history", self.api_url))
            .send()
            .await?;

        Self::parse_response(response).await
    }
}

/// Fetch the client id for this task's submissions, generating a UUID
/// when the worker does not hand one out.
pub async fn resolve_client_id<A: WorkerApi>(api: &A) -> Result<String, ComfyUIApiError> {
    let info = api.get_prompt().await?;
    let client_id = match info.client_id.filter(|id| !id.is_empty()) {
        Some(id) => id,
        None => uuid::Uuid::new_v4().to_string(),
    };
    tracing::info!(client_id = %client_id, "Got client ID");
    Ok(client_id)
}
