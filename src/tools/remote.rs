//! Remote action client: calls `{base}/mcp/{provider}/{action}` on the execution tier.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::config::ExecutionConfig;
use crate::error::ExecutionError;

/// Header carrying the shared internal secret.
pub const EXECUTION_SECRET_HEADER: &str = "x-internal-secret";

/// Raw response from the execution tier. Interpretation is left to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionResponse {
    pub status: u16,
    pub body: String,
}

impl ActionResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport for provider action calls.
#[async_trait]
pub trait ActionClient: Send + Sync {
    /// Invoke one action with `{args, auth}`. Transport failures are errors;
    /// any HTTP status is returned as a response.
    async fn invoke(
        &self,
        provider: &str,
        action: &str,
        args: &serde_json::Value,
        auth: &serde_json::Value,
    ) -> Result<ActionResponse, ExecutionError>;
}

/// reqwest-backed action client. Single attempt per call.
pub struct HttpActionClient {
    client: reqwest::Client,
    base_url: String,
    secret: Option<SecretString>,
    timeout: Duration,
}

impl HttpActionClient {
    pub fn new(config: &ExecutionConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            secret: config.shared_secret.clone(),
            timeout: config.timeout,
        }
    }

    pub fn action_url(&self, provider: &str, action: &str) -> String {
        format!("{}/mcp/{provider}/{action}", self.base_url)
    }
}

#[async_trait]
impl ActionClient for HttpActionClient {
    async fn invoke(
        &self,
        provider: &str,
        action: &str,
        args: &serde_json::Value,
        auth: &serde_json::Value,
    ) -> Result<ActionResponse, ExecutionError> {
        let secret = self.secret.as_ref().ok_or(ExecutionError::MissingSecret)?;
        let url = self.action_url(provider, action);
        debug!(provider, action, "Invoking remote action");

        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .header(EXECUTION_SECRET_HEADER, secret.expose_secret())
            .json(&serde_json::json!({ "args": args, "auth": auth }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExecutionError::Timeout {
                        timeout: self.timeout,
                    }
                } else {
                    ExecutionError::Network(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| ExecutionError::Network(format!("failed to read response body: {e}")))?;
        Ok(ActionResponse { status, body })
    }
}
