//! Shared plumbing for the JSON/HTTP backends.

use crate::error::{DubError, Result, with_timeout};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Map a non-success HTTP status to the error taxonomy.
pub fn error_for_status(status: StatusCode, body: &str) -> DubError {
    let message = if body.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("HTTP {}: {}", status.as_u16(), truncate(body, 300))
    };
    match status.as_u16() {
        401 | 403 => DubError::Auth { message },
        429 => DubError::Quota { message },
        400 | 404 | 413 | 415 | 422 => DubError::Validation { message },
        408 | 500..=599 => DubError::Network { message },
        _ => DubError::Protocol { message },
    }
}

/// Map a transport-level reqwest failure.
pub fn error_for_request(operation: &str, after: Duration, e: reqwest::Error) -> DubError {
    if e.is_timeout() {
        DubError::timeout(operation, after)
    } else if e.is_decode() {
        DubError::protocol(format!("{}: malformed response: {}", operation, e))
    } else {
        DubError::Network {
            message: format!("{}: {}", operation, e),
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Bearer-authenticated client for one API base URL.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    op_timeout: Duration,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("op_timeout", &self.op_timeout)
            .finish()
    }
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, api_key: SecretString, op_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            op_timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .post(self.endpoint(path))
            .bearer_auth(self.api_key.expose_secret())
    }

    /// Send `request` under the operation timeout, racing cancellation, and
    /// turn error statuses into [`DubError`]s.
    pub async fn execute(
        &self,
        operation: &str,
        request: reqwest::RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        let after = self.op_timeout;
        let call = async {
            let response = request
                .send()
                .await
                .map_err(|e| error_for_request(operation, after, e))?;
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            let body = response.text().await.unwrap_or_default();
            Err(error_for_status(status, &body))
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DubError::cancelled(format!("{} cancelled", operation))),
            result = with_timeout(operation, after, call) => result,
        }
    }

    /// Like [`execute`](Self::execute), then read the body as JSON.
    pub async fn execute_json(
        &self,
        operation: &str,
        request: reqwest::RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value> {
        let response = self.execute(operation, request, cancel).await?;
        let after = self.op_timeout;
        response
            .json()
            .await
            .map_err(|e| error_for_request(operation, after, e))
    }

    pub async fn execute_bytes(
        &self,
        operation: &str,
        request: reqwest::RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let response = self.execute(operation, request, cancel).await?;
        let after = self.op_timeout;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| error_for_request(operation, after, e))?;
        Ok(bytes.to_vec())
    }
}
