//! HTTP client implementation

use std::time::Duration;

use reqwest::{Client, Method};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::errors::AgentError;

/// Retry policy for backend requests
#[derive(Debug, Clone, Copy)]
pub struct RetryOptions {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Fixed delay between attempts
    pub retry_delay: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// HTTP client for backend communication
pub struct HttpClient {
    client: Client,
    base_url: String,
    retry: RetryOptions,
}

impl HttpClient {
    /// Create a new HTTP client
    pub fn new(base_url: &str, timeout: Duration, retry: RetryOptions) -> Result<Self, AgentError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry,
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Make a single request. Non-2xx responses are errors; an empty body is
    /// `Value::Null`.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, AgentError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {}", method, url);

        let mut request = self.client.request(method.clone(), &url);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("HTTP {} {} failed: {} - {}", method, path, status, body);
            return Err(AgentError::BackendError(format!("{}: {}", status, body)));
        }

        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    /// Make a request with bounded retry.
    ///
    /// Tries `max_retries + 1` times with a fixed delay in between and returns
    /// `None` once every attempt has failed.
    pub async fn request_with_retry(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Option<Value> {
        let attempts = self.retry.max_retries.saturating_add(1);
        for attempt in 1..=attempts {
            match self.request(method.clone(), path, body).await {
                Ok(value) => return Some(value),
                Err(e) => {
                    warn!(
                        "Request {} {} failed (attempt {}/{}): {}",
                        method, path, attempt, attempts, e
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.retry.retry_delay).await;
                    }
                }
            }
        }

        error!("Request {} {} failed after {} attempts", method, path, attempts);
        None
    }
}
