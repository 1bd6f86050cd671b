//! Timeout-bounded retry with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::request::{build_url, RequestOptions};
use crate::store::{auth_token, KeyValueStore};
use crate::transport::{HttpRequest, Transport};

/// Which HTTP error statuses are worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatuses {
  /// Every non-2xx status is retried, including 4xx replies that will
  /// never succeed.
  #[default]
  All,
  /// Only 408, 429 and 5xx are retried.
  Transient,
}

impl RetryStatuses {
  pub fn allows(&self, status: u16) -> bool {
    match self {
      RetryStatuses::All => true,
      RetryStatuses::Transient => status == 408 || status == 429 || status >= 500,
    }
  }
}

/// Retry configuration for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Total attempts, including the first one.
  pub max_attempts: u32,
  /// Delay after the first failed attempt; doubles after each further one.
  pub base_delay: Duration,
  /// Deadline for a single attempt.
  pub timeout: Duration,
  pub statuses: RetryStatuses,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay: Duration::from_millis(1000),
      timeout: Duration::from_secs(30),
      statuses: RetryStatuses::All,
    }
  }
}

impl RetryPolicy {
  /// Delay after failed attempt `attempt` (0-based): `base_delay * 2^attempt`.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    self
      .base_delay
      .saturating_mul(2u32.saturating_pow(attempt))
  }

  pub fn should_retry(&self, error: &ApiError) -> bool {
    match error {
      ApiError::Transport(_) | ApiError::Timeout(_) => true,
      ApiError::HttpStatus { status, .. } => self.statuses.allows(*status),
      ApiError::Parse(_) | ApiError::Validation(_) | ApiError::Storage(_) => false,
    }
  }
}

/// Issues requests against the backend with auth headers, per-attempt
/// timeouts and backoff between attempts.
pub struct Executor {
  transport: Arc<dyn Transport>,
  store: Arc<dyn KeyValueStore>,
  base_url: String,
}

impl Executor {
  pub fn new(transport: Arc<dyn Transport>, store: Arc<dyn KeyValueStore>, base_url: impl Into<String>) -> Self {
    Self {
      transport,
      store,
      base_url: base_url.into(),
    }
  }

  pub fn base_url(&self) -> &str {
    &self.base_url
  }

  pub fn transport(&self) -> &Arc<dyn Transport> {
    &self.transport
  }

  /// Headers sent with every request: the bearer token when one is stored.
  pub fn auth_headers(&self) -> Vec<(String, String)> {
    auth_token(self.store.as_ref())
      .map(|token| vec![("Authorization".to_string(), format!("Bearer {}", token))])
      .unwrap_or_default()
  }

  /// Run the request until it succeeds, fails with a non-retryable error, or
  /// runs out of attempts. The last observed error is returned.
  pub async fn execute(&self, options: &RequestOptions, policy: &RetryPolicy) -> Result<Value, ApiError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
      match self.attempt(options, policy.timeout).await {
        Ok(payload) => return Ok(payload),
        Err(error) => {
          if attempt + 1 >= max_attempts || !policy.should_retry(&error) {
            debug!(
              method = %options.method,
              path = %options.path,
              attempts = attempt + 1,
              error = %error,
              "Request failed"
            );
            return Err(error);
          }

          let delay = policy.delay_for(attempt);
          warn!(
            method = %options.method,
            path = %options.path,
            attempt = attempt + 1,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying request"
          );
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
      }
    }
  }

  /// One attempt under its own deadline. Dropping the transport future on
  /// timeout aborts the call.
  async fn attempt(&self, options: &RequestOptions, timeout: Duration) -> Result<Value, ApiError> {
    let url = build_url(&self.base_url, &options.path, options.params.as_ref())?;

    let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
    headers.extend(self.auth_headers());
    headers.extend(options.headers.iter().cloned());

    let request = HttpRequest {
      method: options.method,
      url: url.to_string(),
      headers,
      body: options.body.clone(),
    };

    let response = tokio::time::timeout(timeout, self.transport.send(request))
      .await
      .map_err(|_| ApiError::Timeout(timeout))??;

    response.error_for_status()?.json()
  }
}
