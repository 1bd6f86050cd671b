//! Error types for the request layer.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by API calls.
///
/// Cloneable so that one settled outcome can be handed to every caller that
/// joined the same in-flight request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
  /// Network unreachable, connection reset or aborted body.
  #[error("transport error: {0}")]
  Transport(String),

  /// The attempt exceeded its deadline.
  #[error("request timed out after {}ms", .0.as_millis())]
  Timeout(Duration),

  /// A response arrived with a non-2xx status.
  #[error("HTTP {status}: {status_text}")]
  HttpStatus { status: u16, status_text: String },

  /// The response body could not be decoded.
  #[error("invalid response format: {0}")]
  Parse(String),

  /// Pre-flight check failed; nothing was sent.
  #[error("validation failed: {0}")]
  Validation(String),

  #[error("storage error: {0}")]
  Storage(String),
}

impl ApiError {
  /// Transport-level failures (including timeouts), as opposed to a server reply.
  pub fn is_transport(&self) -> bool {
    matches!(self, ApiError::Transport(_) | ApiError::Timeout(_))
  }

  /// HTTP status carried by the error, if any.
  pub fn status(&self) -> Option<u16> {
    match self {
      ApiError::HttpStatus { status, .. } => Some(*status),
      _ => None,
    }
  }
}

impl From<StoreError> for ApiError {
  fn from(e: StoreError) -> Self {
    ApiError::Storage(e.to_string())
  }
}

/// Errors from the durable key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("database error: {0}")]
  Database(#[from] rusqlite::Error),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("lock poisoned")]
  Poisoned,

  #[error("could not determine data directory")]
  NoDataDir,
}

pub type Result<T, E = ApiError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_http_status_message() {
    let err = ApiError::HttpStatus {
      status: 503,
      status_text: "Service Unavailable".to_string(),
    };
    assert_eq!(err.to_string(), "HTTP 503: Service Unavailable");
    assert_eq!(err.status(), Some(503));
    assert!(!err.is_transport());
  }

  #[test]
  fn test_timeout_counts_as_transport() {
    let err = ApiError::Timeout(Duration::from_secs(30));
    assert!(err.is_transport());
    assert_eq!(err.to_string(), "request timed out after 30000ms");
  }

  #[test]
  fn test_store_error_converts() {
    let err: ApiError = StoreError::Poisoned.into();
    assert_eq!(err, ApiError::Storage("lock poisoned".to_string()));
  }
}
