//! Logical request descriptors.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::ApiError;
use crate::retry::RetryPolicy;

/// HTTP method of a logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  #[default]
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }

  /// Only reads are cached.
  pub fn is_read(&self) -> bool {
    matches!(self, Method::Get)
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl std::str::FromStr for Method {
  type Err = ApiError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_uppercase().as_str() {
      "GET" => Ok(Method::Get),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "PATCH" => Ok(Method::Patch),
      "DELETE" => Ok(Method::Delete),
      other => Err(ApiError::Validation(format!("unsupported method: {}", other))),
    }
  }
}

/// A logical request plus its per-call caching and retry overrides.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
  pub method: Method,
  /// Path relative to the base URL, e.g. `/v1/excel/analyze`
  pub path: String,
  /// Query parameters; part of the request identity
  pub params: Option<Value>,
  /// JSON body
  pub body: Option<Value>,
  /// Extra headers, applied after the defaults
  pub headers: Vec<(String, String)>,
  /// Set to skip both cache lookup and cache population
  pub no_cache: bool,
  pub cache_ttl: Option<Duration>,
  pub max_attempts: Option<u32>,
  pub retry_delay: Option<Duration>,
  pub timeout: Option<Duration>,
  /// Identifier used if the call ends up in the offline queue
  pub offline_key: Option<String>,
}

impl RequestOptions {
  pub fn new(method: Method, path: impl Into<String>) -> Self {
    Self {
      method,
      path: path.into(),
      ..Default::default()
    }
  }

  pub fn get(path: impl Into<String>) -> Self {
    Self::new(Method::Get, path)
  }

  pub fn post(path: impl Into<String>, body: Value) -> Self {
    Self::new(Method::Post, path).with_body(body)
  }

  pub fn put(path: impl Into<String>, body: Value) -> Self {
    Self::new(Method::Put, path).with_body(body)
  }

  pub fn delete(path: impl Into<String>) -> Self {
    Self::new(Method::Delete, path)
  }

  pub fn with_params(mut self, params: Value) -> Self {
    self.params = Some(params);
    self
  }

  pub fn with_body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn no_cache(mut self) -> Self {
    self.no_cache = true;
    self
  }

  pub fn cache_ttl(mut self, ttl: Duration) -> Self {
    self.cache_ttl = Some(ttl);
    self
  }

  pub fn max_attempts(mut self, attempts: u32) -> Self {
    self.max_attempts = Some(attempts);
    self
  }

  pub fn retry_delay(mut self, delay: Duration) -> Self {
    self.retry_delay = Some(delay);
    self
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn offline_key(mut self, key: impl Into<String>) -> Self {
    self.offline_key = Some(key.into());
    self
  }

  /// Whether this call reads from and writes to the response cache.
  pub fn uses_cache(&self) -> bool {
    self.method.is_read() && !self.no_cache
  }

  /// The client-wide policy with this call's overrides applied.
  pub fn retry_policy(&self, base: &RetryPolicy) -> RetryPolicy {
    RetryPolicy {
      max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
      base_delay: self.retry_delay.unwrap_or(base.base_delay),
      timeout: self.timeout.unwrap_or(base.timeout),
      statuses: base.statuses,
    }
  }
}

/// Join base URL and path, and append params as a query string.
pub fn build_url(base_url: &str, path: &str, params: Option<&Value>) -> Result<Url, ApiError> {
  let mut url = Url::parse(&format!("{}{}", base_url.trim_end_matches('/'), path))
    .map_err(|e| ApiError::Validation(format!("invalid url {}{}: {}", base_url, path, e)))?;

  if let Some(Value::Object(map)) = params {
    if !map.is_empty() {
      let mut pairs = url.query_pairs_mut();
      for (k, v) in map {
        pairs.append_pair(k, &query_value(v));
      }
    }
  }

  Ok(url)
}

fn query_value(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    Value::Null => String::new(),
    other => other.to_string(),
  }
}
