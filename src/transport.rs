//! HTTP transport boundary.
//!
//! Everything above this module deals in [`HttpRequest`] / [`HttpResponse`];
//! the reqwest implementation is the only place that touches the network.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::error::ApiError;
use crate::request::Method;
use crate::upload::chunked_with_progress;

/// Callback receiving upload progress as a whole percentage (0-100).
pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

/// Chunk size used when streaming upload bodies.
const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// A fully resolved outbound request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
  pub method: Method,
  pub url: String,
  pub headers: Vec<(String, String)>,
  pub body: Option<Value>,
}

/// A multipart upload with a single `file` field.
#[derive(Debug, Clone)]
pub struct UploadRequest {
  pub url: String,
  pub headers: Vec<(String, String)>,
  pub file_name: String,
  pub content_type: String,
  pub bytes: Vec<u8>,
}

/// A response as received, before any interpretation.
#[derive(Debug, Clone)]
pub struct HttpResponse {
  pub status: u16,
  pub status_text: String,
  pub body: Vec<u8>,
}

impl HttpResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Classify a non-2xx reply.
  pub fn error_for_status(self) -> Result<Self, ApiError> {
    if self.is_success() {
      Ok(self)
    } else {
      Err(ApiError::HttpStatus {
        status: self.status,
        status_text: self.status_text,
      })
    }
  }

  /// Decode the body as JSON. An empty body decodes as `null`.
  pub fn json(&self) -> Result<Value, ApiError> {
    if self.body.iter().all(u8::is_ascii_whitespace) {
      return Ok(Value::Null);
    }
    serde_json::from_slice(&self.body).map_err(|e| ApiError::Parse(e.to_string()))
  }
}

/// Trait for anything able to carry requests to the backend.
pub trait Transport: Send + Sync {
  fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, ApiError>>;

  fn upload(
    &self,
    request: UploadRequest,
    progress: Option<ProgressFn>,
  ) -> BoxFuture<'_, Result<HttpResponse, ApiError>>;
}

/// Transport over a shared reqwest client.
#[derive(Clone)]
pub struct ReqwestTransport {
  client: reqwest::Client,
}

impl ReqwestTransport {
  pub fn new() -> Result<Self, ApiError> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("xlsync/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| ApiError::Transport(format!("Failed to create HTTP client: {}", e)))?;
    Ok(Self { client })
  }

  pub fn with_client(client: reqwest::Client) -> Self {
    Self { client }
  }

  async fn read_response(response: reqwest::Response) -> Result<HttpResponse, ApiError> {
    let status = response.status();
    let body = response
      .bytes()
      .await
      .map_err(|e| ApiError::Transport(format!("Failed to read response body: {}", e)))?;

    Ok(HttpResponse {
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or_default().to_string(),
      body: body.to_vec(),
    })
  }
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
  match method {
    Method::Get => reqwest::Method::GET,
    Method::Post => reqwest::Method::POST,
    Method::Put => reqwest::Method::PUT,
    Method::Patch => reqwest::Method::PATCH,
    Method::Delete => reqwest::Method::DELETE,
  }
}

impl Transport for ReqwestTransport {
  fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, ApiError>> {
    async move {
      let mut builder = self
        .client
        .request(to_reqwest_method(request.method), &request.url);
      for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
      }
      if let Some(body) = &request.body {
        builder = builder.body(body.to_string());
      }

      let response = builder
        .send()
        .await
        .map_err(|e| ApiError::Transport(e.to_string()))?;
      Self::read_response(response).await
    }
    .boxed()
  }

  fn upload(
    &self,
    request: UploadRequest,
    progress: Option<ProgressFn>,
  ) -> BoxFuture<'_, Result<HttpResponse, ApiError>> {
    async move {
      let total = request.bytes.len() as u64;
      let stream = chunked_with_progress(request.bytes, UPLOAD_CHUNK_SIZE, progress);
      let part = reqwest::multipart::Part::stream_with_length(reqwest::Body::wrap_stream(stream), total)
        .file_name(request.file_name)
        .mime_str(&request.content_type)
        .map_err(|e| ApiError::Validation(format!("invalid content type: {}", e)))?;
      let form = reqwest::multipart::Form::new().part("file", part);

      let mut builder = self.client.post(&request.url);
      for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
      }

      let response = builder
        .multipart(form)
        .send()
        .await
        .map_err(|e| ApiError::Transport(format!("Upload failed: {}", e)))?;
      Self::read_response(response).await
    }
    .boxed()
  }
}
