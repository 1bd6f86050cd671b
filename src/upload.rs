//! File uploads: pre-flight validation, image downsizing and progress.

use std::io::{self, Cursor};
use std::path::Path;
use std::sync::Arc;

use futures::stream::{self, Stream, StreamExt};
use image::{DynamicImage, GenericImageView, ImageFormat, ImageOutputFormat};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::request::build_url;
use crate::retry::Executor;
use crate::transport::{ProgressFn, UploadRequest};

pub const DEFAULT_UPLOAD_ENDPOINT: &str = "/v1/excel/upload";

const SPREADSHEET_TYPES: &[&str] = &[
  "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
  "application/vnd.ms-excel",
  "text/csv",
];

/// Limits applied before and during an upload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UploadLimits {
  /// Files above this size are rejected before sending.
  pub max_file_bytes: u64,
  /// Images above this size are downsized before sending.
  pub compress_threshold_bytes: u64,
  pub max_width: u32,
  pub max_height: u32,
  pub jpeg_quality: u8,
}

impl Default for UploadLimits {
  fn default() -> Self {
    Self {
      max_file_bytes: 16 * 1024 * 1024,
      compress_threshold_bytes: 5 * 1024 * 1024,
      max_width: 1920,
      max_height: 1080,
      jpeg_quality: 80,
    }
  }
}

/// Per-call upload options.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
  /// Overrides [`DEFAULT_UPLOAD_ENDPOINT`]
  pub endpoint: Option<String>,
}

/// A file held in memory, ready to upload.
#[derive(Debug, Clone)]
pub struct UploadFile {
  pub name: String,
  pub content_type: String,
  pub bytes: Vec<u8>,
}

impl UploadFile {
  pub fn new(name: impl Into<String>, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
    Self {
      name: name.into(),
      content_type: content_type.into(),
      bytes,
    }
  }

  /// Read a file from disk, guessing its content type from the extension.
  pub async fn from_path(path: &Path) -> Result<Self, ApiError> {
    let bytes = tokio::fs::read(path)
      .await
      .map_err(|e| ApiError::Validation(format!("cannot read {}: {}", path.display(), e)))?;
    let name = path
      .file_name()
      .map(|n| n.to_string_lossy().into_owned())
      .unwrap_or_else(|| "upload".to_string());
    let content_type = content_type_for(&name).to_string();
    Ok(Self::new(name, content_type, bytes))
  }

  pub fn size(&self) -> u64 {
    self.bytes.len() as u64
  }

  pub fn is_image(&self) -> bool {
    self.content_type.starts_with("image/")
  }
}

/// Content type from a file name's extension.
pub fn content_type_for(name: &str) -> &'static str {
  let ext = Path::new(name)
    .extension()
    .map(|e| e.to_string_lossy().to_lowercase())
    .unwrap_or_default();
  match ext.as_str() {
    "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "xls" => "application/vnd.ms-excel",
    "csv" => "text/csv",
    "jpg" | "jpeg" => "image/jpeg",
    "png" => "image/png",
    _ => "application/octet-stream",
  }
}

/// Pre-flight checks. Nothing that fails here reaches the network.
pub fn validate(file: &UploadFile, limits: &UploadLimits) -> Result<(), ApiError> {
  if file.bytes.is_empty() {
    return Err(ApiError::Validation(format!("{} is empty", file.name)));
  }
  if file.size() > limits.max_file_bytes {
    return Err(ApiError::Validation(format!(
      "{} is {} bytes; files must be at most {} bytes",
      file.name,
      file.size(),
      limits.max_file_bytes
    )));
  }

  let allowed = SPREADSHEET_TYPES.contains(&file.content_type.as_str())
    || file.is_image()
    || file.name.to_lowercase().ends_with(".csv");
  if !allowed {
    return Err(ApiError::Validation(format!(
      "{} has unsupported type {}; upload an Excel file (.xlsx, .xls), a CSV file or an image",
      file.name, file.content_type
    )));
  }

  Ok(())
}

/// Scale `(width, height)` down to fit inside the bounds, keeping the aspect
/// ratio. Sizes already inside the bounds are returned unchanged.
pub fn fit_within(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
  let (mut w, mut h) = (width as f64, height as f64);
  if w > max_width as f64 {
    h = h * max_width as f64 / w;
    w = max_width as f64;
  }
  if h > max_height as f64 {
    w = w * max_height as f64 / h;
    h = max_height as f64;
  }
  ((w.round() as u32).max(1), (h.round() as u32).max(1))
}

/// Decode, downsize and re-encode an image in its original format.
fn downsize_image(bytes: &[u8], limits: &UploadLimits) -> Result<Vec<u8>, image::ImageError> {
  let format = image::guess_format(bytes)?;
  let img = image::load_from_memory_with_format(bytes, format)?;
  let (width, height) = img.dimensions();
  let (target_w, target_h) = fit_within(width, height, limits.max_width, limits.max_height);

  let resized: DynamicImage = if (target_w, target_h) == (width, height) {
    img
  } else {
    img.resize_exact(target_w, target_h, image::imageops::FilterType::Triangle)
  };

  let output = match format {
    ImageFormat::Jpeg => ImageOutputFormat::Jpeg(limits.jpeg_quality),
    _ => ImageOutputFormat::Png,
  };
  // JPEG has no alpha channel
  let resized = if format == ImageFormat::Jpeg {
    DynamicImage::ImageRgb8(resized.to_rgb8())
  } else {
    resized
  };

  let mut out = Cursor::new(Vec::new());
  resized.write_to(&mut out, output)?;
  Ok(out.into_inner())
}

/// Downsize oversized images; everything else passes through untouched.
pub async fn prepare(file: UploadFile, limits: &UploadLimits) -> UploadFile {
  if !file.is_image() || file.size() <= limits.compress_threshold_bytes {
    return file;
  }

  let original_size = file.size();
  let limits = limits.clone();
  let bytes = file.bytes.clone();
  let compressed = tokio::task::spawn_blocking(move || downsize_image(&bytes, &limits)).await;

  match compressed {
    Ok(Ok(bytes)) => {
      info!(
        file = %file.name,
        original_size,
        compressed_size = bytes.len(),
        "Compressed image before upload"
      );
      UploadFile { bytes, ..file }
    }
    Ok(Err(e)) => {
      warn!(file = %file.name, error = %e, "Image compression failed, sending original");
      file
    }
    Err(e) => {
      warn!(file = %file.name, error = %e, "Image compression task failed, sending original");
      file
    }
  }
}

/// Percentage of `total` covered by `loaded`, rounded.
pub fn percent(loaded: u64, total: u64) -> u8 {
  if total == 0 {
    return 100;
  }
  ((loaded as f64 / total as f64) * 100.0).round().min(100.0) as u8
}

/// Split a body into chunks, reporting progress as each chunk is handed to
/// the transport.
pub fn chunked_with_progress(
  bytes: Vec<u8>,
  chunk_size: usize,
  progress: Option<ProgressFn>,
) -> impl Stream<Item = io::Result<Vec<u8>>> + Send + Sync + 'static {
  let total = bytes.len() as u64;
  let chunks: Vec<Vec<u8>> = bytes.chunks(chunk_size.max(1)).map(<[u8]>::to_vec).collect();
  let mut sent = 0u64;

  stream::iter(chunks).map(move |chunk| {
    sent += chunk.len() as u64;
    if let Some(progress) = &progress {
      progress(percent(sent, total));
    }
    Ok(chunk)
  })
}

/// Sends files to the upload endpoint. Not retried, not cached.
pub struct Uploader {
  executor: Arc<Executor>,
  limits: UploadLimits,
}

impl Uploader {
  pub fn new(executor: Arc<Executor>, limits: UploadLimits) -> Self {
    Self { executor, limits }
  }

  pub fn limits(&self) -> &UploadLimits {
    &self.limits
  }

  pub async fn upload(
    &self,
    file: UploadFile,
    on_progress: Option<ProgressFn>,
    options: UploadOptions,
  ) -> Result<Value, ApiError> {
    validate(&file, &self.limits)?;
    let file = prepare(file, &self.limits).await;

    let endpoint = options
      .endpoint
      .as_deref()
      .unwrap_or(DEFAULT_UPLOAD_ENDPOINT);
    let url = build_url(self.executor.base_url(), endpoint, None)?;

    debug!(file = %file.name, size = file.size(), url = %url, "Uploading file");
    let request = UploadRequest {
      url: url.to_string(),
      headers: self.executor.auth_headers(),
      file_name: file.name,
      content_type: file.content_type,
      bytes: file.bytes,
    };

    let response = self
      .executor
      .transport()
      .upload(request, on_progress)
      .await?;
    response.error_for_status()?.json()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::retry::tests::{ok, status, FakeTransport};
  use crate::store::{KeyValueStore, MemoryStore, AUTH_TOKEN_KEY};
  use crate::transport::HttpResponse;
  use image::{ImageBuffer, Rgb};
  use serde_json::json;
  use std::sync::Mutex;

  fn jpeg(width: u32, height: u32) -> Vec<u8> {
    let img = ImageBuffer::from_fn(width, height, |x, y| {
      Rgb([(x % 256) as u8, (y % 256) as u8, ((x ^ y) % 256) as u8])
    });
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
      .write_to(&mut out, ImageOutputFormat::Jpeg(95))
      .unwrap();
    out.into_inner()
  }

  /// Hashed pixel noise; PNG cannot compress it, so the file stays near 3 bytes per pixel.
  fn noise_png(width: u32, height: u32) -> Vec<u8> {
    let img = ImageBuffer::from_fn(width, height, |x, y| {
      let mut h = x.wrapping_mul(73_856_093) ^ y.wrapping_mul(19_349_663);
      h ^= h >> 13;
      h = h.wrapping_mul(0x5bd1_e995);
      h ^= h >> 15;
      let [a, b, c, _] = h.to_le_bytes();
      Rgb([a, b, c])
    });
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
      .write_to(&mut out, ImageOutputFormat::Png)
      .unwrap();
    out.into_inner()
  }

  fn uploader(transport: Arc<FakeTransport>, limits: UploadLimits) -> (Uploader, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let executor = Arc::new(Executor::new(transport, store.clone(), "http://backend/api"));
    (Uploader::new(executor, limits), store)
  }

  #[test]
  fn test_fit_within() {
    assert_eq!(fit_within(4000, 3000, 1920, 1080), (1440, 1080));
    assert_eq!(fit_within(3840, 1080, 1920, 1080), (1920, 540));
    assert_eq!(fit_within(1000, 4000, 1920, 1080), (270, 1080));
    assert_eq!(fit_within(800, 600, 1920, 1080), (800, 600));
  }

  #[test]
  fn test_percent() {
    assert_eq!(percent(0, 200), 0);
    assert_eq!(percent(1, 3), 33);
    assert_eq!(percent(2, 3), 67);
    assert_eq!(percent(200, 200), 100);
    assert_eq!(percent(0, 0), 100);
  }

  #[test]
  fn test_validation() {
    let limits = UploadLimits::default();
    let csv = UploadFile::new("data.csv", "application/octet-stream", b"a,b\n1,2".to_vec());
    assert!(validate(&csv, &limits).is_ok());

    let empty = UploadFile::new("data.xlsx", content_type_for("data.xlsx"), Vec::new());
    assert!(matches!(validate(&empty, &limits), Err(ApiError::Validation(_))));

    let pdf = UploadFile::new("doc.pdf", "application/pdf", vec![1; 10]);
    assert!(matches!(validate(&pdf, &limits), Err(ApiError::Validation(_))));

    let small_limits = UploadLimits {
      max_file_bytes: 4,
      ..Default::default()
    };
    assert!(matches!(validate(&csv, &small_limits), Err(ApiError::Validation(_))));
  }

  #[test]
  fn test_content_type_for() {
    assert_eq!(content_type_for("Report.XLSX"), SPREADSHEET_TYPES[0]);
    assert_eq!(content_type_for("photo.jpg"), "image/jpeg");
    assert_eq!(content_type_for("noext"), "application/octet-stream");
  }

  #[tokio::test]
  async fn test_chunked_progress_reaches_100() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let progress: ProgressFn = Arc::new(move |p: u8| sink.lock().unwrap().push(p));

    let chunks: Vec<_> = chunked_with_progress(vec![0u8; 10], 4, Some(progress))
      .collect()
      .await;

    assert_eq!(chunks.len(), 3);
    assert_eq!(*seen.lock().unwrap(), vec![40, 80, 100]);
  }

  #[tokio::test]
  async fn test_large_jpeg_downsized_before_send() {
    let bytes = jpeg(2400, 1600);
    let limits = UploadLimits {
      compress_threshold_bytes: 1024,
      ..Default::default()
    };
    let transport = Arc::new(FakeTransport::new(vec![ok(json!({"id": 7}))]));
    let (uploader, _) = uploader(transport.clone(), limits);

    let result = uploader
      .upload(UploadFile::new("photo.jpg", "image/jpeg", bytes), None, UploadOptions::default())
      .await
      .unwrap();
    assert_eq!(result, json!({"id": 7}));

    let uploads = transport.uploads.lock().unwrap();
    let sent = image::load_from_memory(&uploads[0].bytes).unwrap();
    assert_eq!(sent.dimensions(), (1620, 1080));
    assert_eq!(uploads[0].url, "http://backend/api/v1/excel/upload");
  }

  #[tokio::test]
  async fn test_default_threshold_downsizes_large_png() {
    let bytes = noise_png(2400, 1200);
    let limits = UploadLimits::default();
    assert!(bytes.len() as u64 > limits.compress_threshold_bytes);

    let transport = Arc::new(FakeTransport::new(vec![ok(json!({}))]));
    let (uploader, _) = uploader(transport.clone(), limits);
    uploader
      .upload(UploadFile::new("scan.png", "image/png", bytes), None, UploadOptions::default())
      .await
      .unwrap();

    let uploads = transport.uploads.lock().unwrap();
    let sent = image::load_from_memory(&uploads[0].bytes).unwrap();
    assert_eq!(sent.dimensions(), (1920, 960));
  }

  #[tokio::test]
  async fn test_default_threshold_keeps_small_jpeg() {
    // oversized dimensions, but under 5 MiB on disk
    let bytes = jpeg(1600, 1200);
    let limits = UploadLimits::default();
    assert!((bytes.len() as u64) < limits.compress_threshold_bytes);

    let transport = Arc::new(FakeTransport::new(vec![ok(json!({}))]));
    let (uploader, _) = uploader(transport.clone(), limits);
    uploader
      .upload(
        UploadFile::new("photo.jpg", "image/jpeg", bytes.clone()),
        None,
        UploadOptions::default(),
      )
      .await
      .unwrap();

    assert_eq!(transport.uploads.lock().unwrap()[0].bytes, bytes);
  }

  #[tokio::test]
  async fn test_small_image_sent_unmodified() {
    let bytes = jpeg(2400, 1600);
    let limits = UploadLimits {
      compress_threshold_bytes: bytes.len() as u64,
      ..Default::default()
    };
    let transport = Arc::new(FakeTransport::new(vec![ok(json!({}))]));
    let (uploader, _) = uploader(transport.clone(), limits);

    uploader
      .upload(
        UploadFile::new("photo.jpg", "image/jpeg", bytes.clone()),
        None,
        UploadOptions::default(),
      )
      .await
      .unwrap();

    assert_eq!(transport.uploads.lock().unwrap()[0].bytes, bytes);
  }

  #[tokio::test]
  async fn test_undecodable_image_falls_back_to_original() {
    let limits = UploadLimits {
      compress_threshold_bytes: 4,
      ..Default::default()
    };
    let file = UploadFile::new("broken.png", "image/png", vec![7; 64]);
    let prepared = prepare(file.clone(), &limits).await;
    assert_eq!(prepared.bytes, file.bytes);
  }

  #[tokio::test]
  async fn test_upload_endpoint_token_and_progress() {
    let transport = Arc::new(FakeTransport::new(vec![ok(json!({"ok": true}))]));
    let (uploader, store) = uploader(transport.clone(), UploadLimits::default());
    store.set(AUTH_TOKEN_KEY, "tok").unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    uploader
      .upload(
        UploadFile::new("a.csv", "text/csv", b"x,y".to_vec()),
        Some(Arc::new(move |p: u8| sink.lock().unwrap().push(p))),
        UploadOptions {
          endpoint: Some("/v1/data/import".into()),
        },
      )
      .await
      .unwrap();

    let uploads = transport.uploads.lock().unwrap();
    assert_eq!(uploads[0].url, "http://backend/api/v1/data/import");
    assert_eq!(
      uploads[0].headers,
      vec![("Authorization".to_string(), "Bearer tok".to_string())]
    );
    assert_eq!(*seen.lock().unwrap(), vec![50, 100]);
  }

  #[tokio::test]
  async fn test_malformed_response_is_parse_error() {
    let transport = Arc::new(FakeTransport::new(vec![Ok(HttpResponse {
      status: 200,
      status_text: "OK".into(),
      body: b"<html>oops</html>".to_vec(),
    })]));
    let (uploader, _) = uploader(transport.clone(), UploadLimits::default());

    let err = uploader
      .upload(UploadFile::new("a.csv", "text/csv", b"1".to_vec()), None, UploadOptions::default())
      .await
      .unwrap_err();
    assert!(matches!(err, ApiError::Parse(_)));
  }

  #[tokio::test]
  async fn test_failed_upload_reported_once() {
    let transport = Arc::new(FakeTransport::new(vec![status(500, "Internal Server Error")]));
    let (uploader, _) = uploader(transport.clone(), UploadLimits::default());

    let err = uploader
      .upload(UploadFile::new("a.csv", "text/csv", b"1".to_vec()), None, UploadOptions::default())
      .await
      .unwrap_err();
    assert_eq!(err.status(), Some(500));
    assert_eq!(transport.uploads.lock().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_validation_never_reaches_transport() {
    let transport = Arc::new(FakeTransport::new(vec![ok(json!({}))]));
    let (uploader, _) = uploader(transport.clone(), UploadLimits::default());

    let err = uploader
      .upload(UploadFile::new("a.csv", "text/csv", Vec::new()), None, UploadOptions::default())
      .await
      .unwrap_err();
    assert!(matches!(err, ApiError::Validation(_)));
    assert!(transport.uploads.lock().unwrap().is_empty());
  }
}
