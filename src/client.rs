//! API client with transparent caching, dedupe, retry and offline hand-off.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::{CacheResult, EvictionPolicy, Lru, ResponseCache, Unbounded};
use crate::dedupe::{DedupeKey, InFlight};
use crate::error::ApiError;
use crate::identity::RequestIdentity;
use crate::offline::{Connectivity, OfflineQueue, QueuedRequest};
use crate::request::RequestOptions;
use crate::retry::{Executor, RetryPolicy};
use crate::store::{KeyValueStore, AUTH_TOKEN_KEY};
use crate::transport::{ProgressFn, Transport};
use crate::upload::{UploadFile, UploadLimits, UploadOptions, Uploader};

pub const DEFAULT_BASE_URL: &str = "http://localhost:5001/api";

/// Endpoints fetched by [`ApiClient::preload_critical_data`].
const PRELOAD_PATHS: &[&str] = &["/v1/health", "/v1/user/profile"];

/// Settings for an [`ApiClient`].
#[derive(Debug, Clone)]
pub struct ClientSettings {
  pub base_url: String,
  pub retry: RetryPolicy,
  pub cache_ttl: Duration,
  /// LRU capacity; `None` keeps the cache unbounded
  pub cache_capacity: Option<usize>,
  pub upload: UploadLimits,
  /// Which calls share one in-flight network call
  pub dedupe: DedupeKey,
}

impl Default for ClientSettings {
  fn default() -> Self {
    Self {
      base_url: DEFAULT_BASE_URL.to_string(),
      retry: RetryPolicy::default(),
      cache_ttl: crate::cache::DEFAULT_TTL,
      cache_capacity: None,
      upload: UploadLimits::default(),
      dedupe: DedupeKey::default(),
    }
  }
}

/// Request layer for the backend API.
///
/// Cloning is cheap and clones share the cache, the in-flight table and the
/// store.
#[derive(Clone)]
pub struct ApiClient {
  executor: Arc<Executor>,
  uploader: Arc<Uploader>,
  cache: Arc<ResponseCache>,
  in_flight: InFlight,
  dedupe: DedupeKey,
  store: Arc<dyn KeyValueStore>,
  retry: RetryPolicy,
  connectivity: Option<Connectivity>,
}

impl ApiClient {
  pub fn new(settings: ClientSettings, transport: Arc<dyn Transport>, store: Arc<dyn KeyValueStore>) -> Self {
    let executor = Arc::new(Executor::new(transport, Arc::clone(&store), settings.base_url));
    let policy: Box<dyn EvictionPolicy> = match settings.cache_capacity {
      Some(capacity) => Box::new(Lru::new(capacity)),
      None => Box::new(Unbounded),
    };

    Self {
      uploader: Arc::new(Uploader::new(Arc::clone(&executor), settings.upload)),
      executor,
      cache: Arc::new(ResponseCache::with_policy(settings.cache_ttl, policy)),
      in_flight: InFlight::new(),
      dedupe: settings.dedupe,
      store,
      retry: settings.retry,
      connectivity: None,
    }
  }

  /// Queue writes that fail at transport level while `connectivity` is offline.
  pub fn with_connectivity(mut self, connectivity: Connectivity) -> Self {
    self.connectivity = Some(connectivity);
    self
  }

  pub fn executor(&self) -> &Arc<Executor> {
    &self.executor
  }

  pub fn retry_policy(&self) -> &RetryPolicy {
    &self.retry
  }

  pub fn offline_queue(&self) -> OfflineQueue {
    OfflineQueue::new(Arc::clone(&self.store))
  }

  /// Identity under which a read of `path` with `params` is cached.
  pub fn cache_key(&self, path: &str, params: Option<&Value>) -> RequestIdentity {
    RequestIdentity::for_cache(path, params)
  }

  /// Perform a request and decode the payload into `T`.
  pub async fn request<T: DeserializeOwned>(&self, options: RequestOptions) -> Result<T, ApiError> {
    let result = self.fetch(options).await?;
    serde_json::from_value(result.data).map_err(|e| ApiError::Parse(e.to_string()))
  }

  /// Perform a request, reporting whether the payload came from the cache.
  pub async fn fetch(&self, options: RequestOptions) -> Result<CacheResult<Value>, ApiError> {
    let cache_id = self.cache_key(&options.path, options.params.as_ref());
    let use_cache = options.uses_cache();

    if use_cache {
      if let Some(hit) = self.cache.get(&cache_id, options.cache_ttl) {
        debug!(request = %cache_id, "Cache hit");
        return Ok(CacheResult::from_cache(hit));
      }
    }

    let identity = self.dedupe.identity(&options);
    let policy = options.retry_policy(&self.retry);
    let executor = Arc::clone(&self.executor);
    let cache = Arc::clone(&self.cache);
    let queue = self.offline_queue();
    let connectivity = self.connectivity.clone();
    let offline_key = options
      .offline_key
      .clone()
      .unwrap_or_else(|| {
        // Distinct writes to one path must not overwrite each other in the queue
        let full = DedupeKey::FullRequest.identity(&options);
        format!("{} {} {}", options.method, options.path, &full.key()[..16])
      });

    let pending = self.in_flight.join_or_start(&identity, move || async move {
      let result = executor.execute(&options, &policy).await;
      match &result {
        Ok(payload) if use_cache => cache.put(&cache_id, payload.clone()),
        // Connectivity is read at settlement: it may have dropped mid-retry.
        Err(e) if e.is_transport() && !options.method.is_read() => {
          if connectivity.as_ref().is_some_and(|c| !c.is_online()) {
            info!(key = %offline_key, path = %options.path, "Offline, queueing write for later sync");
            queue.enqueue_request(&offline_key, &QueuedRequest::from_options(&options));
          }
        }
        _ => {}
      }
      result
    });

    pending.await.map(CacheResult::from_network)
  }

  pub async fn get<T: DeserializeOwned>(&self, path: &str, params: Option<Value>) -> Result<T, ApiError> {
    let mut options = RequestOptions::get(path);
    options.params = params;
    self.request(options).await
  }

  pub async fn post<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T, ApiError> {
    self.request(RequestOptions::post(path, body)).await
  }

  pub async fn put<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T, ApiError> {
    self.request(RequestOptions::put(path, body)).await
  }

  pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
    self.request(RequestOptions::delete(path)).await
  }

  /// Upload a file. Not retried and not cached.
  pub async fn upload_file(
    &self,
    file: UploadFile,
    on_progress: Option<ProgressFn>,
    options: UploadOptions,
  ) -> Result<Value, ApiError> {
    self.uploader.upload(file, on_progress, options).await
  }

  pub fn clear_cache(&self) {
    self.cache.clear();
  }

  /// Warm the cache. Failures are logged, never returned.
  pub async fn preload_critical_data(&self) {
    let calls = PRELOAD_PATHS
      .iter()
      .map(|path| self.fetch(RequestOptions::get(*path)));
    let results = futures::future::join_all(calls).await;

    for (path, result) in PRELOAD_PATHS.iter().zip(results) {
      if let Err(e) = result {
        warn!(path, error = %e, "Failed to preload critical data");
      }
    }
  }

  pub fn set_auth_token(&self, token: &str) -> Result<(), ApiError> {
    Ok(self.store.set(AUTH_TOKEN_KEY, token)?)
  }

  pub fn clear_auth_token(&self) -> Result<(), ApiError> {
    Ok(self.store.remove(AUTH_TOKEN_KEY)?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::offline::{ConnectivityState, LifecycleEvent, LogNotifier, ReplayFlusher, SyncManager};
  use crate::retry::tests::{ok, refused, status, FakeTransport};
  use crate::store::MemoryStore;
  use serde::Deserialize;
  use serde_json::json;

  fn client(transport: Arc<FakeTransport>) -> ApiClient {
    let settings = ClientSettings {
      base_url: "http://backend/api".into(),
      retry: RetryPolicy {
        base_delay: Duration::from_millis(10),
        ..Default::default()
      },
      ..Default::default()
    };
    ApiClient::new(settings, transport, Arc::new(MemoryStore::new()))
  }

  #[tokio::test(start_paused = true)]
  async fn test_identical_concurrent_calls_share_one_network_call() {
    let transport = Arc::new(
      FakeTransport::new(vec![ok(json!({"rows": 10}))]).with_latency(Duration::from_millis(100)),
    );
    let api = client(transport.clone());

    let a = api.fetch(RequestOptions::get("/v1/x").with_params(json!({"a": 1})).no_cache());
    let b = api.fetch(RequestOptions::get("/v1/x").with_params(json!({"a": 1})).no_cache());
    let (a, b) = tokio::join!(a, b);

    assert_eq!(a.unwrap().data, json!({"rows": 10}));
    assert_eq!(b.unwrap().data, json!({"rows": 10}));
    assert_eq!(transport.call_count(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_identical_concurrent_calls_share_error() {
    let transport = Arc::new(
      FakeTransport::new(vec![status(404, "Not Found")]).with_latency(Duration::from_millis(100)),
    );
    let api = client(transport.clone());

    let (a, b) = tokio::join!(
      api.fetch(RequestOptions::get("/v1/missing").max_attempts(1)),
      api.fetch(RequestOptions::get("/v1/missing").max_attempts(1))
    );
    assert_eq!(a.unwrap_err().status(), Some(404));
    assert_eq!(b.unwrap_err().status(), Some(404));
    assert_eq!(transport.call_count(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_same_target_with_different_bodies_shares_call() {
    let transport = Arc::new(
      FakeTransport::new(vec![ok(json!({"queued": true}))]).with_latency(Duration::from_millis(100)),
    );
    let api = client(transport.clone());

    let (a, b) = tokio::join!(
      api.fetch(RequestOptions::post("/v1/x", json!({"n": 1})).with_params(json!({"a": 1}))),
      api.fetch(RequestOptions::post("/v1/x", json!({"n": 2})).with_params(json!({"a": 1})))
    );
    assert_eq!(a.unwrap().data, json!({"queued": true}));
    assert_eq!(b.unwrap().data, json!({"queued": true}));
    assert_eq!(transport.call_count(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_full_request_dedupe_keeps_bodies_apart() {
    let transport = Arc::new(
      FakeTransport::new(vec![ok(json!({}))]).with_latency(Duration::from_millis(100)),
    );
    let settings = ClientSettings {
      base_url: "http://backend/api".into(),
      dedupe: DedupeKey::FullRequest,
      ..Default::default()
    };
    let api = ApiClient::new(settings, transport.clone(), Arc::new(MemoryStore::new()));

    let (a, b) = tokio::join!(
      api.fetch(RequestOptions::post("/v1/x", json!({"n": 1})).with_params(json!({"a": 1}))),
      api.fetch(RequestOptions::post("/v1/x", json!({"n": 2})).with_params(json!({"a": 1})))
    );
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(transport.call_count(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cached_read_within_ttl_then_refetch() {
    let transport = Arc::new(FakeTransport::new(vec![ok(json!({"v": 1})), ok(json!({"v": 2}))]));
    let api = client(transport.clone());

    let first = api.fetch(RequestOptions::get("/v1/user/profile")).await.unwrap();
    assert_eq!(first.source, crate::cache::CacheSource::Network);

    tokio::time::advance(Duration::from_secs(60)).await;
    let second = api.fetch(RequestOptions::get("/v1/user/profile")).await.unwrap();
    assert_eq!(second.source, crate::cache::CacheSource::Cache);
    assert_eq!(second.data, json!({"v": 1}));
    assert_eq!(transport.call_count(), 1);

    tokio::time::advance(Duration::from_secs(300)).await;
    let third = api.fetch(RequestOptions::get("/v1/user/profile")).await.unwrap();
    assert_eq!(third.data, json!({"v": 2}));
    assert_eq!(transport.call_count(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_no_cache_and_writes_bypass_cache() {
    let transport = Arc::new(FakeTransport::new(vec![ok(json!({}))]));
    let api = client(transport.clone());

    api.fetch(RequestOptions::get("/v1/x").no_cache()).await.unwrap();
    api.fetch(RequestOptions::get("/v1/x").no_cache()).await.unwrap();
    api.fetch(RequestOptions::post("/v1/x", json!({}))).await.unwrap();
    api.fetch(RequestOptions::post("/v1/x", json!({}))).await.unwrap();
    assert_eq!(transport.call_count(), 4);

    // the no-cache reads did not populate the cache either
    api.fetch(RequestOptions::get("/v1/x")).await.unwrap();
    assert_eq!(transport.call_count(), 5);
  }

  #[tokio::test(start_paused = true)]
  async fn test_clear_cache_forces_refetch() {
    let transport = Arc::new(FakeTransport::new(vec![ok(json!({}))]));
    let api = client(transport.clone());

    api.fetch(RequestOptions::get("/v1/x")).await.unwrap();
    api.clear_cache();
    api.fetch(RequestOptions::get("/v1/x")).await.unwrap();
    assert_eq!(transport.call_count(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_typed_request_and_parse_error() {
    #[derive(Debug, Deserialize, PartialEq)]
    struct Formula {
      formula: String,
    }

    let transport = Arc::new(FakeTransport::new(vec![ok(json!({"formula": "=A1"}))]));
    let api = client(transport);

    let formula: Formula = api
      .post("/v1/formula/generate", json!({"description": "first cell"}))
      .await
      .unwrap();
    assert_eq!(formula.formula, "=A1");

    let err = api
      .post::<Vec<u32>>("/v1/formula/generate", json!({"description": "first cell"}))
      .await
      .unwrap_err();
    assert!(matches!(err, ApiError::Parse(_)));
  }

  #[tokio::test(start_paused = true)]
  async fn test_write_queued_when_offline() {
    let transport = Arc::new(FakeTransport::new(vec![refused()]));
    let connectivity = Connectivity::new(ConnectivityState::Offline);
    let api = client(transport).with_connectivity(connectivity);

    let err = api
      .fetch(RequestOptions::post("/v1/excel/analyze", json!({"data": [1, 2]})).offline_key("analyze-1"))
      .await
      .unwrap_err();
    assert!(err.is_transport());

    let queued = api.offline_queue().get("analyze-1").unwrap();
    assert_eq!(
      queued,
      json!({"method": "POST", "path": "/v1/excel/analyze", "body": {"data": [1, 2]}})
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_write_queued_when_connectivity_drops_mid_call() {
    let transport = Arc::new(FakeTransport::new(vec![refused()]).with_latency(Duration::from_millis(100)));
    let connectivity = Connectivity::new(ConnectivityState::Online);
    let api = client(transport).with_connectivity(connectivity.clone());

    let drop_link = async {
      tokio::time::sleep(Duration::from_millis(50)).await;
      connectivity.set(ConnectivityState::Offline);
    };
    let (result, _) = tokio::join!(
      api.fetch(
        RequestOptions::post("/v1/excel/analyze", json!({"data": [3]}))
          .max_attempts(1)
          .offline_key("analyze-2")
      ),
      drop_link
    );

    assert!(result.unwrap_err().is_transport());
    assert_eq!(
      api.offline_queue().get("analyze-2"),
      Some(json!({"method": "POST", "path": "/v1/excel/analyze", "body": {"data": [3]}}))
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_distinct_offline_writes_get_distinct_default_keys() {
    let transport = Arc::new(FakeTransport::new(vec![refused()]));
    let connectivity = Connectivity::new(ConnectivityState::Offline);
    let api = client(transport).with_connectivity(connectivity);

    assert!(api.post::<Value>("/v1/notes", json!({"text": "a"})).await.is_err());
    assert!(api.post::<Value>("/v1/notes", json!({"text": "b"})).await.is_err());

    let records = api.offline_queue().records().unwrap();
    assert_eq!(records.len(), 2);
    assert_ne!(records[0].key, records[1].key);
    assert!(records[0].key.starts_with("POST /v1/notes "));
  }

  #[tokio::test(start_paused = true)]
  async fn test_offline_write_replayed_on_reconnect() {
    let transport = Arc::new(FakeTransport::new(vec![
      refused(),
      refused(),
      refused(),
      ok(json!({"id": 9})),
    ]));
    let connectivity = Connectivity::new(ConnectivityState::Offline);
    let api = client(transport.clone()).with_connectivity(connectivity.clone());

    let err = api
      .post::<Value>("/v1/excel/analyze", json!({"data": [1, 2]}))
      .await
      .unwrap_err();
    assert!(err.is_transport());
    assert_eq!(transport.call_count(), 3);
    assert_eq!(api.offline_queue().records().unwrap().len(), 1);

    let flusher = Arc::new(ReplayFlusher::new(Arc::clone(api.executor()), api.retry_policy().clone()));
    let manager = SyncManager::new(api.offline_queue(), flusher, Arc::new(LogNotifier), connectivity);
    manager.handle_event(LifecycleEvent::Online).await;

    assert!(manager.is_online());
    assert_eq!(transport.call_count(), 4);
    let calls = transport.calls.lock().unwrap();
    assert_eq!(calls[3].1.url, "http://backend/api/v1/excel/analyze");
    assert_eq!(calls[3].1.body, Some(json!({"data": [1, 2]})));
    assert!(api.offline_queue().records().unwrap().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_nothing_queued_while_online_or_for_reads() {
    let transport = Arc::new(FakeTransport::new(vec![refused()]));
    let connectivity = Connectivity::new(ConnectivityState::Online);
    let api = client(transport).with_connectivity(connectivity.clone());

    assert!(api.post::<Value>("/v1/x", json!({})).await.is_err());
    connectivity.set(ConnectivityState::Offline);
    assert!(api.get::<Value>("/v1/x", None).await.is_err());

    assert!(api.offline_queue().records().unwrap().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_preload_swallows_failures_and_warms_cache() {
    let transport = Arc::new(FakeTransport::new(vec![ok(json!({"status": "ok"})), refused()]));
    let api = client(transport.clone());

    api.preload_critical_data().await;
    let calls_after_preload = transport.call_count();
    assert_eq!(calls_after_preload, 4);

    // the health reply was cached
    let health: Value = api.get("/v1/health", None).await.unwrap();
    assert_eq!(health, json!({"status": "ok"}));
    assert_eq!(transport.call_count(), calls_after_preload);
  }

  #[tokio::test]
  async fn test_auth_token_roundtrip() {
    let transport = Arc::new(FakeTransport::new(vec![ok(json!({}))]));
    let api = client(transport.clone());

    api.set_auth_token("abc").unwrap();
    api.get::<Value>("/v1/a", None).await.unwrap();
    api.clear_auth_token().unwrap();
    api.get::<Value>("/v1/b", None).await.unwrap();

    let calls = transport.calls.lock().unwrap();
    assert!(calls[0].1.headers.iter().any(|(k, v)| k == "Authorization" && v == "Bearer abc"));
    assert!(!calls[1].1.headers.iter().any(|(k, _)| k == "Authorization"));
  }

  #[test]
  fn test_cache_key_matches_for_equal_params() {
    let transport = Arc::new(FakeTransport::new(vec![ok(json!({}))]));
    let api = client(transport);
    assert_eq!(
      api.cache_key("/v1/x", Some(&json!({"a": 1}))),
      api.cache_key("/v1/x", Some(&json!({"a": 1})))
    );
  }
}
