//! In-flight request deduplication.
//!
//! Concurrent callers with the same [`RequestIdentity`] share one network
//! call. The table entry is removed when that call settles, so the next
//! caller starts fresh.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::ApiError;
use crate::identity::RequestIdentity;
use crate::request::RequestOptions;

/// What makes two concurrent calls the same call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupeKey {
  /// Path and params, the identity the cache uses. Calls that differ only in
  /// method or body are coalesced.
  #[default]
  Target,
  /// Method, path, params and body.
  FullRequest,
}

impl DedupeKey {
  pub fn identity(&self, options: &RequestOptions) -> RequestIdentity {
    match self {
      DedupeKey::Target => RequestIdentity::for_cache(&options.path, options.params.as_ref()),
      DedupeKey::FullRequest => RequestIdentity::for_request(
        options.method.as_str(),
        &options.path,
        options.params.as_ref(),
        options.body.as_ref(),
      ),
    }
  }
}

/// Handle to an in-flight call, cloneable by every caller that joins it.
pub type PendingRequest = Shared<BoxFuture<'static, Result<Value, ApiError>>>;

#[derive(Clone, Default)]
pub struct InFlight {
  pending: Arc<Mutex<HashMap<String, PendingRequest>>>,
}

impl InFlight {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
    lock_table(&self.pending)
  }

  /// Join the pending call for `identity`, or start `make()` as the new one.
  ///
  /// The started call is driven on its own task: it runs to completion even
  /// if every caller stops waiting.
  pub fn join_or_start<F, Fut>(&self, identity: &RequestIdentity, make: F) -> PendingRequest
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value, ApiError>> + Send + 'static,
  {
    let mut pending = self.lock();
    if let Some(existing) = pending.get(identity.key()) {
      debug!(request = %identity, "Joining in-flight request");
      return existing.clone();
    }

    let table = Arc::clone(&self.pending);
    let key = identity.key().to_string();
    let call = make();
    let shared = async move {
      let result = call.await;
      lock_table(&table).remove(&key);
      result
    }
    .boxed()
    .shared();

    pending.insert(identity.key().to_string(), shared.clone());
    drop(pending);

    let driver = shared.clone();
    tokio::spawn(async move {
      let _ = driver.await;
    });

    shared
  }

  /// Number of calls currently in flight.
  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

fn lock_table(
  table: &Mutex<HashMap<String, PendingRequest>>,
) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
  table.lock().unwrap_or_else(|e| e.into_inner())
}
