//! Durable offline records.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use crate::error::StoreError;
use crate::request::{Method, RequestOptions};
use crate::store::{KeyValueStore, OFFLINE_DATA_KEY};

/// A payload persisted for a later sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineRecord {
  pub key: String,
  pub data: Value,
  pub timestamp: DateTime<Utc>,
}

/// A write that could not be sent, stored as an offline record's data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRequest {
  pub method: Method,
  pub path: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub params: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<Value>,
}

impl QueuedRequest {
  pub fn from_options(options: &RequestOptions) -> Self {
    Self {
      method: options.method,
      path: options.path.clone(),
      params: options.params.clone(),
      body: options.body.clone(),
    }
  }

  /// Replays skip the cache; a replayed write has nothing to cache anyway.
  pub fn to_options(&self) -> RequestOptions {
    RequestOptions {
      method: self.method,
      path: self.path.clone(),
      params: self.params.clone(),
      body: self.body.clone(),
      no_cache: true,
      ..Default::default()
    }
  }
}

/// The offline collection, kept as one ordered JSON array under
/// [`OFFLINE_DATA_KEY`].
///
/// Nothing is held in memory: every operation reads the collection back from
/// the store, and writes replace it whole.
#[derive(Clone)]
pub struct OfflineQueue {
  store: Arc<dyn KeyValueStore>,
}

impl OfflineQueue {
  pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
    Self { store }
  }

  /// All records, in stored order.
  pub fn records(&self) -> Result<Vec<OfflineRecord>, StoreError> {
    match self.store.get(OFFLINE_DATA_KEY)? {
      Some(raw) => Ok(serde_json::from_str(&raw)?),
      None => Ok(Vec::new()),
    }
  }

  fn write(&self, records: &[OfflineRecord]) -> Result<(), StoreError> {
    if records.is_empty() {
      return self.store.remove(OFFLINE_DATA_KEY);
    }
    let raw = serde_json::to_string(records)?;
    self.store.set(OFFLINE_DATA_KEY, &raw)
  }

  /// Store `data` under `key`. An existing record with the same key is
  /// replaced where it stands.
  pub fn try_save(&self, key: &str, data: Value) -> Result<(), StoreError> {
    let mut records = self.records()?;
    let record = OfflineRecord {
      key: key.to_string(),
      data,
      timestamp: Utc::now(),
    };

    match records.iter_mut().find(|r| r.key == key) {
      Some(existing) => *existing = record,
      None => records.push(record),
    }
    self.write(&records)
  }

  /// Best-effort save: failures are logged and dropped.
  pub fn save(&self, key: &str, data: Value) {
    match self.try_save(key, data) {
      Ok(()) => debug!(key, "Saved offline data"),
      Err(e) => error!(key, error = %e, "Failed to save offline data"),
    }
  }

  pub fn enqueue_request(&self, key: &str, request: &QueuedRequest) {
    match serde_json::to_value(request) {
      Ok(data) => self.save(key, data),
      Err(e) => error!(key, error = %e, "Failed to serialize queued request"),
    }
  }

  /// Data stored under `key`, if any. Read failures are logged and read as absent.
  pub fn get(&self, key: &str) -> Option<Value> {
    match self.records() {
      Ok(records) => records.into_iter().find(|r| r.key == key).map(|r| r.data),
      Err(e) => {
        error!(key, error = %e, "Failed to get offline data");
        None
      }
    }
  }

  /// Remove the given records. A record that was overwritten since (same key,
  /// newer data or timestamp) is kept.
  pub fn acknowledge(&self, synced: &[OfflineRecord]) -> Result<usize, StoreError> {
    let records = self.records()?;
    let before = records.len();
    let remaining: Vec<OfflineRecord> = records
      .into_iter()
      .filter(|r| !synced.contains(r))
      .collect();
    let removed = before - remaining.len();
    self.write(&remaining)?;
    Ok(removed)
  }

  pub fn clear(&self) -> Result<(), StoreError> {
    self.store.remove(OFFLINE_DATA_KEY)
  }
}
