//! TTL response cache.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use super::eviction::Unbounded;
use super::traits::EvictionPolicy;
use crate::identity::RequestIdentity;

/// Default time-to-live for cached payloads.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// A single cached payload.
#[derive(Debug, Clone)]
struct CacheEntry {
  payload: Value,
  stored_at: Instant,
}

struct Inner {
  entries: HashMap<String, CacheEntry>,
  policy: Box<dyn EvictionPolicy>,
}

/// Cache of successful read responses.
///
/// Entries are replaced wholesale on `put` and dropped lazily when a read
/// finds them older than the TTL in effect for that read.
pub struct ResponseCache {
  inner: Mutex<Inner>,
  default_ttl: Duration,
}

impl ResponseCache {
  /// Unbounded cache with the default 5 minute TTL.
  pub fn new() -> Self {
    Self::with_policy(DEFAULT_TTL, Box::new(Unbounded))
  }

  pub fn with_policy(default_ttl: Duration, policy: Box<dyn EvictionPolicy>) -> Self {
    Self {
      inner: Mutex::new(Inner {
        entries: HashMap::new(),
        policy,
      }),
      default_ttl,
    }
  }

  pub fn default_ttl(&self) -> Duration {
    self.default_ttl
  }

  fn lock(&self) -> MutexGuard<'_, Inner> {
    // Entries are plain data; a panic mid-update cannot leave them torn.
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Look up a payload. `ttl` overrides the default for this read only.
  pub fn get(&self, identity: &RequestIdentity, ttl: Option<Duration>) -> Option<Value> {
    let ttl = ttl.unwrap_or(self.default_ttl);
    let mut inner = self.lock();
    let key = identity.key();

    let fresh = match inner.entries.get(key) {
      Some(entry) => entry.stored_at.elapsed() < ttl,
      None => return None,
    };

    if fresh {
      inner.policy.on_access(key);
      inner.entries.get(key).map(|e| e.payload.clone())
    } else {
      inner.entries.remove(key);
      inner.policy.on_remove(key);
      None
    }
  }

  /// Store a payload, replacing any previous entry for the identity.
  pub fn put(&self, identity: &RequestIdentity, payload: Value) {
    let mut inner = self.lock();
    let key = identity.key().to_string();
    inner.entries.insert(
      key.clone(),
      CacheEntry {
        payload,
        stored_at: Instant::now(),
      },
    );
    let evicted = inner.policy.on_insert(&key);
    for k in evicted {
      inner.entries.remove(&k);
    }
  }

  pub fn clear(&self) {
    let mut inner = self.lock();
    inner.entries.clear();
    inner.policy.clear();
  }

  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl Default for ResponseCache {
  fn default() -> Self {
    Self::new()
  }
}
