//! Core traits and types for the response cache.

/// Hook deciding which entries leave the cache when it grows.
///
/// The cache reports every insert, read hit and removal; the policy answers
/// inserts with the keys that must be evicted.
pub trait EvictionPolicy: Send + Sync {
  /// A key was inserted or replaced. Returns keys to evict.
  fn on_insert(&mut self, key: &str) -> Vec<String>;

  /// A fresh entry was served.
  fn on_access(&mut self, key: &str);

  /// An entry was dropped by the cache itself (expiry).
  fn on_remove(&mut self, key: &str);

  /// The cache was cleared.
  fn clear(&mut self);
}

/// Result of a request, with metadata about where the payload came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
}

impl<T> CacheResult<T> {
  /// Fresh data from the network (or a joined in-flight call).
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
    }
  }

  /// Data served from a cache entry still inside its TTL.
  pub fn from_cache(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
    }
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheResult<U> {
    CacheResult {
      data: f(self.data),
      source: self.source,
    }
  }
}

/// Indicates where a payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  Network,
  Cache,
}
