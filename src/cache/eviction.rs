//! Eviction policies.

use std::collections::VecDeque;

use super::traits::EvictionPolicy;

/// Never evicts. Entries live until they expire or the cache is cleared.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unbounded;

impl EvictionPolicy for Unbounded {
  fn on_insert(&mut self, _key: &str) -> Vec<String> {
    Vec::new()
  }

  fn on_access(&mut self, _key: &str) {}

  fn on_remove(&mut self, _key: &str) {}

  fn clear(&mut self) {}
}

/// Least-recently-used eviction with a fixed capacity.
#[derive(Debug, Clone)]
pub struct Lru {
  capacity: usize,
  /// Front is least recently used.
  order: VecDeque<String>,
}

impl Lru {
  pub fn new(capacity: usize) -> Self {
    Self {
      capacity: capacity.max(1),
      order: VecDeque::new(),
    }
  }

  fn touch(&mut self, key: &str) {
    self.forget(key);
    self.order.push_back(key.to_string());
  }

  fn forget(&mut self, key: &str) {
    if let Some(pos) = self.order.iter().position(|k| k == key) {
      self.order.remove(pos);
    }
  }
}

impl EvictionPolicy for Lru {
  fn on_insert(&mut self, key: &str) -> Vec<String> {
    self.touch(key);
    let mut evicted = Vec::new();
    while self.order.len() > self.capacity {
      if let Some(oldest) = self.order.pop_front() {
        evicted.push(oldest);
      }
    }
    evicted
  }

  fn on_access(&mut self, key: &str) {
    self.touch(key);
  }

  fn on_remove(&mut self, key: &str) {
    self.forget(key);
  }

  fn clear(&mut self) {
    self.order.clear();
  }
}
