//! Durable key-value storage.
//!
//! Values are strings (usually JSON). The offline queue and the auth token
//! live here under well-known keys.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::StoreError;

/// Key under which the offline queue is persisted.
pub const OFFLINE_DATA_KEY: &str = "offlineData";

/// Key under which the bearer token is persisted.
pub const AUTH_TOKEN_KEY: &str = "auth_token";

/// Trait for durable storage backends.
pub trait KeyValueStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

  fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

  fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Read the stored bearer token. Missing, empty or unreadable means no token.
pub fn auth_token(store: &dyn KeyValueStore) -> Option<String> {
  match store.get(AUTH_TOKEN_KEY) {
    Ok(Some(token)) if !token.is_empty() => Some(token),
    Ok(_) => None,
    Err(e) => {
      tracing::warn!(error = %e, "Failed to read auth token, continuing without it");
      None
    }
  }
}
