//! Deterministic request identities used as cache and dedupe keys.

use std::fmt;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Identity of a logical request.
///
/// Two requests with the same target and the same parameters produce the same
/// identity no matter how their parameter objects were built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestIdentity {
  key: String,
  description: String,
}

impl RequestIdentity {
  /// Identity of a read: `(path, params)`.
  pub fn for_cache(path: &str, params: Option<&Value>) -> Self {
    let description = format!("{}_{}", path, canonical_json(params));
    Self::from_description(description)
  }

  /// Identity of the whole call: method, path, params and body.
  pub fn for_request(method: &str, path: &str, params: Option<&Value>, body: Option<&Value>) -> Self {
    let description = format!(
      "{} {}_{}_{}",
      method.to_uppercase(),
      path,
      canonical_json(params),
      canonical_json(body)
    );
    Self::from_description(description)
  }

  fn from_description(description: String) -> Self {
    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(description.as_bytes());
    let key = hex::encode(hasher.finalize());
    Self { key, description }
  }

  /// Hex digest of the identity.
  pub fn key(&self) -> &str {
    &self.key
  }

  /// Human readable form, for logs.
  pub fn description(&self) -> &str {
    &self.description
  }
}

impl fmt::Display for RequestIdentity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.description)
  }
}

/// Serialize with object keys sorted at every depth. Absent params serialize
/// as `{}`.
pub fn canonical_json(value: Option<&Value>) -> String {
  match value {
    Some(v) => canonicalize(v).to_string(),
    None => "{}".to_string(),
  }
}

fn canonicalize(value: &Value) -> Value {
  match value {
    Value::Object(map) => {
      let mut keys: Vec<&String> = map.keys().collect();
      keys.sort();
      let mut sorted = Map::with_capacity(map.len());
      for k in keys {
        sorted.insert(k.clone(), canonicalize(&map[k]));
      }
      Value::Object(sorted)
    }
    Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
    other => other.clone(),
  }
}
