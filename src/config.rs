use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::{ClientSettings, DEFAULT_BASE_URL};
use crate::dedupe::DedupeKey;
use crate::retry::{RetryPolicy, RetryStatuses};
use crate::upload::UploadLimits;

/// Environment variable overriding `api.base_url`.
pub const BASE_URL_ENV: &str = "XLSYNC_API_BASE_URL";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub retry: RetryConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub upload: UploadLimits,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  pub base_url: String,
  /// Per-attempt deadline
  pub timeout_secs: u64,
  /// Which concurrent calls share one network call: `target` or `full_request`
  pub dedupe: DedupeKey,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: DEFAULT_BASE_URL.to_string(),
      timeout_secs: 30,
      dedupe: DedupeKey::Target,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  /// Total attempts per call, including the first
  pub max_attempts: u32,
  pub base_delay_ms: u64,
  /// Which HTTP error statuses are retried: `all` or `transient`
  pub statuses: RetryStatuses,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay_ms: 1000,
      statuses: RetryStatuses::All,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub ttl_secs: u64,
  /// Maximum cached responses (LRU); unbounded when unset
  pub capacity: Option<usize>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl_secs: 300,
      capacity: None,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// SQLite file for the durable store (default: $XDG_DATA_HOME/xlsync/store.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  pub probe_interval_secs: u64,
  pub probe_timeout_secs: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_interval_secs: 15,
      probe_timeout_secs: 5,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./xlsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/xlsync/config.yaml
  ///
  /// With no file found the defaults apply. `XLSYNC_API_BASE_URL` overrides
  /// the base URL either way.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };

    if let Ok(base_url) = std::env::var(BASE_URL_ENV) {
      if !base_url.is_empty() {
        config.api.base_url = base_url;
      }
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("xlsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("xlsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    // An empty file is a valid, all-default config
    if contents.trim().is_empty() {
      return Ok(Config::default());
    }
    serde_yaml::from_str(contents)
  }

  pub fn client_settings(&self) -> ClientSettings {
    ClientSettings {
      base_url: self.api.base_url.clone(),
      retry: RetryPolicy {
        max_attempts: self.retry.max_attempts,
        base_delay: Duration::from_millis(self.retry.base_delay_ms),
        timeout: Duration::from_secs(self.api.timeout_secs),
        statuses: self.retry.statuses,
      },
      cache_ttl: Duration::from_secs(self.cache.ttl_secs),
      cache_capacity: self.cache.capacity,
      upload: self.upload.clone(),
      dedupe: self.api.dedupe,
    }
  }
}
