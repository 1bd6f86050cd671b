//! Sync manager: connectivity transitions, lifecycle notifications and
//! replay of the offline queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use super::connectivity::{Connectivity, ConnectivityState};
use super::queue::{OfflineQueue, OfflineRecord, QueuedRequest};
use crate::error::ApiError;
use crate::retry::{Executor, RetryPolicy};

/// Environment signals the manager reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
  Online,
  Offline,
  /// The application can be installed locally.
  InstallPromptAvailable,
  /// A new version of the application took over.
  UpdateAvailable,
}

/// Sinks for the user-facing lifecycle notifications.
pub trait Notifier: Send + Sync {
  fn connectivity_lost(&self);

  fn connectivity_restored(&self);

  fn update_available(&self);
}

/// Notifier that writes the notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
  fn connectivity_lost(&self) {
    warn!("You're offline. Some features may be limited.");
  }

  fn connectivity_restored(&self) {
    info!("Back online! All features restored.");
  }

  fn update_available(&self) {
    info!("App updated! Please refresh to get the latest version.");
  }
}

/// Replays a batch of offline records. All-or-nothing: an error means none
/// of the records may be considered synced.
pub trait Flusher: Send + Sync {
  fn flush<'a>(&'a self, records: &'a [OfflineRecord]) -> BoxFuture<'a, Result<(), ApiError>>;
}

/// Re-issues queued requests in stored order. Records that are not queued
/// requests are caller-owned state and count as synced once seen.
pub struct ReplayFlusher {
  executor: Arc<Executor>,
  policy: RetryPolicy,
}

impl ReplayFlusher {
  pub fn new(executor: Arc<Executor>, policy: RetryPolicy) -> Self {
    Self { executor, policy }
  }
}

impl Flusher for ReplayFlusher {
  fn flush<'a>(&'a self, records: &'a [OfflineRecord]) -> BoxFuture<'a, Result<(), ApiError>> {
    async move {
      for record in records {
        match serde_json::from_value::<QueuedRequest>(record.data.clone()) {
          Ok(request) => {
            debug!(key = %record.key, method = %request.method, path = %request.path, "Replaying request");
            self
              .executor
              .execute(&request.to_options(), &self.policy)
              .await?;
          }
          Err(_) => debug!(key = %record.key, "Synced offline state"),
        }
      }
      Ok(())
    }
    .boxed()
  }
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
  /// Nothing was pending.
  Empty,
  /// Another pass was already running.
  Skipped,
  /// This many records were replayed and removed.
  Synced(usize),
}

/// Snapshot of the connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkStatus {
  pub online: bool,
  pub last_changed: Option<DateTime<Utc>>,
}

pub struct SyncManager {
  queue: OfflineQueue,
  flusher: Arc<dyn Flusher>,
  notifier: Arc<dyn Notifier>,
  connectivity: Connectivity,
  install_prompt: AtomicBool,
  syncing: Mutex<()>,
}

impl SyncManager {
  pub fn new(
    queue: OfflineQueue,
    flusher: Arc<dyn Flusher>,
    notifier: Arc<dyn Notifier>,
    connectivity: Connectivity,
  ) -> Self {
    Self {
      queue,
      flusher,
      notifier,
      connectivity,
      install_prompt: AtomicBool::new(false),
      syncing: Mutex::new(()),
    }
  }

  pub fn queue(&self) -> &OfflineQueue {
    &self.queue
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  pub fn is_online(&self) -> bool {
    self.connectivity.is_online()
  }

  pub fn network_status(&self) -> NetworkStatus {
    NetworkStatus {
      online: self.connectivity.is_online(),
      last_changed: self.connectivity.last_changed(),
    }
  }

  /// Best-effort persist of caller state for a later sync.
  pub fn save_offline_data(&self, key: &str, data: Value) {
    self.queue.save(key, data);
  }

  pub fn get_offline_data(&self, key: &str) -> Option<Value> {
    self.queue.get(key)
  }

  pub fn pending_records(&self) -> Result<Vec<OfflineRecord>, ApiError> {
    Ok(self.queue.records()?)
  }

  pub fn can_install(&self) -> bool {
    self.install_prompt.load(Ordering::SeqCst)
  }

  /// Consume the install prompt. Returns false if none was available.
  pub fn take_install_prompt(&self) -> bool {
    self.install_prompt.swap(false, Ordering::SeqCst)
  }

  /// React to one environment signal.
  pub async fn handle_event(&self, event: LifecycleEvent) {
    match event {
      LifecycleEvent::Online => {
        if !self.connectivity.set(ConnectivityState::Online) {
          return;
        }
        info!("Connectivity restored");
        self.notifier.connectivity_restored();
        if let Err(e) = self.sync_pending_data().await {
          error!(error = %e, "Failed to sync offline data");
        }
      }
      LifecycleEvent::Offline => {
        if !self.connectivity.set(ConnectivityState::Offline) {
          return;
        }
        info!("Connectivity lost");
        self.notifier.connectivity_lost();
      }
      LifecycleEvent::InstallPromptAvailable => {
        debug!("Install prompt available");
        self.install_prompt.store(true, Ordering::SeqCst);
      }
      LifecycleEvent::UpdateAvailable => {
        self.notifier.update_available();
      }
    }
  }

  /// Replay everything pending and remove what was replayed.
  ///
  /// Records saved while the replay runs are left for the next pass. A failed
  /// flush leaves every record in place.
  pub async fn sync_pending_data(&self) -> Result<SyncOutcome, ApiError> {
    let Ok(_guard) = self.syncing.try_lock() else {
      debug!("Sync already in progress");
      return Ok(SyncOutcome::Skipped);
    };

    let records = self.queue.records()?;
    if records.is_empty() {
      return Ok(SyncOutcome::Empty);
    }

    let keys: Vec<&str> = records.iter().map(|r| r.key.as_str()).collect();
    info!(count = records.len(), keys = ?keys, "Syncing pending data");

    self.flusher.flush(&records).await?;
    let removed = self.queue.acknowledge(&records)?;
    info!(removed, "Offline data synced");
    Ok(SyncOutcome::Synced(removed))
  }

  /// Handle events until the channel closes.
  pub async fn run(&self, mut events: mpsc::UnboundedReceiver<LifecycleEvent>) {
    while let Some(event) = events.recv().await {
      self.handle_event(event).await;
    }
  }
}
