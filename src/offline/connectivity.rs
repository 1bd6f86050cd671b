//! Connectivity state and the health-probe monitor that drives it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::sync::LifecycleEvent;
use crate::error::ApiError;
use crate::request::RequestOptions;
use crate::retry::{Executor, RetryPolicy};

pub const HEALTH_PATH: &str = "/v1/health";

/// Shortest probe interval; shorter (including zero) intervals are raised to it.
pub const MIN_PROBE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
  Online,
  Offline,
}

#[derive(Debug)]
struct Inner {
  online: AtomicBool,
  last_changed: Mutex<Option<DateTime<Utc>>>,
}

/// Shared online/offline flag.
#[derive(Debug, Clone)]
pub struct Connectivity {
  inner: Arc<Inner>,
}

impl Connectivity {
  pub fn new(state: ConnectivityState) -> Self {
    Self {
      inner: Arc::new(Inner {
        online: AtomicBool::new(state == ConnectivityState::Online),
        last_changed: Mutex::new(None),
      }),
    }
  }

  pub fn is_online(&self) -> bool {
    self.inner.online.load(Ordering::SeqCst)
  }

  pub fn state(&self) -> ConnectivityState {
    if self.is_online() {
      ConnectivityState::Online
    } else {
      ConnectivityState::Offline
    }
  }

  /// Record `state`. Returns true if this was a transition.
  pub fn set(&self, state: ConnectivityState) -> bool {
    let online = state == ConnectivityState::Online;
    let changed = self.inner.online.swap(online, Ordering::SeqCst) != online;
    if changed {
      let mut last = self
        .inner
        .last_changed
        .lock()
        .unwrap_or_else(|e| e.into_inner());
      *last = Some(Utc::now());
    }
    changed
  }

  pub fn last_changed(&self) -> Option<DateTime<Utc>> {
    *self
      .inner
      .last_changed
      .lock()
      .unwrap_or_else(|e| e.into_inner())
  }
}

impl Default for Connectivity {
  fn default() -> Self {
    Self::new(ConnectivityState::Online)
  }
}

/// Polls the health endpoint and reports connectivity changes as events.
///
/// Any HTTP reply, even an error status, means the backend is reachable.
pub struct ConnectivityMonitor {
  executor: Arc<Executor>,
  interval: Duration,
  probe_timeout: Duration,
}

impl ConnectivityMonitor {
  pub fn new(executor: Arc<Executor>, interval: Duration, probe_timeout: Duration) -> Self {
    if interval < MIN_PROBE_INTERVAL {
      warn!(
        interval_ms = interval.as_millis() as u64,
        "Probe interval too short, using {}s",
        MIN_PROBE_INTERVAL.as_secs()
      );
    }
    Self {
      executor,
      interval: interval.max(MIN_PROBE_INTERVAL),
      probe_timeout,
    }
  }

  pub fn interval(&self) -> Duration {
    self.interval
  }

  /// One probe, no retries.
  pub async fn probe(&self) -> ConnectivityState {
    let policy = RetryPolicy {
      max_attempts: 1,
      timeout: self.probe_timeout,
      ..Default::default()
    };
    let options = RequestOptions::get(HEALTH_PATH).no_cache();

    match self.executor.execute(&options, &policy).await {
      Ok(_) | Err(ApiError::HttpStatus { .. }) | Err(ApiError::Parse(_)) => ConnectivityState::Online,
      Err(e) => {
        debug!(error = %e, "Health probe failed");
        ConnectivityState::Offline
      }
    }
  }

  /// Probe every interval; send an event whenever the observed state differs
  /// from `connectivity`. Stops when the receiver is dropped.
  pub fn spawn(self, connectivity: Connectivity, tx: mpsc::UnboundedSender<LifecycleEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(self.interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        let observed = self.probe().await;
        if observed == connectivity.state() {
          continue;
        }
        let event = match observed {
          ConnectivityState::Online => LifecycleEvent::Online,
          ConnectivityState::Offline => LifecycleEvent::Offline,
        };
        if tx.send(event).is_err() {
          break;
        }
      }
    })
  }
}
