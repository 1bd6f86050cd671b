//! Offline support.
//!
//! Writes that cannot reach the backend are persisted in the durable store
//! and replayed, in stored order, when connectivity comes back. The sync is
//! all-or-nothing per pass; the [`Flusher`] trait is the seam for anything
//! finer grained.

mod connectivity;
mod queue;
mod sync;

pub use connectivity::{
  Connectivity, ConnectivityMonitor, ConnectivityState, HEALTH_PATH, MIN_PROBE_INTERVAL,
};
pub use queue::{OfflineQueue, OfflineRecord, QueuedRequest};
pub use sync::{
  Flusher, LifecycleEvent, LogNotifier, NetworkStatus, Notifier, ReplayFlusher, SyncManager,
  SyncOutcome,
};
