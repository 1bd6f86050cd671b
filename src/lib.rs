//! Resilient request layer for the Excel AI backend.
//!
//! [`ApiClient`] puts a TTL response cache, in-flight deduplication and
//! retry with exponential backoff in front of every call. Uploads go through
//! a validating, image-downsizing pipeline with progress reporting. Writes
//! that fail while offline land in a durable queue that the
//! [`SyncManager`](offline::SyncManager) replays when connectivity returns.

pub mod cache;
pub mod client;
pub mod config;
pub mod dedupe;
pub mod error;
pub mod identity;
pub mod offline;
pub mod request;
pub mod retry;
pub mod store;
pub mod transport;
pub mod upload;

pub use client::{ApiClient, ClientSettings};
pub use dedupe::DedupeKey;
pub use error::{ApiError, StoreError};
pub use identity::RequestIdentity;
pub use request::{Method, RequestOptions};
pub use retry::{RetryPolicy, RetryStatuses};
