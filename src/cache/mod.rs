//! In-memory response cache for read requests.
//!
//! - Entries are keyed by [`RequestIdentity`](crate::identity::RequestIdentity)
//! - Expiry is lazy: a stale entry is dropped when it is next read
//! - Growth is unbounded unless an [`EvictionPolicy`] with a capacity is plugged in

mod eviction;
mod storage;
mod traits;

pub use eviction::{Lru, Unbounded};
pub use storage::{ResponseCache, DEFAULT_TTL};
pub use traits::{CacheResult, CacheSource, EvictionPolicy};
