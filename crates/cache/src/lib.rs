//! `tubewatch-cache`
//!
//! **Responsibility:** the process-wide memo table shared by every worker.
//!
//! - Entries are keyed by [`tubewatch_core::Fingerprint`] and expire after a TTL
//! - At most one computation runs per key; concurrent callers wait for it
//! - Successes are stored, failures are handed to every waiter and then forgotten
//! - Capacity is bounded with least-recently-used eviction

pub mod error;
pub mod manager;
pub mod sweeper;

pub use error::{CacheError, ComputeError};
pub use manager::{CacheConfig, CacheManager, CacheStats, CachedValue};
pub use sweeper::{CacheSweeper, SweeperHandle};
