//! Cache Module
//!
//! Versioned entity cache with subscriptions, TTL cleanup, LRU eviction,
//! prefetching and stale-while-revalidate reads.

mod entry;
mod lru;
mod memory;
mod stats;
mod store;
mod warm;


// Re-export public types
pub use entry::{current_timestamp_ms, shallow_merge, CacheEntry, CacheKey, EntryStatus};
pub use lru::LruTracker;
pub use memory::CacheMemoryManager;
pub use stats::CacheStats;
pub use store::{CacheEvent, CacheStore, Callback, SetOutcome, Subscription};
pub use warm::{CacheInvalidator, CacheWarmer, EndpointResolver, WarmPlan, WarmReport};

pub(crate) use warm::Fetcher;
