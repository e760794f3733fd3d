//! # Version Counters
//!
//! Versioned invalidation machinery. Every cache key folds in version
//! counters owned by the shared store; bumping a counter silently orphans the
//! cached entries that embedded the old version. [`VersionLocalCache`] is a
//! process-local L1 accelerator for counter lookups, [`VersionTracker`]
//! coordinates it with the shared store, and the listener applies eviction
//! notifications from other nodes.

pub mod listener;
pub mod local_cache;
pub mod tracker;

pub use listener::{EvictionApplier, EvictionEvent, RedisEvictionListener};
pub use local_cache::VersionLocalCache;
pub use tracker::VersionTracker;
