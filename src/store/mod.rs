//! # Shared Cache Stores
//!
//! The shared, cross-process store holding cached response payloads and
//! version counters. [`RedisOutputStore`] is the production implementation;
//! [`InMemoryStore`] backs tests and single-process deployments.

pub mod memory;
pub mod redis_store;

pub use memory::InMemoryStore;
pub use redis_store::RedisOutputStore;

use async_trait::async_trait;
use std::time::Duration;

/// The shared cache store contract.
///
/// Every operation is total: implementations catch backend failures, log
/// them, and return the type's neutral default (`None`, `false`, `0`) instead
/// of propagating. A cache outage must degrade a request to a miss or turn an
/// invalidation into a silent no-op, never fail the wrapped handler.
///
/// Construction is the exception: connecting to an unreachable or misconfigured
/// backend at startup is a configuration error and is surfaced.
#[async_trait]
pub trait OutputCacheStore: Send + Sync {
    /// Fetch the raw bytes stored under `key`, or `None` when absent (or the
    /// backend is unavailable).
    async fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Store `value` under `key` with the given time to live. Returns whether
    /// the value was stored. Empty values are refused; there is nothing worth
    /// replaying from an empty entry.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> bool;

    /// Whether an entry exists under `key`.
    async fn exists(&self, key: &str) -> bool;

    /// Delete the given keys, returning how many were removed.
    async fn delete(&self, keys: &[String]) -> i64;

    /// Add `member` to the set stored under `key`. Returns whether the member
    /// was newly added.
    async fn set_add(&self, key: &str, member: &str) -> bool;

    /// Atomically increment the counter under `key` by one, creating it at 1
    /// when absent. Returns the new value, or 0 when the backend is
    /// unavailable.
    async fn incr(&self, key: &str) -> i64;

    /// Return the counter under `key`, atomically initializing it to 1 when
    /// absent.
    ///
    /// The read and the conditional initialization must execute as a single
    /// unit on the server so concurrent first readers cannot clobber each
    /// other's view of version history. Returns 0 when the backend is
    /// unavailable; 0 is never a valid version and callers treat it as
    /// "unknown".
    async fn get_or_incr(&self, key: &str) -> i64;

    /// Publish `message` on `channel`, returning the number of subscribers
    /// that received it.
    async fn publish(&self, channel: &str, message: &str) -> i64;
}
