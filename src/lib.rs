//! # Redis Output Cache
//!
//! A versioned output caching layer for HTTP APIs. Responses produced by
//! expensive read handlers are stored in a shared Redis instance under a
//! deterministic cache key derived from the controller, action, bound
//! argument values, and the negotiated response media type. Write endpoints
//! invalidate cached output by incrementing version counters that are folded
//! into every key, so invalidation never scans or enumerates keys.
//!
//! ## Features
//! - Deterministic, versioned cache keys with per-argument version counters
//! - Fine-grained invalidation: bump one argument value without touching the rest
//! - Two-tier version lookups: process-local L1 cache in front of Redis
//! - Pub/sub fan-out so every node evicts stale local versions
//! - ETag generation and If-None-Match short-circuiting (304 responses)
//! - Graceful degradation: a Redis outage turns into cache misses, never errors
//!
//! ## Architecture
//! The crate is layered the same way requests flow through it:
//! 1. **Manager**: the request-time state machine (serve from cache, store, invalidate)
//! 2. **Key Generator**: derives the full versioned cache key for a request
//! 3. **Version Tracker**: version counter lookups and bumps, L1 + shared store
//! 4. **Stores**: Redis and in-memory implementations of the shared store
//! 5. **Listener**: background pub/sub task applying remote evictions
//!
//! ## Usage Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use redis_output_cache::{
//!     CachePolicy, OutputCacheManager, ParameterDescriptor, RedisOutputStore,
//!     RequestDescriptor,
//! };
//!
//! # async fn example() -> redis_output_cache::Result<()> {
//! let store = Arc::new(RedisOutputStore::new("redis://127.0.0.1:6379").await?);
//!
//! let manager = OutputCacheManager::builder(store)
//!     .register_action(
//!         "Orders",
//!         "GetById",
//!         vec![ParameterDescriptor::simple("id")],
//!         CachePolicy::new(Duration::from_secs(3600), Duration::from_secs(120)),
//!     )
//!     .build()?;
//!
//! let request = RequestDescriptor::get("Orders", "GetById")
//!     .with_argument("id", "42".into());
//! let lookup = manager.try_serve_from_cache(&request).await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod key_generator;
pub mod manager;
pub mod store;
pub mod types;
pub mod version;

pub use config::{CachePolicy, CacheTime, InvalidationRule, OutputCacheConfig, PolicyRegistry};
pub use key_generator::{CacheKeyGenerator, CatchallKeyGenerator, DEFAULT_MEDIA_TYPE};
pub use manager::{OutputCacheManager, OutputCacheManagerBuilder};
pub use store::{InMemoryStore, OutputCacheStore, RedisOutputStore};
pub use types::{
    ArgumentValue, CacheHeaders, CacheLookup, CachedResponse, FieldValue, HandlerResponse,
    KeyFieldSource, ParameterDescriptor, ParameterKind, PendingCacheEntry, RequestDescriptor,
    StoreOutcome,
};
pub use version::{
    EvictionApplier, EvictionEvent, RedisEvictionListener, VersionLocalCache, VersionTracker,
};

/// Result type for fallible, configuration-time operations.
///
/// Runtime store operations never surface errors (see [`store::OutputCacheStore`]);
/// this type is used where a failure indicates a deployment mistake that must
/// be visible at startup.
pub type Result<T> = std::result::Result<T, OutputCacheError>;

/// Output-cache error types.
#[derive(Debug, thiserror::Error)]
pub enum OutputCacheError {
    #[error("Cache configuration error: {message}")]
    Configuration { message: String },

    #[error("Invalidation target error: {message}")]
    InvalidationTarget { message: String },

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl OutputCacheError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an invalidation target error.
    pub fn invalidation_target(message: impl Into<String>) -> Self {
        Self::InvalidationTarget {
            message: message.into(),
        }
    }
}
