//! # Version Tracker
//!
//! Coordinates version counter lookups between the process-local L1 cache
//! and the shared store, and owns the bump-then-notify invalidation path.

use super::VersionLocalCache;
use crate::store::OutputCacheStore;
use std::sync::Arc;
use tracing::debug;

/// Two-tier version counter access.
///
/// With local caching enabled, lookups consult the L1 cache first and fall
/// through to the shared store's atomic get-or-increment; bumps go straight
/// to the shared store, evict the local entry eagerly, and then notify peer
/// processes over the configured pub/sub channel.
pub struct VersionTracker {
    store: Arc<dyn OutputCacheStore>,
    local: Arc<VersionLocalCache>,
    /// Pub/sub channel for eviction notifications. `Some` means L1 local
    /// caching is enabled.
    notification_channel: Option<String>,
}

impl VersionTracker {
    pub fn new(
        store: Arc<dyn OutputCacheStore>,
        local: Arc<VersionLocalCache>,
        notification_channel: Option<String>,
    ) -> Self {
        Self {
            store,
            local,
            notification_channel,
        }
    }

    /// Whether L1 local caching of versions is enabled.
    pub fn local_caching_enabled(&self) -> bool {
        self.notification_channel.is_some()
    }

    /// The process-local version cache backing this tracker.
    pub fn local(&self) -> &Arc<VersionLocalCache> {
        &self.local
    }

    /// Current version for `version_key`, initializing it to 1 on first read.
    ///
    /// Returns 0 when the shared store is unavailable and no local value is
    /// cached; callers treat 0 as "unknown" and the resulting key degrades to
    /// a cache miss.
    pub async fn current(&self, version_key: &str) -> i64 {
        if self.local_caching_enabled() {
            if let Some(version) = self.local.get(version_key) {
                // Avoided a network call.
                return version;
            }
        }

        let version = self.store.get_or_incr(version_key).await;

        // 0 means the backend was down. Caching it would pin every future
        // lookup to a dead version until the next eviction.
        if self.local_caching_enabled() && version > 0 {
            self.local.add(version_key, version);
        }

        version
    }

    /// Increment the version under `version_key`, invalidating every cache
    /// entry that embedded the old version.
    ///
    /// The local entry is evicted before publishing so this process never
    /// waits on its own pub/sub echo; remote peers converge when their
    /// notification arrives.
    pub async fn bump(&self, version_key: &str) -> i64 {
        let new_version = self.store.incr(version_key).await;

        if let Some(channel) = &self.notification_channel {
            self.local.remove(version_key);
            let receivers = self.store.publish(channel, version_key).await;
            debug!(
                "Published eviction for {} to {} subscribers",
                version_key, receivers
            );
        }

        new_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn tracker_with_l1(store: Arc<InMemoryStore>) -> VersionTracker {
        VersionTracker::new(
            store,
            Arc::new(VersionLocalCache::new()),
            Some("test-output-cache-invalidate-l1".to_string()),
        )
    }

    #[tokio::test]
    async fn test_current_initializes_fresh_counters_to_one() {
        let store = Arc::new(InMemoryStore::new());
        let tracker = tracker_with_l1(store.clone());

        assert_eq!(tracker.current("orders-getbyid-version").await, 1);
        assert_eq!(store.counter("orders-getbyid-version"), Some(1));
    }

    #[tokio::test]
    async fn test_current_populates_and_prefers_the_local_cache() {
        let store = Arc::new(InMemoryStore::new());
        let tracker = tracker_with_l1(store.clone());

        assert_eq!(tracker.current("k-version").await, 1);
        assert_eq!(tracker.local().get("k-version"), Some(1));

        // A bump performed by another node is not visible until this node's
        // local entry is evicted; the accepted staleness window.
        store.incr("k-version").await;
        assert_eq!(tracker.current("k-version").await, 1);

        tracker.local().remove("k-version");
        assert_eq!(tracker.current("k-version").await, 2);
    }

    #[tokio::test]
    async fn test_current_skips_local_cache_when_disabled() {
        let store = Arc::new(InMemoryStore::new());
        let tracker = VersionTracker::new(store.clone(), Arc::new(VersionLocalCache::new()), None);

        assert_eq!(tracker.current("k-version").await, 1);
        assert!(tracker.local().is_empty());
    }

    #[tokio::test]
    async fn test_bump_evicts_locally_before_publishing() {
        let store = Arc::new(InMemoryStore::new());
        let tracker = tracker_with_l1(store.clone());

        tracker.current("k-version").await;
        assert_eq!(tracker.local().get("k-version"), Some(1));

        assert_eq!(tracker.bump("k-version").await, 2);

        // Evicted synchronously, without waiting for the pub/sub echo.
        assert_eq!(tracker.local().get("k-version"), None);

        let published = store.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].channel, "test-output-cache-invalidate-l1");
        assert_eq!(published[0].message, "k-version");
    }

    #[tokio::test]
    async fn test_bump_without_l1_does_not_publish() {
        let store = Arc::new(InMemoryStore::new());
        let tracker = VersionTracker::new(store.clone(), Arc::new(VersionLocalCache::new()), None);

        assert_eq!(tracker.bump("k-version").await, 1);
        assert!(store.published().is_empty());
    }

    #[tokio::test]
    async fn test_outage_returns_zero_and_never_poisons_the_local_cache() {
        let store = Arc::new(InMemoryStore::new());
        let tracker = tracker_with_l1(store.clone());

        store.fail_all(true);
        assert_eq!(tracker.current("k-version").await, 0);
        assert!(tracker.local().is_empty());

        store.fail_all(false);
        assert_eq!(tracker.current("k-version").await, 1);
    }
}
