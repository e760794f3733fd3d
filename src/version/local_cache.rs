//! # Local Version Cache
//!
//! A process-local map from version key to version number, used as an L1
//! cache to avoid a network round-trip on every version lookup. It is a
//! best-effort accelerator only: the shared store remains the source of
//! truth, and any entry here may be evicted at any moment by an invalidation
//! notification or a connectivity-triggered clear.

use dashmap::DashMap;

/// Concurrency-safe map from version key to version number.
///
/// Safe for concurrent use from any number of request tasks without external
/// locking. An empty or blank key is a caller bug, not an environmental
/// condition, and panics immediately instead of degrading.
#[derive(Debug, Default)]
pub struct VersionLocalCache {
    cache: DashMap<String, i64>,
}

impl VersionLocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_key(key: &str) {
        assert!(
            !key.trim().is_empty(),
            "version cache key cannot be empty or whitespace"
        );
    }

    /// Store the version for `key`, overwriting any existing value. Returns
    /// the stored value.
    pub fn add(&self, key: &str, value: i64) -> i64 {
        Self::check_key(key);
        self.cache.insert(key.to_string(), value);
        value
    }

    /// The cached version for `key`, if any.
    pub fn get(&self, key: &str) -> Option<i64> {
        Self::check_key(key);
        self.cache.get(key).map(|v| *v)
    }

    /// Evict `key`, returning whether an entry was present.
    pub fn remove(&self, key: &str) -> bool {
        Self::check_key(key);
        self.cache.remove(key).is_some()
    }

    /// Evict everything. Used when shared-store connectivity is lost or
    /// regained, since entries can no longer be trusted.
    pub fn clear(&self) {
        self.cache.clear();
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_add_get_remove_roundtrip() {
        let cache = VersionLocalCache::new();

        assert_eq!(cache.add("orders-getbyid-version", 3), 3);
        assert_eq!(cache.get("orders-getbyid-version"), Some(3));
        assert!(cache.remove("orders-getbyid-version"));
        assert_eq!(cache.get("orders-getbyid-version"), None);
        assert!(!cache.remove("orders-getbyid-version"));
    }

    #[test]
    fn test_add_overwrites_existing_value() {
        let cache = VersionLocalCache::new();

        cache.add("k", 1);
        assert_eq!(cache.add("k", 7), 7);
        assert_eq!(cache.get("k"), Some(7));
    }

    #[test]
    fn test_clear_empties_the_cache() {
        let cache = VersionLocalCache::new();

        cache.add("a", 1);
        cache.add("b", 2);
        assert_eq!(cache.len(), 2);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    #[should_panic(expected = "cannot be empty")]
    fn test_blank_key_on_add_is_a_caller_bug() {
        VersionLocalCache::new().add("   ", 1);
    }

    #[test]
    #[should_panic(expected = "cannot be empty")]
    fn test_empty_key_on_get_is_a_caller_bug() {
        VersionLocalCache::new().get("");
    }

    #[test]
    #[should_panic(expected = "cannot be empty")]
    fn test_empty_key_on_remove_is_a_caller_bug() {
        VersionLocalCache::new().remove("");
    }

    #[tokio::test]
    async fn test_concurrent_access_from_many_tasks() {
        let cache = Arc::new(VersionLocalCache::new());

        let mut handles = Vec::new();
        for i in 0..32 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                let key = format!("key-{}", i % 4);
                cache.add(&key, i);
                cache.get(&key);
                cache.remove(&key);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        // Every key was removed by whichever task touched it last.
        for i in 0..4 {
            let _ = cache.get(&format!("key-{}", i));
        }
    }
}
