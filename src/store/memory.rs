//! # In-Memory Cache Store
//!
//! A process-local [`OutputCacheStore`] used by tests and single-process
//! deployments. Entries respect their TTL, version counters live in a
//! separate map with no expiry, and published notifications are recorded so
//! tests can assert on fan-out. A `fail_all` switch simulates a hard backend
//! outage: every operation degrades to its neutral default, exactly as the
//! Redis store does when the server is unreachable.

use super::OutputCacheStore;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// A notification recorded by [`InMemoryStore::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub channel: String,
    pub message: String,
}

#[derive(Debug, Clone)]
struct StoredValue {
    data: Vec<u8>,
    expires_at: Instant,
}

impl StoredValue {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-memory implementation of [`OutputCacheStore`].
#[derive(Default)]
pub struct InMemoryStore {
    entries: DashMap<String, StoredValue>,
    counters: DashMap<String, i64>,
    sets: DashMap<String, HashSet<String>>,
    published: Mutex<Vec<PublishedMessage>>,
    fail_all: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a backend outage. While enabled, every operation logs a
    /// failure and returns its neutral default.
    pub fn fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    fn failing(&self, operation: &str, key: &str) -> bool {
        let failing = self.fail_all.load(Ordering::SeqCst);
        if failing {
            error!("Simulated backend failure in {} for key {}", operation, key);
        }
        failing
    }

    /// Notifications published so far, oldest first.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().clone()
    }

    /// Peek at a version counter without creating it.
    pub fn counter(&self, key: &str) -> Option<i64> {
        self.counters.get(key).map(|v| *v)
    }

    /// Number of live (non-expired) value entries.
    pub fn entry_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.value().is_expired()).count()
    }
}

#[async_trait]
impl OutputCacheStore for InMemoryStore {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        if self.failing("get", key) {
            return None;
        }

        // The read guard must be released before removing an expired entry,
        // or the removal would contend with our own shard lock.
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => return Some(entry.data.clone()),
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries.remove(key);
        }

        None
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> bool {
        if self.failing("set", key) {
            return false;
        }

        if value.is_empty() {
            debug!("Refusing to store empty value for key {}", key);
            return false;
        }

        if ttl.is_zero() {
            debug!("Refusing to store already-expired value for key {}", key);
            return false;
        }

        self.entries.insert(
            key.to_string(),
            StoredValue {
                data: value.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        true
    }

    async fn exists(&self, key: &str) -> bool {
        if self.failing("exists", key) {
            return false;
        }

        match self.entries.get(key) {
            Some(entry) => !entry.is_expired(),
            None => false,
        }
    }

    async fn delete(&self, keys: &[String]) -> i64 {
        if keys.is_empty() || self.failing("delete", "<multiple>") {
            return 0;
        }

        let mut removed = 0;
        for key in keys {
            let mut hit = self.entries.remove(key).is_some();
            hit |= self.counters.remove(key).is_some();
            hit |= self.sets.remove(key).is_some();
            if hit {
                removed += 1;
            }
        }

        removed
    }

    async fn set_add(&self, key: &str, member: &str) -> bool {
        if self.failing("set_add", key) {
            return false;
        }

        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string())
    }

    async fn incr(&self, key: &str) -> i64 {
        if self.failing("incr", key) {
            return 0;
        }

        let mut counter = self.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    async fn get_or_incr(&self, key: &str) -> i64 {
        if self.failing("get_or_incr", key) {
            return 0;
        }

        // The entry lock makes read-or-create atomic per key, matching the
        // server-side script semantics of the Redis store.
        *self.counters.entry(key.to_string()).or_insert(1)
    }

    async fn publish(&self, channel: &str, message: &str) -> i64 {
        if self.failing("publish", channel) {
            return 0;
        }

        self.published.lock().push(PublishedMessage {
            channel: channel.to_string(),
            message: message.to_string(),
        });
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let store = InMemoryStore::new();

        assert!(store.set("k", b"value", Duration::from_secs(60)).await);
        assert_eq!(store.get("k").await, Some(b"value".to_vec()));
        assert!(store.exists("k").await);

        assert_eq!(store.delete(&["k".to_string()]).await, 1);
        assert!(!store.exists("k").await);
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let store = InMemoryStore::new();

        assert!(store.set("k", b"value", Duration::from_millis(20)).await);
        assert!(store.exists("k").await);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!store.exists("k").await);
        assert_eq!(store.get("k").await, None);
    }

    #[tokio::test]
    async fn test_empty_and_expired_values_are_refused() {
        let store = InMemoryStore::new();

        assert!(!store.set("k", b"", Duration::from_secs(60)).await);
        assert!(!store.set("k", b"value", Duration::ZERO).await);
        assert!(!store.exists("k").await);
    }

    #[tokio::test]
    async fn test_get_or_incr_initializes_to_one() {
        let store = InMemoryStore::new();

        assert_eq!(store.get_or_incr("v").await, 1);
        assert_eq!(store.get_or_incr("v").await, 1);
        assert_eq!(store.incr("v").await, 2);
        assert_eq!(store.get_or_incr("v").await, 2);
    }

    #[tokio::test]
    async fn test_concurrent_first_readers_agree_on_one() {
        let store = Arc::new(InMemoryStore::new());

        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.get_or_incr("fresh").await }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 1);
        }

        assert_eq!(store.counter("fresh"), Some(1));
    }

    #[tokio::test]
    async fn test_set_add_reports_new_members() {
        let store = InMemoryStore::new();

        assert!(store.set_add("s", "a").await);
        assert!(!store.set_add("s", "a").await);
        assert!(store.set_add("s", "b").await);
    }

    #[tokio::test]
    async fn test_publish_records_notifications() {
        let store = InMemoryStore::new();

        store.publish("chan", "key-1").await;
        store.publish("chan", "key-2").await;

        let published = store.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].message, "key-1");
        assert_eq!(published[1].channel, "chan");
    }

    #[tokio::test]
    async fn test_failing_store_degrades_to_defaults() {
        let store = InMemoryStore::new();
        assert!(store.set("k", b"value", Duration::from_secs(60)).await);

        store.fail_all(true);
        assert_eq!(store.get("k").await, None);
        assert!(!store.exists("k").await);
        assert!(!store.set("k2", b"value", Duration::from_secs(60)).await);
        assert_eq!(store.incr("v").await, 0);
        assert_eq!(store.get_or_incr("v").await, 0);
        assert_eq!(store.publish("chan", "key").await, 0);
        assert_eq!(store.delete(&["k".to_string()]).await, 0);

        // The data is still there once the backend recovers.
        store.fail_all(false);
        assert_eq!(store.get("k").await, Some(b"value".to_vec()));
    }
}
