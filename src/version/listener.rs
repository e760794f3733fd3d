//! # Eviction Listener
//!
//! Background machinery that keeps the local version cache honest. A reader
//! task holds the single pub/sub subscription and forwards notifications into
//! an internal queue; an applier task drains the queue into the
//! [`VersionLocalCache`]. Both are owned by the cache component, started at
//! initialization and stopped at shutdown.

use super::VersionLocalCache;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const QUEUE_CAPACITY: usize = 1024;
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(500);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// An eviction to apply to the local version cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvictionEvent {
    /// Evict a single version key.
    Evict(String),

    /// Evict everything. Sent when the subscription (re)connects or is lost,
    /// since notifications may have been missed in between.
    ClearAll,
}

/// Task that drains eviction events into a [`VersionLocalCache`].
///
/// The applier runs until every sender for its queue is dropped.
pub struct EvictionApplier {
    handle: JoinHandle<()>,
}

impl EvictionApplier {
    /// Spawn the applier, returning it together with the queue sender.
    pub fn spawn(local: Arc<VersionLocalCache>) -> (Self, mpsc::Sender<EvictionEvent>) {
        let (tx, mut rx) = mpsc::channel(QUEUE_CAPACITY);

        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    EvictionEvent::Evict(key) => {
                        if local.remove(&key) {
                            debug!("Evicted {} from local version cache", key);
                        }
                    }
                    EvictionEvent::ClearAll => {
                        local.clear();
                        info!("Cleared local version cache");
                    }
                }
            }
        });

        (Self { handle }, tx)
    }

    /// Wait for the applier to drain and exit. It exits once all senders for
    /// its queue have been dropped.
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

/// The single pub/sub subscription for local-cache invalidation messages.
///
/// Subscribes once at startup and applies each incoming payload (a version
/// key) to the local version cache via the internal queue. The local cache is
/// cleared whenever the subscription is established or lost, because
/// notifications delivered in between cannot be recovered.
pub struct RedisEvictionListener {
    cancel: CancellationToken,
    reader: JoinHandle<()>,
    applier: EvictionApplier,
}

impl RedisEvictionListener {
    /// Start listening on `channel`, applying evictions to `local`.
    pub fn spawn(client: redis::Client, channel: String, local: Arc<VersionLocalCache>) -> Self {
        let (applier, tx) = EvictionApplier::spawn(local);
        let cancel = CancellationToken::new();
        let reader = tokio::spawn(run_reader(client, channel, tx, cancel.clone()));

        Self {
            cancel,
            reader,
            applier,
        }
    }

    /// Signal the listener to stop. Safe to call more than once.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stop the listener and wait for both tasks to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.reader.await;
        self.applier.join().await;
    }
}

async fn run_reader(
    client: redis::Client,
    channel: String,
    tx: mpsc::Sender<EvictionEvent>,
    cancel: CancellationToken,
) {
    let mut delay = INITIAL_RECONNECT_DELAY;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        match subscribe(&client, &channel).await {
            Ok(mut pubsub) => {
                info!("Subscribed to eviction channel {}", channel);
                delay = INITIAL_RECONNECT_DELAY;

                // Anything announced while we were not subscribed was missed.
                if tx.send(EvictionEvent::ClearAll).await.is_err() {
                    return;
                }

                let mut messages = pubsub.on_message();
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        message = messages.next() => match message {
                            Some(message) => match message.get_payload::<String>() {
                                Ok(key) => {
                                    debug!("Received eviction notification for key {}", key);
                                    if tx.send(EvictionEvent::Evict(key)).await.is_err() {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    warn!("Ignoring malformed eviction notification: {}", e);
                                }
                            },
                            // The stream only ends when the connection drops.
                            None => break,
                        }
                    }
                }

                warn!(
                    "Eviction subscription to {} lost; clearing local version cache",
                    channel
                );
                if tx.send(EvictionEvent::ClearAll).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                error!("Failed to subscribe to eviction channel {}: {}", channel, e);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(MAX_RECONNECT_DELAY);
    }
}

async fn subscribe(client: &redis::Client, channel: &str) -> redis::RedisResult<redis::aio::PubSub> {
    let connection = client.get_async_connection().await?;
    let mut pubsub = connection.into_pubsub();
    pubsub.subscribe(channel).await?;
    Ok(pubsub)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_applier_evicts_single_keys() {
        let local = Arc::new(VersionLocalCache::new());
        local.add("orders-getbyid-id=42-version", 3);
        local.add("orders-getbyid-id=43-version", 1);

        let (applier, tx) = EvictionApplier::spawn(local.clone());
        tx.send(EvictionEvent::Evict("orders-getbyid-id=42-version".to_string()))
            .await
            .unwrap();
        drop(tx);
        applier.join().await;

        assert_eq!(local.get("orders-getbyid-id=42-version"), None);
        assert_eq!(local.get("orders-getbyid-id=43-version"), Some(1));
    }

    #[tokio::test]
    async fn test_applier_clears_everything_on_clear_all() {
        let local = Arc::new(VersionLocalCache::new());
        local.add("a-version", 1);
        local.add("b-version", 2);

        let (applier, tx) = EvictionApplier::spawn(local.clone());
        tx.send(EvictionEvent::ClearAll).await.unwrap();
        drop(tx);
        applier.join().await;

        assert!(local.is_empty());
    }

    #[tokio::test]
    async fn test_applier_ignores_evictions_for_unknown_keys() {
        let local = Arc::new(VersionLocalCache::new());

        let (applier, tx) = EvictionApplier::spawn(local.clone());
        tx.send(EvictionEvent::Evict("never-cached-version".to_string()))
            .await
            .unwrap();
        drop(tx);
        applier.join().await;

        assert!(local.is_empty());
    }

    #[tokio::test]
    #[ignore] // Requires a running Redis server
    async fn test_listener_applies_published_evictions() {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let client = redis::Client::open(url.as_str()).unwrap();
        let channel = format!("listener-test-{}", uuid::Uuid::new_v4());

        let local = Arc::new(VersionLocalCache::new());
        let listener = RedisEvictionListener::spawn(client.clone(), channel.clone(), local.clone());

        // Give the subscription a moment to establish, then seed and publish.
        tokio::time::sleep(Duration::from_millis(200)).await;
        local.add("k-version", 5);

        let mut conn = client.get_async_connection().await.unwrap();
        let _: i64 = redis::cmd("PUBLISH")
            .arg(&channel)
            .arg("k-version")
            .query_async(&mut conn)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(local.get("k-version"), None);

        listener.shutdown().await;
    }
}
