//! Subscriber registry and fan-out.
//!
//! Broadcast walks the live set under the shared read lock and hands each
//! open subscriber the same pre-encoded frame with a non-blocking
//! `try_send`. A subscriber whose queue is full loses that frame and is
//! evicted once the read lock has been released, so one stalled client
//! never holds up delivery to the rest.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Utf8Bytes;
use uuid::Uuid;

use crate::error::EnqueueError;
use crate::subscriber::Subscriber;

/// Registry counters, read via [`SubscriberRegistry::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub active_subscribers: usize,
    pub subscribers_registered: u64,
    pub subscribers_unregistered: u64,
    pub subscribers_evicted: u64,
    pub frames_enqueued: u64,
    pub frames_dropped: u64,
}

/// Lock-free counters updated on the broadcast path.
#[derive(Default)]
struct AtomicRegistryStats {
    registered: AtomicU64,
    unregistered: AtomicU64,
    evicted: AtomicU64,
    enqueued: AtomicU64,
    dropped: AtomicU64,
}

/// The set of currently registered subscribers.
#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: RwLock<HashMap<Uuid, Arc<Subscriber>>>,
    stats: AtomicRegistryStats,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber. Returns `false` if it was already registered.
    pub async fn register(&self, subscriber: Arc<Subscriber>) -> bool {
        let id = subscriber.id();
        let mut subscribers = self.subscribers.write().await;
        if subscribers.contains_key(&id) {
            return false;
        }
        subscribers.insert(id, subscriber);
        self.stats.registered.fetch_add(1, Ordering::Relaxed);
        log::debug!("Registered subscriber {id} ({} live)", subscribers.len());
        true
    }

    /// Remove a subscriber. Unknown ids are ignored.
    pub async fn unregister(&self, id: Uuid) -> Option<Arc<Subscriber>> {
        let mut subscribers = self.subscribers.write().await;
        let removed = subscribers.remove(&id);
        if removed.is_some() {
            self.stats.unregistered.fetch_add(1, Ordering::Relaxed);
            log::debug!("Unregistered subscriber {id} ({} live)", subscribers.len());
        }
        removed
    }

    /// Queue `frame` on every open subscriber.
    ///
    /// Returns how many subscribers accepted the frame.
    pub async fn broadcast(&self, frame: &Utf8Bytes) -> usize {
        let mut delivered = 0;
        let mut laggards = Vec::new();

        {
            let subscribers = self.subscribers.read().await;
            for subscriber in subscribers.values() {
                if !subscriber.is_open() {
                    continue;
                }
                match subscriber.enqueue(frame.clone()) {
                    Ok(()) => delivered += 1,
                    Err(EnqueueError::Full) => {
                        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                        laggards.push(subscriber.clone());
                    }
                    Err(EnqueueError::Closed) => {}
                }
            }
        }

        self.stats
            .enqueued
            .fetch_add(delivered as u64, Ordering::Relaxed);

        for subscriber in laggards {
            if subscriber.close().await {
                self.stats.evicted.fetch_add(1, Ordering::Relaxed);
                log::warn!("Evicted subscriber {} (outbound queue full)", subscriber.id());
            }
        }

        delivered
    }

    pub async fn len(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.subscribers.read().await.is_empty()
    }

    pub async fn contains(&self, id: Uuid) -> bool {
        self.subscribers.read().await.contains_key(&id)
    }

    /// Ids of every registered subscriber.
    pub async fn ids(&self) -> Vec<Uuid> {
        self.subscribers.read().await.keys().copied().collect()
    }

    pub async fn stats(&self) -> RegistryStats {
        let active_subscribers = self.subscribers.read().await.len();
        RegistryStats {
            active_subscribers,
            subscribers_registered: self.stats.registered.load(Ordering::Relaxed),
            subscribers_unregistered: self.stats.unregistered.load(Ordering::Relaxed),
            subscribers_evicted: self.stats.evicted.load(Ordering::Relaxed),
            frames_enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            frames_dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::Outbox;
    use std::time::Duration;
    use tokio::time::timeout;

    fn frame(text: &str) -> Utf8Bytes {
        text.to_string().into()
    }

    async fn registered(
        registry: &Arc<SubscriberRegistry>,
        capacity: usize,
    ) -> (Arc<Subscriber>, Outbox) {
        let (sub, outbox) = Subscriber::new(registry.clone(), capacity, None);
        assert!(registry.register(sub.clone()).await);
        (sub, outbox)
    }

    #[tokio::test]
    async fn test_register_unregister() {
        let registry = Arc::new(SubscriberRegistry::new());
        let (sub, _outbox) = registered(&registry, 4).await;

        assert_eq!(registry.len().await, 1);
        assert!(registry.contains(sub.id()).await);
        assert!(!registry.register(sub.clone()).await);
        assert_eq!(registry.len().await, 1);

        assert!(registry.unregister(sub.id()).await.is_some());
        assert!(registry.unregister(sub.id()).await.is_none());
        assert!(registry.is_empty().await);

        let stats = registry.stats().await;
        assert_eq!(stats.subscribers_registered, 1);
        assert_eq!(stats.subscribers_unregistered, 1);
    }

    #[tokio::test]
    async fn test_broadcast_fan_out_in_order() {
        let registry = Arc::new(SubscriberRegistry::new());
        let (_a, mut rx_a) = registered(&registry, 16).await;
        let (_b, mut rx_b) = registered(&registry, 16).await;
        let (_c, mut rx_c) = registered(&registry, 16).await;

        for i in 0..10 {
            assert_eq!(registry.broadcast(&frame(&format!("e{i}"))).await, 3);
        }

        for rx in [&mut rx_a, &mut rx_b, &mut rx_c] {
            for i in 0..10 {
                assert_eq!(rx.recv().await.unwrap().as_str(), format!("e{i}"));
            }
            assert!(rx.try_recv().is_none());
        }

        assert_eq!(registry.stats().await.frames_enqueued, 30);
    }

    #[tokio::test]
    async fn test_broadcast_skips_closed_subscribers() {
        let registry = Arc::new(SubscriberRegistry::new());
        let (open, mut rx_open) = registered(&registry, 4).await;
        let (closed, _rx_closed) = registered(&registry, 4).await;

        closed.close().await;
        assert_eq!(registry.broadcast(&frame("x")).await, 1);
        assert_eq!(rx_open.recv().await.unwrap().as_str(), "x");
        assert!(open.is_open());
    }

    #[tokio::test]
    async fn test_late_registration_misses_earlier_broadcast() {
        let registry = Arc::new(SubscriberRegistry::new());
        registry.broadcast(&frame("before")).await;

        let (_sub, mut rx) = registered(&registry, 4).await;
        registry.broadcast(&frame("after")).await;

        assert_eq!(rx.recv().await.unwrap().as_str(), "after");
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_saturated_subscriber_is_evicted() {
        let registry = Arc::new(SubscriberRegistry::new());
        let (slow, _slow_rx) = registered(&registry, 2).await;
        let (_healthy, mut healthy_rx) = registered(&registry, 64).await;

        let result = timeout(Duration::from_secs(1), async {
            for i in 0..20 {
                registry.broadcast(&frame(&format!("e{i}"))).await;
            }
        })
        .await;
        assert!(result.is_ok(), "broadcast must not stall on a slow subscriber");

        for i in 0..20 {
            assert_eq!(healthy_rx.recv().await.unwrap().as_str(), format!("e{i}"));
        }

        assert!(!slow.is_open());
        assert!(!registry.contains(slow.id()).await);

        let stats = registry.stats().await;
        assert_eq!(stats.subscribers_evicted, 1);
        assert_eq!(stats.frames_dropped, 1);
        assert_eq!(stats.active_subscribers, 1);
    }

    #[tokio::test]
    async fn test_register_concurrent_with_broadcast() {
        let registry = Arc::new(SubscriberRegistry::new());

        let broadcaster = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for i in 0..200 {
                    registry.broadcast(&frame(&format!("e{i}"))).await;
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut outboxes = Vec::new();
        for _ in 0..10 {
            outboxes.push(registered(&registry, 256).await.1);
            tokio::task::yield_now().await;
        }
        broadcaster.await.unwrap();

        // Whatever each subscriber saw must be a gap-free suffix of the sequence.
        for mut rx in outboxes {
            let mut seen = Vec::new();
            while let Some(f) = rx.try_recv() {
                seen.push(f.as_str().trim_start_matches('e').parse::<u32>().unwrap());
            }
            if let Some(first) = seen.first().copied() {
                let expected: Vec<u32> = (first..200).collect();
                assert_eq!(seen, expected);
            }
        }
    }

    #[tokio::test]
    async fn test_ids() {
        let registry = Arc::new(SubscriberRegistry::new());
        let (a, _rx_a) = registered(&registry, 4).await;
        let (b, _rx_b) = registered(&registry, 4).await;

        let ids = registry.ids().await;
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a.id()));
        assert!(ids.contains(&b.id()));
    }
}
