//! The feed: one record store, one subscriber registry, and the operations
//! that must touch both.
//!
//! Lock order is always store → registry. Mutations hold the store's write
//! lock until their envelope has been queued everywhere, and subscriber setup
//! holds the store's read lock from registration until the sync frame is
//! queued. A new subscriber therefore either sees a change in its sync
//! snapshot or receives the change's envelope after the sync frame, never
//! both and never neither.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;

use crate::error::FeedError;
use crate::protocol::Envelope;
use crate::registry::{RegistryStats, SubscriberRegistry};
use crate::store::{Record, RecordStore};
use crate::subscriber::{self, Outbox, Subscriber};

/// Per-subscriber tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedConfig {
    /// Outbound frames buffered per subscriber before it is evicted
    pub queue_capacity: usize,
    /// Interval between keepalive pings
    pub keepalive_interval: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 32,
            keepalive_interval: Duration::from_secs(5),
        }
    }
}

impl FeedConfig {
    pub fn validate(&self) -> Result<(), FeedError> {
        if self.queue_capacity == 0 {
            return Err(FeedError::InvalidConfig(
                "queue_capacity must be at least 1".into(),
            ));
        }
        if self.keepalive_interval.is_zero() {
            return Err(FeedError::InvalidConfig(
                "keepalive_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Feed-wide statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub records: usize,
    pub registry: RegistryStats,
}

pub struct Feed {
    config: FeedConfig,
    store: RecordStore,
    registry: Arc<SubscriberRegistry>,
}

impl Feed {
    pub fn new(config: FeedConfig) -> Result<Self, FeedError> {
        config.validate()?;
        Ok(Self::from_valid_config(config))
    }

    pub fn with_defaults() -> Self {
        Self::from_valid_config(FeedConfig::default())
    }

    /// Every constructor ends here; `config` must already have passed
    /// [`FeedConfig::validate`].
    fn from_valid_config(config: FeedConfig) -> Self {
        debug_assert!(config.validate().is_ok());
        Self {
            config,
            store: RecordStore::new(),
            registry: Arc::new(SubscriberRegistry::new()),
        }
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    /// Store a record and announce it to every subscriber.
    ///
    /// Returns the stored record.
    pub async fn create_record(&self, record: Record) -> Result<Record, FeedError> {
        let frame = Envelope::added(&record).encode()?;

        let mut records = self.store.write().await;
        if records.insert(record.clone()).is_some() {
            log::debug!("Record {} replaced", record.id());
        }
        let delivered = self.registry.broadcast(&frame).await;
        drop(records);

        log::info!("Record {} added, announced to {delivered} subscribers", record.id());
        Ok(record)
    }

    /// Delete a record and announce the removal.
    ///
    /// The `del` envelope goes out even when the id was unknown.
    pub async fn remove_record(&self, id: &str) -> Result<Option<Record>, FeedError> {
        let frame = Envelope::removed(id).encode()?;

        let mut records = self.store.write().await;
        let removed = records.delete(id);
        let delivered = self.registry.broadcast(&frame).await;
        drop(records);

        log::info!("Record {id} removed, announced to {delivered} subscribers");
        Ok(removed)
    }

    /// Register a new subscriber and queue its sync frame.
    ///
    /// The returned [`Outbox`] yields the sync frame first, followed by every
    /// envelope broadcast after registration.
    pub async fn attach(
        &self,
        peer_addr: Option<SocketAddr>,
    ) -> Result<(Arc<Subscriber>, Outbox), FeedError> {
        let records = self.store.read().await;

        let (subscriber, outbox) =
            Subscriber::new(self.registry.clone(), self.config.queue_capacity, peer_addr);
        self.registry.register(subscriber.clone()).await;

        let queued = Envelope::sync(records.snapshot())
            .encode()
            .and_then(|frame| {
                subscriber
                    .enqueue(frame)
                    .map_err(|_| FeedError::SubscriberClosed(subscriber.id()))
            });
        if let Err(e) = queued {
            drop(records);
            subscriber.close().await;
            return Err(e);
        }
        drop(records);

        Ok((subscriber, outbox))
    }

    /// Serve an upgraded WebSocket connection: attach a subscriber and spawn
    /// its read and write tasks.
    pub async fn serve<S>(
        self: &Arc<Self>,
        ws: WebSocketStream<S>,
        peer_addr: Option<SocketAddr>,
    ) -> Result<Arc<Subscriber>, FeedError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (subscriber, outbox) = self.attach(peer_addr).await?;
        let (sink, stream) = ws.split();

        tokio::spawn(subscriber::write_loop(
            subscriber.clone(),
            sink,
            outbox,
            self.config.keepalive_interval,
        ));
        tokio::spawn(subscriber::read_loop(subscriber.clone(), stream, self.clone()));

        Ok(subscriber)
    }

    pub async fn stats(&self) -> FeedStats {
        FeedStats {
            records: self.store.len().await,
            registry: self.registry.stats().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Snapshot;
    use serde_json::{json, Map};

    fn record(id: &str) -> Record {
        let payload = json!({ "To": "+1000", "Body": format!("body of {id}") })
            .as_object()
            .cloned()
            .unwrap();
        Record::new(id, payload).unwrap()
    }

    async fn next(outbox: &mut Outbox) -> Envelope {
        let frame = outbox.recv().await.expect("frame");
        Envelope::decode(frame.as_bytes()).unwrap()
    }

    #[test]
    fn test_config_default() {
        let config = FeedConfig::default();
        assert_eq!(config.queue_capacity, 32);
        assert_eq!(config.keepalive_interval, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let zero_queue = FeedConfig {
            queue_capacity: 0,
            ..FeedConfig::default()
        };
        assert!(matches!(Feed::new(zero_queue), Err(FeedError::InvalidConfig(_))));

        let zero_keepalive = FeedConfig {
            keepalive_interval: Duration::ZERO,
            ..FeedConfig::default()
        };
        assert!(zero_keepalive.validate().is_err());
    }

    #[tokio::test]
    async fn test_with_defaults_matches_new() {
        let defaults = Feed::with_defaults();
        let validated = Feed::new(FeedConfig::default()).unwrap();
        assert_eq!(defaults.config(), validated.config());
        assert!(defaults.store().is_empty().await);
        assert!(defaults.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_attach_to_empty_store_gets_empty_sync() {
        let feed = Feed::with_defaults();
        let (_sub, mut outbox) = feed.attach(None).await.unwrap();
        assert_eq!(next(&mut outbox).await, Envelope::sync(Snapshot::new()));
    }

    #[tokio::test]
    async fn test_sync_reflects_existing_records_without_replay() {
        let feed = Feed::with_defaults();
        feed.create_record(record("M1")).await.unwrap();

        let (_sub, mut outbox) = feed.attach(None).await.unwrap();
        match next(&mut outbox).await {
            Envelope::Sync { data } => {
                assert_eq!(data.len(), 1);
                assert_eq!(data["M1"], record("M1"));
            }
            other => panic!("expected sync, got {other:?}"),
        }
        assert!(outbox.try_recv().is_none(), "earlier add must not be replayed");
    }

    #[tokio::test]
    async fn test_create_and_remove_are_announced() {
        let feed = Feed::with_defaults();
        let (_a, mut rx_a) = feed.attach(None).await.unwrap();
        let (_b, mut rx_b) = feed.attach(None).await.unwrap();
        next(&mut rx_a).await;
        next(&mut rx_b).await;

        let stored = feed.create_record(record("M1")).await.unwrap();
        assert_eq!(stored.id(), "M1");
        for rx in [&mut rx_a, &mut rx_b] {
            assert_eq!(next(rx).await, Envelope::added(&record("M1")));
        }

        let removed = feed.remove_record("M1").await.unwrap();
        assert_eq!(removed, Some(record("M1")));
        for rx in [&mut rx_a, &mut rx_b] {
            assert_eq!(next(rx).await, Envelope::removed("M1"));
        }
        assert!(feed.store().snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_unknown_still_announces() {
        let feed = Feed::with_defaults();
        let (_sub, mut rx) = feed.attach(None).await.unwrap();
        next(&mut rx).await;

        assert_eq!(feed.remove_record("ghost").await.unwrap(), None);
        assert_eq!(next(&mut rx).await, Envelope::removed("ghost"));
    }

    #[tokio::test]
    async fn test_broadcasts_arrive_in_emission_order() {
        let feed = Feed::with_defaults();
        let (_sub, mut rx) = feed.attach(None).await.unwrap();
        next(&mut rx).await;

        for i in 0..20 {
            feed.create_record(record(&format!("M{i}"))).await.unwrap();
        }
        for i in 0..20 {
            match next(&mut rx).await {
                Envelope::Add { id, .. } => assert_eq!(id, format!("M{i}")),
                other => panic!("expected add, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_attach_racing_creates_sees_each_record_once() {
        let feed = Arc::new(Feed::new(FeedConfig {
            queue_capacity: 512,
            ..FeedConfig::default()
        })
        .unwrap());

        let writer = {
            let feed = feed.clone();
            tokio::spawn(async move {
                for i in 0..200 {
                    feed.create_record(record(&format!("M{i}"))).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut outboxes = Vec::new();
        for _ in 0..8 {
            outboxes.push(feed.attach(None).await.unwrap().1);
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();

        for mut rx in outboxes {
            let mut seen: Vec<String> = match next(&mut rx).await {
                Envelope::Sync { data } => data.into_keys().collect(),
                other => panic!("expected sync first, got {other:?}"),
            };
            while let Some(frame) = rx.try_recv() {
                match Envelope::decode(frame.as_bytes()).unwrap() {
                    Envelope::Add { id, .. } => seen.push(id),
                    other => panic!("unexpected {other:?}"),
                }
            }
            seen.sort();
            let before = seen.len();
            seen.dedup();
            assert_eq!(before, seen.len(), "no record delivered twice");
            assert_eq!(seen.len(), 200, "no record missed");
        }
    }

    #[tokio::test]
    async fn test_stats() {
        let feed = Feed::with_defaults();
        let (_sub, _rx) = feed.attach(None).await.unwrap();
        feed.create_record(record("M1")).await.unwrap();
        feed.create_record(Record::new("M2", Map::new()).unwrap())
            .await
            .unwrap();

        let stats = feed.stats().await;
        assert_eq!(stats.records, 2);
        assert_eq!(stats.registry.active_subscribers, 1);
        assert_eq!(stats.registry.frames_enqueued, 2);
    }
}
