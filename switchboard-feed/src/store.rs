//! In-memory record store.
//!
//! The store is the single authority over live records. One read/write lock
//! guards the map: snapshots share the lock, mutations take it exclusively,
//! so a snapshot always reflects a single point in the mutation sequence.
//!
//! [`crate::feed::Feed`] holds the guards themselves across
//! mutate-then-broadcast and register-then-snapshot, which is why the guard
//! types exist alongside the plain `insert`/`delete`/`snapshot` calls.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::FeedError;

/// Point-in-time copy of every live record, keyed by identifier.
pub type Snapshot = BTreeMap<String, Record>;

/// A stored domain object.
///
/// Serializes as one flat JSON object: `{"id": "...", <payload fields>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRecord")]
pub struct Record {
    id: String,
    #[serde(flatten)]
    payload: Map<String, Value>,
}

#[derive(Deserialize)]
struct RawRecord {
    id: String,
    #[serde(flatten)]
    payload: Map<String, Value>,
}

impl TryFrom<RawRecord> for Record {
    type Error = FeedError;

    fn try_from(raw: RawRecord) -> Result<Self, Self::Error> {
        Record::new(raw.id, raw.payload)
    }
}

impl Record {
    /// Build a record. The identifier must be non-empty and the payload may
    /// not carry its own `id` field.
    pub fn new(id: impl Into<String>, payload: Map<String, Value>) -> Result<Self, FeedError> {
        let id = id.into();
        if id.is_empty() {
            return Err(FeedError::EmptyRecordId);
        }
        if payload.contains_key("id") {
            return Err(FeedError::ReservedField("id"));
        }
        Ok(Self { id, payload })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    /// Look up a single payload field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }
}

/// Shared-read / exclusive-write record map.
#[derive(Debug, Default)]
pub struct RecordStore {
    records: RwLock<HashMap<String, Record>>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the record under its identifier.
    ///
    /// Returns the record it replaced, if any.
    pub async fn insert(&self, record: Record) -> Option<Record> {
        self.write().await.insert(record)
    }

    /// Remove a record. Deleting an unknown id is a no-op.
    pub async fn delete(&self, id: &str) -> Option<Record> {
        self.write().await.delete(id)
    }

    /// Copy of all live records, taken atomically.
    pub async fn snapshot(&self) -> Snapshot {
        self.read().await.snapshot()
    }

    pub async fn get(&self, id: &str) -> Option<Record> {
        self.records.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.records.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub(crate) async fn write(&self) -> StoreWriteGuard<'_> {
        StoreWriteGuard(self.records.write().await)
    }

    pub(crate) async fn read(&self) -> StoreReadGuard<'_> {
        StoreReadGuard(self.records.read().await)
    }
}

/// Exclusive access to the store for the duration of the guard.
pub(crate) struct StoreWriteGuard<'a>(RwLockWriteGuard<'a, HashMap<String, Record>>);

impl StoreWriteGuard<'_> {
    pub(crate) fn insert(&mut self, record: Record) -> Option<Record> {
        self.0.insert(record.id.clone(), record)
    }

    pub(crate) fn delete(&mut self, id: &str) -> Option<Record> {
        self.0.remove(id)
    }
}

/// Shared access to the store for the duration of the guard.
pub(crate) struct StoreReadGuard<'a>(RwLockReadGuard<'a, HashMap<String, Record>>);

impl StoreReadGuard<'_> {
    pub(crate) fn snapshot(&self) -> Snapshot {
        self.0
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect()
    }
}
