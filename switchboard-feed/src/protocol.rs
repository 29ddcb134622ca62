//! JSON wire protocol for record fanout.
//!
//! Every frame is a UTF-8 text frame holding one JSON object tagged by
//! `action`:
//! ```text
//! server → client   {"action":"add","id":"M1","data":{...}}
//!                   {"action":"del","id":"M1"}
//!                   {"action":"sync","data":{"M1":{...},...}}
//! client → server   {"action":"remove","id":"M1"}
//! ```
//!
//! Envelopes are encoded once per event and the resulting [`Utf8Bytes`] is
//! shared by every subscriber queue (cloning it only bumps a refcount).

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Utf8Bytes;

use crate::error::FeedError;
use crate::store::{Record, Snapshot};

/// Server-to-client event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Envelope {
    /// A record was created or replaced.
    Add { id: String, data: Record },
    /// A record was removed.
    Del { id: String },
    /// Full state, sent once right after connecting.
    Sync { data: Snapshot },
}

impl Envelope {
    pub fn added(record: &Record) -> Self {
        Self::Add {
            id: record.id().to_string(),
            data: record.clone(),
        }
    }

    pub fn removed(id: impl Into<String>) -> Self {
        Self::Del { id: id.into() }
    }

    pub fn sync(snapshot: Snapshot) -> Self {
        Self::Sync { data: snapshot }
    }

    /// Serialize into a text frame payload.
    pub fn encode(&self) -> Result<Utf8Bytes, FeedError> {
        Ok(serde_json::to_string(self)?.into())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FeedError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// The action tag as it appears on the wire.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Add { .. } => "add",
            Self::Del { .. } => "del",
            Self::Sync { .. } => "sync",
        }
    }
}

/// Client-to-server command. `remove` is the only one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Command {
    Remove { id: String },
}

impl Command {
    pub fn remove(id: impl Into<String>) -> Self {
        Self::Remove { id: id.into() }
    }

    pub fn encode(&self) -> Result<Utf8Bytes, FeedError> {
        Ok(serde_json::to_string(self)?.into())
    }

    /// Parse an inbound frame. Unknown actions and bad JSON are errors.
    pub fn decode(bytes: &[u8]) -> Result<Self, FeedError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
