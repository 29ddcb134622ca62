//! Error types shared across the feed.

use thiserror::Error;
use tokio_tungstenite::tungstenite;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("record identifier must not be empty")]
    EmptyRecordId,
    #[error("record payload must not contain reserved field `{0}`")]
    ReservedField(&'static str),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("subscriber {0} is closed")]
    SubscriberClosed(Uuid),
}

/// Why a frame could not be handed to a subscriber's outbound queue.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("subscriber is closed")]
    Closed,
    #[error("outbound queue is full")]
    Full,
}
