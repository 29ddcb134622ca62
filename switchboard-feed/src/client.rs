//! WebSocket client for a feed server.
//!
//! Keeps a local mirror of the record set: a `sync` replaces it, `add`
//! inserts, `del` deletes. Every applied envelope is also surfaced as a
//! [`FeedEvent`] on the event channel.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};

use crate::error::FeedError;
use crate::protocol::{Command, Envelope};
use crate::store::{Record, Snapshot};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the feed client.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// Connection established
    Connected,
    /// Full record set received
    Synced(Snapshot),
    /// A record was added or replaced
    Added(Record),
    /// A record was removed
    Removed(String),
    /// Connection lost
    Disconnected,
}

pub struct FeedClient {
    url: String,
    state: Arc<RwLock<ConnectionState>>,
    records: Arc<RwLock<Snapshot>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Utf8Bytes>>,
    event_rx: Option<mpsc::Receiver<FeedEvent>>,
    event_tx: mpsc::Sender<FeedEvent>,
}

impl FeedClient {
    pub fn new(url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            url: url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            records: Arc::new(RwLock::new(Snapshot::new())),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<FeedEvent>> {
        self.event_rx.take()
    }

    /// Connect and spawn the reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), FeedError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(&self.url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Utf8Bytes>(64);
        self.outgoing_tx = Some(out_tx);

        // Writer: forward outgoing frames; closing the channel closes the socket.
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_writer.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(FeedEvent::Connected).await;

        // Reader: apply envelopes to the mirror and emit events.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let records = self.records.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let bytes = match msg {
                    Ok(Message::Text(text)) => text.as_bytes().to_vec(),
                    Ok(Message::Binary(data)) => data.to_vec(),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match Envelope::decode(&bytes) {
                    Ok(envelope) => {
                        let event = apply(&records, envelope).await;
                        let _ = event_tx.send(event).await;
                    }
                    Err(e) => log::warn!("Ignoring undecodable frame: {e}"),
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(FeedEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Ask the server to remove a record.
    pub async fn send_remove(&self, id: impl Into<String>) -> Result<(), FeedError> {
        let frame = Command::remove(id).encode()?;
        self.send_raw(frame).await
    }

    /// Send an arbitrary text frame.
    pub async fn send_raw(&self, frame: impl Into<Utf8Bytes>) -> Result<(), FeedError> {
        let tx = self.outgoing_tx.as_ref().ok_or_else(not_connected)?;
        tx.send(frame.into()).await.map_err(|_| not_connected())
    }

    /// Close the connection.
    pub fn disconnect(&mut self) {
        self.outgoing_tx = None;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Current mirror of the server's record set.
    pub async fn records(&self) -> Snapshot {
        self.records.read().await.clone()
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

async fn apply(records: &RwLock<Snapshot>, envelope: Envelope) -> FeedEvent {
    let mut records = records.write().await;
    match envelope {
        Envelope::Sync { data } => {
            *records = data.clone();
            FeedEvent::Synced(data)
        }
        Envelope::Add { id, data } => {
            records.insert(id, data.clone());
            FeedEvent::Added(data)
        }
        Envelope::Del { id } => {
            records.remove(&id);
            FeedEvent::Removed(id)
        }
    }
}

fn not_connected() -> FeedError {
    FeedError::Io(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "feed client is not connected",
    ))
}
