//! One connected WebSocket client and the two tasks that drive it.
//!
//! ```text
//!                  ┌──────────── Subscriber ────────────┐
//! broadcast ──►    │ queue (bounded mpsc) ─► write_loop ─┼──► socket
//!                  │ open flag · shutdown signal         │
//! socket ──────────┼──► read_loop ─► Feed::remove_record │
//!                  └─────────────────────────────────────┘
//! ```
//!
//! Either loop, or any external caller, may invoke [`Subscriber::close`].
//! The first call wins the compare-and-swap on the open flag, raises the
//! shutdown signal that both loops watch, and unregisters the subscriber.
//! Later calls return `false` and do nothing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message, Utf8Bytes};
use uuid::Uuid;

use crate::error::EnqueueError;
use crate::feed::Feed;
use crate::protocol::Command;
use crate::registry::SubscriberRegistry;

/// A live subscriber as seen by the registry and the broadcasters.
pub struct Subscriber {
    id: Uuid,
    peer_addr: Option<SocketAddr>,
    open: AtomicBool,
    queue: mpsc::Sender<Utf8Bytes>,
    shutdown: watch::Sender<bool>,
    registry: Arc<SubscriberRegistry>,
}

/// Consumer end of a subscriber's outbound queue, owned by its write loop.
pub struct Outbox {
    frames: mpsc::Receiver<Utf8Bytes>,
    shutdown: watch::Receiver<bool>,
}

impl Outbox {
    /// Next queued frame in FIFO order, or `None` once the subscriber closes.
    pub async fn recv(&mut self) -> Option<Utf8Bytes> {
        tokio::select! {
            biased;
            _ = self.shutdown.wait_for(|closed| *closed) => None,
            frame = self.frames.recv() => frame,
        }
    }

    /// Non-blocking variant of [`Outbox::recv`].
    pub fn try_recv(&mut self) -> Option<Utf8Bytes> {
        if *self.shutdown.borrow() {
            return None;
        }
        self.frames.try_recv().ok()
    }

    /// Number of frames waiting in the queue.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl Subscriber {
    /// Create an open subscriber with a fresh queue of `capacity` frames.
    ///
    /// The subscriber is not registered yet; see [`Feed::attach`].
    pub fn new(
        registry: Arc<SubscriberRegistry>,
        capacity: usize,
        peer_addr: Option<SocketAddr>,
    ) -> (Arc<Self>, Outbox) {
        let (queue, frames) = mpsc::channel(capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let subscriber = Arc::new(Self {
            id: Uuid::new_v4(),
            peer_addr,
            open: AtomicBool::new(true),
            queue,
            shutdown,
            registry,
        });
        let outbox = Outbox {
            frames,
            shutdown: shutdown_rx,
        };
        (subscriber, outbox)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Hand a frame to the write loop without waiting.
    pub fn enqueue(&self, frame: Utf8Bytes) -> Result<(), EnqueueError> {
        if !self.is_open() {
            return Err(EnqueueError::Closed);
        }
        self.queue.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => EnqueueError::Full,
            TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Tear the subscriber down. Returns `true` only for the call that
    /// actually performed the teardown.
    pub async fn close(&self) -> bool {
        if self
            .open
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.shutdown.send_replace(true);
        self.registry.unregister(self.id).await;
        log::debug!("Subscriber {} closed ({})", self.id, self.describe_peer());
        true
    }

    /// Resolves once the subscriber has been closed.
    pub async fn closed(&self) {
        let mut signal = self.closed_signal();
        let _ = signal.wait_for(|closed| *closed).await;
    }

    fn closed_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    fn describe_peer(&self) -> String {
        self.peer_addr
            .map_or_else(|| "detached".to_string(), |addr| addr.to_string())
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("open", &self.is_open())
            .finish()
    }
}

/// How long a closing subscriber's sink gets to finish the close handshake.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Drain the outbound queue onto the connection, pinging every `keepalive`.
///
/// Ends on shutdown or on the first write error, then closes the subscriber
/// and the sink. Shutdown also interrupts a write that is stuck on a peer
/// which stopped reading.
pub(crate) async fn write_loop<Si>(
    subscriber: Arc<Subscriber>,
    mut sink: Si,
    mut outbox: Outbox,
    keepalive: Duration,
) where
    Si: Sink<Message> + Unpin,
    Si::Error: std::fmt::Display,
{
    let mut closed = subscriber.closed_signal();
    let mut ticker = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let msg = tokio::select! {
            biased;
            frame = outbox.recv() => match frame {
                Some(frame) => Message::Text(frame),
                None => break,
            },
            _ = ticker.tick() => {
                log::trace!("Keepalive ping to subscriber {}", subscriber.id());
                Message::Ping(Default::default())
            }
        };

        let sent = tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => {
                log::debug!("Subscriber {} closed with a write in flight", subscriber.id());
                break;
            }
            sent = sink.send(msg) => sent,
        };
        if let Err(e) = sent {
            log::debug!("Write to subscriber {} failed: {e}", subscriber.id());
            break;
        }
    }

    subscriber.close().await;
    match tokio::time::timeout(CLOSE_GRACE, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::trace!("Closing sink for subscriber {}: {e}", subscriber.id()),
        Err(_) => log::debug!("Subscriber {} did not finish closing, dropping it", subscriber.id()),
    }
}

/// Read inbound frames until the peer goes away or the subscriber closes.
pub(crate) async fn read_loop<St>(subscriber: Arc<Subscriber>, mut stream: St, feed: Arc<Feed>)
where
    St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let mut closed = subscriber.closed_signal();

    loop {
        let msg = tokio::select! {
            _ = closed.wait_for(|closed| *closed) => break,
            msg = stream.next() => msg,
        };

        match msg {
            Some(Ok(Message::Text(text))) => handle_frame(&subscriber, &feed, text.as_bytes()).await,
            Some(Ok(Message::Binary(data))) => handle_frame(&subscriber, &feed, &data).await,
            Some(Ok(Message::Close(frame))) => {
                log::info!("Subscriber {} sent close: {frame:?}", subscriber.id());
                break;
            }
            // Pings are answered by tungstenite; pongs need no action.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                log::debug!("Read from subscriber {} failed: {e}", subscriber.id());
                break;
            }
            None => {
                log::debug!("Subscriber {} stream ended", subscriber.id());
                break;
            }
        }
    }

    subscriber.close().await;
}

async fn handle_frame(subscriber: &Subscriber, feed: &Feed, bytes: &[u8]) {
    match Command::decode(bytes) {
        Ok(Command::Remove { id }) if id.is_empty() => {
            log::warn!("Subscriber {} sent remove with empty id", subscriber.id());
        }
        Ok(Command::Remove { id }) => {
            log::debug!("Subscriber {} removes record {id}", subscriber.id());
            if let Err(e) = feed.remove_record(&id).await {
                log::error!("Failed to announce removal of {id}: {e}");
            }
        }
        Err(e) => {
            log::warn!("Ignoring malformed frame from subscriber {}: {e}", subscriber.id());
        }
    }
}
