//! WebSocket acceptor.
//!
//! Architecture:
//! ```text
//! TcpListener ── accept ──► handshake task ── upgrade on `ws_path` ──► Feed::serve
//!                                  │                                     │
//!                                  └─ 404 / 503 on reject           read + write task
//! ```
//!
//! A failed or rejected handshake drops the connection and changes no other
//! state; nothing here is fatal to the accept loop.
//!
//! With `max_subscribers` set, each connection takes a slot before its
//! handshake starts and keeps it until its subscriber closes, so concurrent
//! handshakes cannot overshoot the limit.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

use crate::error::FeedError;
use crate::feed::{Feed, FeedConfig, FeedStats};
use crate::subscriber::Subscriber;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Request path that is upgraded to the feed stream
    pub ws_path: String,
    /// Maximum concurrent subscribers (0 = unlimited)
    pub max_subscribers: usize,
    /// Per-subscriber queue and keepalive settings
    pub feed: FeedConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            ws_path: "/ws".to_string(),
            max_subscribers: 0,
            feed: FeedConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub accepted_connections: u64,
    pub rejected_connections: u64,
    pub feed: FeedStats,
}

#[derive(Default)]
struct ConnectionCounters {
    accepted: AtomicU64,
    rejected: AtomicU64,
}

/// Accepts TCP connections and hands upgraded streams to the [`Feed`].
pub struct FeedServer {
    config: ServerConfig,
    feed: Arc<Feed>,
    counters: Arc<ConnectionCounters>,
    slots: Option<Arc<Semaphore>>,
}

impl FeedServer {
    pub fn new(config: ServerConfig) -> Result<Self, FeedError> {
        let feed = Arc::new(Feed::new(config.feed.clone())?);
        Ok(Self::with_feed(config, feed))
    }

    /// Serve an existing feed, e.g. one that other glue code also writes to.
    pub fn with_feed(config: ServerConfig, feed: Arc<Feed>) -> Self {
        let slots = (config.max_subscribers > 0)
            .then(|| Arc::new(Semaphore::new(config.max_subscribers)));
        Self {
            config,
            feed,
            counters: Arc::new(ConnectionCounters::default()),
            slots,
        }
    }

    pub fn with_defaults() -> Self {
        Self::with_feed(ServerConfig::default(), Arc::new(Feed::with_defaults()))
    }

    pub fn feed(&self) -> &Arc<Feed> {
        &self.feed
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Bind to the configured address and accept connections forever.
    pub async fn run(&self) -> Result<(), FeedError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!(
            "Feed server listening on ws://{}{}",
            listener.local_addr()?,
            self.config.ws_path
        );
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), FeedError> {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    log::error!("Accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let feed = self.feed.clone();
            let counters = self.counters.clone();
            let ws_path = self.config.ws_path.clone();
            let slot = self.reserve_slot();

            tokio::spawn(async move {
                let upgraded =
                    Self::handle_connection(stream, addr, &feed, ws_path, slot.as_ref()).await;
                match upgraded {
                    Ok(subscriber) => {
                        counters.accepted.fetch_add(1, Ordering::Relaxed);
                        // Hold the slot for the subscriber's lifetime.
                        subscriber.closed().await;
                        drop(slot);
                    }
                    Err(e) => {
                        counters.rejected.fetch_add(1, Ordering::Relaxed);
                        log::warn!("Connection from {addr} not upgraded: {e}");
                    }
                }
            });
        }
    }

    /// `None` means the connection is unlimited; `Some(None)` means full.
    fn reserve_slot(&self) -> Option<Option<OwnedSemaphorePermit>> {
        self.slots
            .as_ref()
            .map(|slots| slots.clone().try_acquire_owned().ok())
    }

    /// Upgrade one connection and attach it to the feed.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        feed: &Arc<Feed>,
        ws_path: String,
        slot: Option<&Option<OwnedSemaphorePermit>>,
    ) -> Result<Arc<Subscriber>, FeedError> {
        let at_capacity = matches!(slot, Some(None));

        let check_request = move |request: &Request, response: Response| {
            if request.uri().path() != ws_path {
                return Err(reject(StatusCode::NOT_FOUND, "not found"));
            }
            if at_capacity {
                return Err(reject(StatusCode::SERVICE_UNAVAILABLE, "too many subscribers"));
            }
            Ok(response)
        };

        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, check_request).await?;
        let subscriber = feed.serve(ws_stream, Some(addr)).await?;
        log::info!("Subscriber {} connected from {addr}", subscriber.id());
        Ok(subscriber)
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            accepted_connections: self.counters.accepted.load(Ordering::Relaxed),
            rejected_connections: self.counters.rejected.load(Ordering::Relaxed),
            feed: self.feed.stats().await,
        }
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}
