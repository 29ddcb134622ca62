//! # switchboard-feed: real-time record fanout over WebSocket
//!
//! Keeps a live set of records and pushes every change to all connected
//! subscribers. A new subscriber first receives the whole set (`sync`),
//! then incremental `add` / `del` envelopes as they happen.
//!
//! ## Architecture
//!
//! ```text
//!   create_record ─┐                       ┌──► Subscriber A ──► socket
//!                  ▼                       │
//!            ┌─────────────┐   broadcast   ├──► Subscriber B ──► socket
//!            │    Feed     │ ────────────► │
//!            │ RecordStore │  (Registry)   └──► Subscriber C ──► socket
//!            └─────────────┘                         │
//!                  ▲                                 │ {"action":"remove"}
//!                  └─────────── remove_record ◄──────┘
//! ```
//!
//! ## Modules
//!
//! - [`store`]: records and the read/write-locked record store
//! - [`protocol`]: JSON envelopes and inbound commands
//! - [`subscriber`]: per-connection queue, close latch, read/write loops
//! - [`registry`]: subscriber set and fan-out with eviction of slow peers
//! - [`feed`]: store + registry, consistent mutate/announce and attach
//! - [`server`]: TCP accept and WebSocket upgrade
//! - [`client`]: WebSocket client mirroring the server's record set

pub mod error;
pub mod store;
pub mod protocol;
pub mod subscriber;
pub mod registry;
pub mod feed;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use error::{EnqueueError, FeedError};
pub use store::{Record, RecordStore, Snapshot};
pub use protocol::{Command, Envelope};
pub use subscriber::{Outbox, Subscriber};
pub use registry::{RegistryStats, SubscriberRegistry};
pub use feed::{Feed, FeedConfig, FeedStats};
pub use server::{FeedServer, ServerConfig, ServerStats};
pub use client::{ConnectionState, FeedClient, FeedEvent};
