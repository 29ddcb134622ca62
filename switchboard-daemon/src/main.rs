//! Switchboard daemon. Serves the record feed over WebSocket.
//!
//! Records are fed in on stdin, one JSON object per line, each carrying a
//! string `id`. Every accepted line is stored and announced to all
//! connected subscribers.
//!
//! ```text
//! $ echo '{"id":"MG-1","From":"+1555","Body":"hi"}' | switchboard-daemon
//! ```

mod config;

use std::sync::Arc;

use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

use switchboard_feed::{Feed, FeedError, FeedServer, Record};

#[tokio::main]
async fn main() -> Result<(), FeedError> {
    env_logger::init();

    let config = config::from_env()?;
    let server = FeedServer::new(config)?;
    info!("Starting switchboard on {}...", server.bind_addr());

    tokio::spawn(read_records(server.feed().clone()));

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down: {} records, {} live subscribers, {} connections served",
                stats.feed.records,
                stats.feed.registry.active_subscribers,
                stats.accepted_connections
            );
            Ok(())
        }
    }
}

/// Create a record for every JSON line on stdin until it closes.
async fn read_records(feed: Arc<Feed>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Record>(line) {
                    Ok(record) => {
                        if let Err(e) = feed.create_record(record).await {
                            error!("Failed to announce record: {e}");
                        }
                    }
                    Err(e) => warn!("Skipping stdin line: {e}"),
                }
            }
            Ok(None) => {
                info!("stdin closed, no more records will be read");
                break;
            }
            Err(e) => {
                error!("Reading stdin failed: {e}");
                break;
            }
        }
    }
}
