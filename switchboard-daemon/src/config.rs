//! Daemon configuration from `SWITCHBOARD_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use switchboard_feed::{FeedError, ServerConfig};

pub const BIND_VAR: &str = "SWITCHBOARD_BIND";
pub const PATH_VAR: &str = "SWITCHBOARD_PATH";
pub const QUEUE_CAPACITY_VAR: &str = "SWITCHBOARD_QUEUE_CAPACITY";
pub const KEEPALIVE_VAR: &str = "SWITCHBOARD_KEEPALIVE_SECS";
pub const MAX_SUBSCRIBERS_VAR: &str = "SWITCHBOARD_MAX_SUBSCRIBERS";

/// Build a [`ServerConfig`] from the process environment.
pub fn from_env() -> Result<ServerConfig, FeedError> {
    from_lookup(|key| std::env::var(key).ok())
}

/// Build a [`ServerConfig`] from any key lookup; unset keys keep defaults.
pub fn from_lookup<F>(lookup: F) -> Result<ServerConfig, FeedError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = ServerConfig::default();

    if let Some(bind) = lookup(BIND_VAR) {
        config.bind_addr = bind;
    }
    if let Some(path) = lookup(PATH_VAR) {
        if !path.starts_with('/') {
            return Err(FeedError::InvalidConfig(format!(
                "{PATH_VAR} must start with '/', got {path:?}"
            )));
        }
        config.ws_path = path;
    }
    if let Some(capacity) = parse(&lookup, QUEUE_CAPACITY_VAR)? {
        config.feed.queue_capacity = capacity;
    }
    if let Some(secs) = parse::<u64, _>(&lookup, KEEPALIVE_VAR)? {
        config.feed.keepalive_interval = Duration::from_secs(secs);
    }
    if let Some(max) = parse(&lookup, MAX_SUBSCRIBERS_VAR)? {
        config.max_subscribers = max;
    }

    config.feed.validate()?;
    Ok(config)
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, FeedError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| FeedError::InvalidConfig(format!("{key}={raw:?}: {e}")))
        })
        .transpose()
}
