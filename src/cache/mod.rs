// =============================================================================
// Cache & Notification Store — last-value cache with TTL plus pub/sub
// =============================================================================
//
// Producers write the latest state under a namespaced key and publish a
// notification on a matching channel; consumers never hold references to
// producers. Two backends implement the same trait: an in-process store
// (default, also used by tests) and Redis for multi-process deployments.
// =============================================================================

pub mod keys;
pub mod memory;
pub mod redis_store;
#[cfg(test)]
pub mod testing;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;

pub use memory::MemoryCache;
pub use redis_store::RedisCache;

/// A message delivered to a channel subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

/// The four operations the rest of the hub relies on, plus removal and a
/// health check.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Overwrite `key`, refreshing its TTL.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Current value, or `None` when missing or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Remove `key`. Missing keys are not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn publish(&self, channel: &str, message: String) -> Result<()>;

    /// Receive every message whose channel matches `pattern`. A trailing `*`
    /// matches any suffix.
    async fn subscribe(&self, pattern: &str) -> Result<mpsc::Receiver<Notification>>;

    async fn ping(&self) -> Result<()>;
}

pub type SharedCache = Arc<dyn CacheStore>;

/// Serialize and store `value` under `key`.
pub async fn set_json<T: Serialize + ?Sized>(
    cache: &dyn CacheStore,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<()> {
    let json = serde_json::to_string(value).with_context(|| format!("serialise {key}"))?;
    cache.set(key, json, ttl).await
}

/// Fetch and deserialize `key`. A present-but-corrupt value is an error.
pub async fn get_json<T: DeserializeOwned>(cache: &dyn CacheStore, key: &str) -> Result<Option<T>> {
    match cache.get(key).await? {
        Some(raw) => {
            let value = serde_json::from_str(&raw).with_context(|| format!("decode {key}"))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Store `value` and announce it on `channel` in one step.
pub async fn set_and_publish<T: Serialize + ?Sized>(
    cache: &dyn CacheStore,
    key: &str,
    channel: &str,
    value: &T,
    ttl: Duration,
) -> Result<()> {
    let json = serde_json::to_string(value).with_context(|| format!("serialise {key}"))?;
    cache.set(key, json.clone(), ttl).await?;
    cache.publish(channel, json).await
}

/// Redis-style glob: exact match, or prefix match when the pattern ends in `*`.
pub fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}
