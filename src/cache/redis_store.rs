//! Redis cache backend for deployments where several processes share state.
//!
//! The backend starts disconnected. `connect_with_retry` establishes the
//! connection manager with backoff; until it succeeds every operation fails
//! fast and `ping` reports the outage to the health endpoint. Once up, the
//! manager reconnects on its own.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{CacheStore, Notification};
use crate::ingestion::backoff::Backoff;
use crate::runtime_config::ReconnectConfig;

const SUBSCRIBER_CAPACITY: usize = 1_024;

pub struct RedisCache {
    client: redis::Client,
    conn: RwLock<Option<ConnectionManager>>,
}

impl RedisCache {
    /// Validate `url` without connecting.
    pub fn open(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        Ok(Self {
            client,
            conn: RwLock::new(None),
        })
    }

    /// Connect, retrying with backoff until it works or `cancel` fires.
    /// Returns whether a connection was established.
    pub async fn connect_with_retry(&self, config: &ReconnectConfig, cancel: &CancellationToken) -> bool {
        let mut backoff = Backoff::new(config);
        loop {
            let attempt = tokio::select! {
                _ = cancel.cancelled() => return false,
                res = self.client.get_connection_manager() => res,
            };
            match attempt {
                Ok(conn) => {
                    *self.conn.write() = Some(conn);
                    info!("redis cache connected");
                    return true;
                }
                Err(e) => {
                    let delay = backoff.next_delay_or_max();
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "redis unavailable, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return false,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn conn(&self) -> Result<ConnectionManager> {
        self.conn.read().clone().context("redis not connected")
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut conn = self.conn()?;
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let (): () = conn
            .pset_ex(key, value, millis)
            .await
            .with_context(|| format!("SET {key} PX"))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn()?;
        let value: Option<String> = conn.get(key).await.with_context(|| format!("GET {key}"))?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let (): () = conn.del(key).await.with_context(|| format!("DEL {key}"))?;
        Ok(())
    }

    async fn publish(&self, channel: &str, message: String) -> Result<()> {
        let mut conn = self.conn()?;
        let (): () = conn
            .publish(channel, message)
            .await
            .with_context(|| format!("PUBLISH {channel}"))?;
        Ok(())
    }

    /// The returned stream closes when the pubsub connection drops; callers
    /// resubscribe.
    async fn subscribe(&self, pattern: &str) -> Result<mpsc::Receiver<Notification>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("failed to open redis pubsub connection")?;
        pubsub
            .psubscribe(pattern)
            .await
            .with_context(|| format!("PSUBSCRIBE {pattern}"))?;

        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let pattern = pattern.to_string();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(pattern = %pattern, error = %e, "non-text redis payload dropped");
                        continue;
                    }
                };
                let n = Notification {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                };
                if tx.send(n).await.is_err() {
                    return;
                }
            }
            warn!(pattern = %pattern, "redis pubsub stream ended");
        });

        Ok(rx)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn()?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("redis PING failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable() -> RedisCache {
        // Port 1 is never a redis server; connects are refused immediately.
        RedisCache::open("redis://127.0.0.1:1/").unwrap()
    }

    #[test]
    fn bad_url_is_rejected_up_front() {
        assert!(RedisCache::open("not a url").is_err());
    }

    #[tokio::test]
    async fn operations_fail_fast_while_disconnected() {
        let cache = unreachable();
        assert!(cache.ping().await.is_err());
        assert!(cache.get("k").await.is_err());
        assert!(cache.set("k", "v".into(), Duration::from_millis(1_500)).await.is_err());
    }

    #[tokio::test]
    async fn retry_keeps_going_until_cancelled() {
        let cache = unreachable();
        let cancel = CancellationToken::new();
        let config = ReconnectConfig {
            base_delay_ms: 10,
            max_delay_ms: 20,
            max_attempts: 1,
            ..ReconnectConfig::default()
        };

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            stopper.cancel();
        });

        let connected = tokio::time::timeout(Duration::from_secs(5), cache.connect_with_retry(&config, &cancel))
            .await
            .unwrap();
        assert!(!connected);
        assert!(cache.ping().await.is_err());
    }
}
