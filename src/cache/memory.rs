//! In-process cache backend.
//!
//! Values live in a `parking_lot::RwLock<HashMap>` with a per-entry deadline;
//! notifications fan out over a single `tokio::sync::broadcast` bus and each
//! subscriber gets a filtered `mpsc` stream. Slow subscribers lag and lose
//! messages rather than blocking publishers.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{pattern_matches, CacheStore, Notification};

const BUS_CAPACITY: usize = 8_192;
const SUBSCRIBER_CAPACITY: usize = 1_024;

struct Entry {
    value: String,
    expires_at: Instant,
}

pub struct MemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
    bus: broadcast::Sender<Notification>,
}

impl MemoryCache {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            entries: RwLock::new(HashMap::new()),
            bus,
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Periodically evict expired entries. Runs until the task is dropped.
    pub async fn run_sweeper(self: std::sync::Arc<Self>, every: Duration) {
        let mut tick = tokio::time::interval(every);
        loop {
            tick.tick().await;
            let removed = self.sweep_expired();
            if removed > 0 {
                debug!(removed, "expired cache entries swept");
            }
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.write().insert(key.to_string(), entry);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read();
        Ok(entries
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn publish(&self, channel: &str, message: String) -> Result<()> {
        // No receivers is not an error: nobody is listening yet.
        let _ = self.bus.send(Notification {
            channel: channel.to_string(),
            payload: message,
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<mpsc::Receiver<Notification>> {
        let mut bus_rx = self.bus.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let pattern = pattern.to_string();

        tokio::spawn(async move {
            loop {
                match bus_rx.recv().await {
                    Ok(n) => {
                        if !pattern_matches(&pattern, &n.channel) {
                            continue;
                        }
                        if tx.send(n).await.is_err() {
                            debug!(pattern = %pattern, "cache subscriber dropped");
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(pattern = %pattern, skipped, "cache subscriber lagging, notifications skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(rx)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
