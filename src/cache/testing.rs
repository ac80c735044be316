//! Cache wrappers that inject latency and dropped streams into tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{CacheStore, MemoryCache, Notification};

/// The first `set` of a key starting with `prefix` sleeps for `stall` before
/// it writes. Everything else goes straight to the inner store.
pub struct StallingCache {
    pub inner: MemoryCache,
    prefix: &'static str,
    stall: Duration,
    stalled: AtomicBool,
}

impl StallingCache {
    pub fn new(prefix: &'static str, stall: Duration) -> Self {
        Self {
            inner: MemoryCache::new(),
            prefix,
            stall,
            stalled: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl CacheStore for StallingCache {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        if key.starts_with(self.prefix) && !self.stalled.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(self.stall).await;
        }
        self.inner.set(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn publish(&self, channel: &str, message: String) -> Result<()> {
        self.inner.publish(channel, message).await
    }

    async fn subscribe(&self, pattern: &str) -> Result<mpsc::Receiver<Notification>> {
        self.inner.subscribe(pattern).await
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }
}

/// Refuses the first `refusals` subscribe calls, and can end every open
/// notification stream on demand, like a pubsub connection dropping.
pub struct FlakyCache {
    pub inner: MemoryCache,
    refusals: AtomicUsize,
    streams: Mutex<CancellationToken>,
}

impl FlakyCache {
    pub fn new(refusals: usize) -> Self {
        Self {
            inner: MemoryCache::new(),
            refusals: AtomicUsize::new(refusals),
            streams: Mutex::new(CancellationToken::new()),
        }
    }

    /// Close every stream handed out so far.
    pub fn drop_streams(&self) {
        let old = std::mem::replace(&mut *self.streams.lock(), CancellationToken::new());
        old.cancel();
    }
}

#[async_trait]
impl CacheStore for FlakyCache {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        self.inner.set(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn publish(&self, channel: &str, message: String) -> Result<()> {
        self.inner.publish(channel, message).await
    }

    async fn subscribe(&self, pattern: &str) -> Result<mpsc::Receiver<Notification>> {
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            bail!("subscribe {pattern} refused");
        }

        let mut upstream = self.inner.subscribe(pattern).await?;
        let closed = self.streams.lock().clone();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed.cancelled() => return,
                    note = upstream.recv() => match note {
                        Some(n) => {
                            if tx.send(n).await.is_err() {
                                return;
                            }
                        }
                        None => return,
                    },
                }
            }
        });
        Ok(rx)
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }
}
