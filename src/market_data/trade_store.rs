//! Durable trade storage contract.
//!
//! The relational store itself lives outside the hub; this trait is the seam.
//! `insert_batch` must be idempotent on `(exchange, id)` so that retried
//! batches never create duplicate rows.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;

use crate::types::{Exchange, Trade};

/// How far behind its newest trade a series is kept by default.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(86_400);

#[async_trait]
pub trait TradeStore: Send + Sync {
    /// Insert rows, skipping ids already stored. Returns how many were new.
    async fn insert_batch(&self, trades: &[Trade]) -> Result<usize>;

    /// Trades with `from <= timestamp <= to`, oldest first.
    async fn query_range(
        &self,
        symbol: &str,
        exchange: Exchange,
        from: i64,
        to: i64,
    ) -> Result<Vec<Trade>>;
}

type SeriesKey = (Exchange, String);

/// In-process store used when no external database is wired in.
///
/// Each series keeps only trades within `retention` of its newest timestamp;
/// older rows, and their ids, are pruned on insert. Trades arriving already
/// behind that horizon are skipped.
pub struct MemoryTradeStore {
    inner: RwLock<Inner>,
    retention_ms: i64,
}

#[derive(Default)]
struct Inner {
    series: HashMap<SeriesKey, BTreeMap<(i64, String), Trade>>,
    ids: HashSet<(Exchange, String)>,
}

impl MemoryTradeStore {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            retention_ms: i64::try_from(retention.as_millis()).unwrap_or(i64::MAX),
        }
    }

    pub fn row_count(&self) -> usize {
        self.inner.read().ids.len()
    }

    fn horizon(&self, series: &BTreeMap<(i64, String), Trade>) -> Option<i64> {
        let (&(newest, _), _) = series.last_key_value()?;
        Some(newest.saturating_sub(self.retention_ms))
    }
}

impl Default for MemoryTradeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TradeStore for MemoryTradeStore {
    async fn insert_batch(&self, trades: &[Trade]) -> Result<usize> {
        let mut guard = self.inner.write();
        let Inner { series, ids } = &mut *guard;
        let mut touched: HashSet<SeriesKey> = HashSet::new();
        let mut inserted = 0;

        for trade in trades {
            let key = (trade.exchange, trade.symbol.clone());
            let rows = series.entry(key.clone()).or_default();
            if self.horizon(rows).is_some_and(|h| trade.timestamp < h) {
                continue;
            }
            if !ids.insert((trade.exchange, trade.id.clone())) {
                continue;
            }
            rows.insert((trade.timestamp, trade.id.clone()), trade.clone());
            touched.insert(key);
            inserted += 1;
        }

        for key in touched {
            let Some(rows) = series.get_mut(&key) else { continue };
            let Some(horizon) = self.horizon(rows) else { continue };
            let kept = rows.split_off(&(horizon, String::new()));
            for (_, pruned) in std::mem::replace(rows, kept) {
                ids.remove(&(pruned.exchange, pruned.id));
            }
        }
        Ok(inserted)
    }

    async fn query_range(
        &self,
        symbol: &str,
        exchange: Exchange,
        from: i64,
        to: i64,
    ) -> Result<Vec<Trade>> {
        let inner = self.inner.read();
        let Some(series) = inner.series.get(&(exchange, symbol.to_string())) else {
            return Ok(Vec::new());
        };
        Ok(series
            .range((from, String::new())..)
            .take_while(|((ts, _), _)| *ts <= to)
            .map(|(_, t)| t.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;
    use rust_decimal_macros::dec;

    fn trade(id: &str, ts: i64) -> Trade {
        Trade {
            id: id.into(),
            symbol: "BTC".into(),
            exchange: Exchange::Binance,
            price: dec!(100),
            size: dec!(1),
            side: Side::Buy,
            timestamp: ts,
            block_time: None,
        }
    }

    #[tokio::test]
    async fn insert_is_idempotent_on_id() {
        let store = MemoryTradeStore::new();
        assert_eq!(store.insert_batch(&[trade("a", 1), trade("b", 2)]).await.unwrap(), 2);
        assert_eq!(store.insert_batch(&[trade("b", 2), trade("c", 3)]).await.unwrap(), 1);
        assert_eq!(store.row_count(), 3);
    }

    #[tokio::test]
    async fn range_query_is_inclusive_and_ordered() {
        let store = MemoryTradeStore::new();
        store
            .insert_batch(&[trade("c", 30), trade("a", 10), trade("b", 20), trade("d", 40)])
            .await
            .unwrap();
        let rows = store.query_range("BTC", Exchange::Binance, 20, 30).await.unwrap();
        let ids: Vec<&str> = rows.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert!(store.query_range("ETH", Exchange::Binance, 0, 99).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rows_behind_the_retention_horizon_are_pruned() {
        let store = MemoryTradeStore::with_retention(Duration::from_millis(100));
        store
            .insert_batch(&[trade("a", 1_000), trade("b", 1_050)])
            .await
            .unwrap();
        assert_eq!(store.row_count(), 2);

        // Newest is now 1_120, so everything before 1_020 goes.
        assert_eq!(store.insert_batch(&[trade("c", 1_120)]).await.unwrap(), 1);
        assert_eq!(store.row_count(), 2);
        let ids: Vec<String> = store
            .query_range("BTC", Exchange::Binance, 0, i64::MAX)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec!["b", "c"]);

        // A replay of a pruned trade is behind the horizon and stays out.
        assert_eq!(store.insert_batch(&[trade("a", 1_000)]).await.unwrap(), 0);
        assert_eq!(store.row_count(), 2);

        // Bounded under a long stream.
        let burst: Vec<Trade> = (0..1_000).map(|i| trade(&format!("t{i}"), 2_000 + i)).collect();
        store.insert_batch(&burst).await.unwrap();
        assert_eq!(store.row_count(), 101);
    }
}
