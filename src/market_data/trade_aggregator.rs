// =============================================================================
// Trade Aggregator — live per-exchange candles and recent trade windows
// =============================================================================
//
// Each incoming batch is de-duplicated by trade id against the recent window,
// folded into one live candle per configured timeframe, appended to the write
// buffer and mirrored into the cache. When a trade opens a new window the
// previous candle is emitted as closed before the new one starts.
//
// Window metrics come from the in-memory recent trades when those reach back
// to the window start; otherwise durable history is merged in. Both paths
// produce the same `TradeMetrics` shape.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::trade_buffer::TradeBuffer;
use super::trade_store::TradeStore;
use crate::cache::{self, keys, keys::CacheTtls, SharedCache};
use crate::types::{now_ms, Candle, Exchange, Timeframe, Trade};

/// How many of the most recent trades are mirrored into the cache per key.
const CACHED_RECENT_TRADES: usize = 100;

type SeriesKey = (Exchange, String);
type CandleKey = (Exchange, String, Timeframe);

/// A candle state change produced by `process_trades`.
#[derive(Debug, Clone, PartialEq)]
pub struct CandleUpdate {
    pub candle: Candle,
    pub closed: bool,
}

/// Summary statistics over a trailing time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeMetrics {
    pub price: Decimal,
    pub price_change: Decimal,
    pub price_change_percent: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub volume: Decimal,
    pub quote_volume: Decimal,
    pub trade_count: u64,
    pub from: i64,
    pub to: i64,
}

impl TradeMetrics {
    /// `trades` must be sorted by timestamp. `None` when empty.
    pub fn from_trades(trades: &[Trade], from: i64, to: i64) -> Option<Self> {
        let first = trades.first()?;
        let last = trades.last()?;

        let mut high = first.price;
        let mut low = first.price;
        let mut volume = Decimal::ZERO;
        let mut quote_volume = Decimal::ZERO;
        for t in trades {
            high = high.max(t.price);
            low = low.min(t.price);
            volume += t.size;
            quote_volume += t.price * t.size;
        }

        let price_change = last.price - first.price;
        let price_change_percent = if first.price.is_zero() {
            Decimal::ZERO
        } else {
            (price_change / first.price * Decimal::ONE_HUNDRED).round_dp(4)
        };

        Some(Self {
            price: last.price,
            price_change,
            price_change_percent,
            high,
            low,
            volume,
            quote_volume,
            trade_count: trades.len() as u64,
            from,
            to,
        })
    }
}

#[derive(Default)]
struct RecentTrades {
    trades: VecDeque<Trade>,
    ids: HashSet<String>,
}

impl RecentTrades {
    /// Append unseen trades, returning the ones that were new.
    fn absorb(&mut self, incoming: Vec<Trade>, capacity: usize) -> Vec<Trade> {
        let mut fresh = Vec::with_capacity(incoming.len());
        for trade in incoming {
            if !self.ids.insert(trade.id.clone()) {
                continue;
            }
            self.trades.push_back(trade.clone());
            fresh.push(trade);
        }
        while self.trades.len() > capacity {
            if let Some(old) = self.trades.pop_front() {
                self.ids.remove(&old.id);
            }
        }
        fresh
    }

    fn latest(&self, limit: usize) -> Vec<Trade> {
        let start = self.trades.len().saturating_sub(limit);
        self.trades.iter().skip(start).cloned().collect()
    }
}

pub struct TradeAggregator {
    timeframes: Vec<Timeframe>,
    recent_capacity: usize,
    candles: RwLock<HashMap<CandleKey, Candle>>,
    recent: RwLock<HashMap<SeriesKey, RecentTrades>>,
    buffer: Arc<TradeBuffer>,
    store: Arc<dyn TradeStore>,
    cache: SharedCache,
    ttls: CacheTtls,
    /// Venues whose native candles own the per-exchange candle keys.
    native_candles: HashSet<Exchange>,
}

impl TradeAggregator {
    pub fn new(
        cache: SharedCache,
        ttls: CacheTtls,
        timeframes: Vec<Timeframe>,
        recent_capacity: usize,
        buffer: Arc<TradeBuffer>,
        store: Arc<dyn TradeStore>,
    ) -> Self {
        Self {
            timeframes,
            recent_capacity: recent_capacity.max(1),
            candles: RwLock::new(HashMap::new()),
            recent: RwLock::new(HashMap::new()),
            buffer,
            store,
            cache,
            ttls,
            native_candles: HashSet::new(),
        }
    }

    /// Stop mirroring trade-derived candles for venues that stream their own.
    pub fn with_native_candles(mut self, exchanges: impl IntoIterator<Item = Exchange>) -> Self {
        self.native_candles = exchanges.into_iter().collect();
        self
    }

    pub fn has_native_candles(&self, exchange: Exchange) -> bool {
        self.native_candles.contains(&exchange)
    }

    /// Ingest a batch of trades for one (exchange, symbol).
    ///
    /// Returns every candle that changed: windows that closed during the batch
    /// (`closed: true`) followed by the current live candle per timeframe.
    pub async fn process_trades(
        &self,
        exchange: Exchange,
        symbol: &str,
        trades: Vec<Trade>,
    ) -> Result<Vec<CandleUpdate>> {
        let series = (exchange, symbol.to_string());
        let (mut fresh, cached_recent) = {
            let mut recent = self.recent.write();
            let entry = recent.entry(series).or_default();
            let fresh = entry.absorb(trades, self.recent_capacity);
            (fresh, entry.latest(CACHED_RECENT_TRADES))
        };
        if fresh.is_empty() {
            return Ok(Vec::new());
        }
        fresh.sort_by_key(|t| t.timestamp);

        let updates = self.fold_candles(exchange, symbol, &fresh);
        self.buffer.push(fresh.iter().cloned());

        let ttl = self.ttls.trades;
        cache::set_json(self.cache.as_ref(), &keys::trades(exchange, symbol), &cached_recent, ttl)
            .await?;
        let payload = serde_json::to_string(&fresh)?;
        self.cache
            .publish(&keys::trades_channel(exchange, symbol), payload)
            .await?;

        if !self.has_native_candles(exchange) {
            for update in &updates {
                let c = &update.candle;
                cache::set_and_publish(
                    self.cache.as_ref(),
                    &keys::candle(exchange, symbol, c.timeframe),
                    &keys::candle_channel(exchange, symbol, c.timeframe),
                    c,
                    self.ttls.chart,
                )
                .await?;
            }
        }

        Ok(updates)
    }

    fn fold_candles(&self, exchange: Exchange, symbol: &str, trades: &[Trade]) -> Vec<CandleUpdate> {
        let mut closed = Vec::new();
        let mut touched: Vec<Timeframe> = Vec::new();
        let mut candles = self.candles.write();

        for &tf in &self.timeframes {
            let key = (exchange, symbol.to_string(), tf);
            for trade in trades {
                let window = tf.window_start(trade.timestamp);
                match candles.get_mut(&key) {
                    Some(live) if live.timestamp == window => live.apply_trade(trade),
                    Some(live) if live.timestamp > window => {
                        debug!(
                            %exchange, symbol, timeframe = %tf, trade_ts = trade.timestamp,
                            "trade older than live window ignored for candles"
                        );
                        continue;
                    }
                    Some(live) => {
                        let finished = std::mem::replace(live, Candle::open_from_trade(trade, tf));
                        closed.push(CandleUpdate { candle: finished, closed: true });
                    }
                    None => {
                        candles.insert(key.clone(), Candle::open_from_trade(trade, tf));
                    }
                }
                if !touched.contains(&tf) {
                    touched.push(tf);
                }
            }
        }

        let live = touched.into_iter().filter_map(|tf| {
            candles
                .get(&(exchange, symbol.to_string(), tf))
                .map(|c| CandleUpdate { candle: c.clone(), closed: false })
        });
        closed.extend(live);
        closed
    }

    /// Current live candle for a key.
    pub fn get_aggregation(&self, symbol: &str, exchange: Exchange, timeframe: Timeframe) -> Option<Candle> {
        self.candles
            .read()
            .get(&(exchange, symbol.to_string(), timeframe))
            .cloned()
    }

    /// Most recent `limit` trades, oldest first.
    pub fn get_recent_trades(&self, symbol: &str, exchange: Exchange, limit: usize) -> Vec<Trade> {
        self.recent
            .read()
            .get(&(exchange, symbol.to_string()))
            .map(|r| r.latest(limit))
            .unwrap_or_default()
    }

    /// Metrics over the trailing `window`.
    pub async fn get_trade_metrics(
        &self,
        symbol: &str,
        exchange: Exchange,
        window: Duration,
    ) -> Result<Option<TradeMetrics>> {
        self.metrics_at(symbol, exchange, window, now_ms()).await
    }

    async fn metrics_at(
        &self,
        symbol: &str,
        exchange: Exchange,
        window: Duration,
        now: i64,
    ) -> Result<Option<TradeMetrics>> {
        let span = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        let from = now.saturating_sub(span);

        let (covered, in_window) = {
            let recent = self.recent.read();
            match recent.get(&(exchange, symbol.to_string())) {
                Some(r) => {
                    let covered = r.trades.front().is_some_and(|t| t.timestamp <= from);
                    let in_window: Vec<Trade> = r
                        .trades
                        .iter()
                        .filter(|t| t.timestamp >= from && t.timestamp <= now)
                        .cloned()
                        .collect();
                    (covered, in_window)
                }
                None => (false, Vec::new()),
            }
        };

        let mut trades = if covered {
            debug!(symbol, %exchange, "trade metrics from live window");
            in_window
        } else {
            debug!(symbol, %exchange, "trade metrics from durable history");
            let mut rows = self.store.query_range(symbol, exchange, from, now).await?;
            let seen: HashSet<String> = rows.iter().map(|t| t.id.clone()).collect();
            rows.extend(in_window.into_iter().filter(|t| !seen.contains(&t.id)));
            rows
        };
        trades.sort_by_key(|t| t.timestamp);

        Ok(TradeMetrics::from_trades(&trades, from, now))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStore, MemoryCache};
    use crate::market_data::trade_store::MemoryTradeStore;
    use crate::types::Side;
    use rust_decimal_macros::dec;

    fn trade(id: &str, price: Decimal, size: Decimal, ts: i64) -> Trade {
        Trade {
            id: id.into(),
            symbol: "BTC".into(),
            exchange: Exchange::Hyperliquid,
            price,
            size,
            side: Side::Buy,
            timestamp: ts,
            block_time: None,
        }
    }

    struct Fixture {
        agg: TradeAggregator,
        cache: Arc<MemoryCache>,
        buffer: Arc<TradeBuffer>,
        store: Arc<MemoryTradeStore>,
    }

    fn fixture(recent_capacity: usize) -> Fixture {
        let cache = Arc::new(MemoryCache::new());
        let buffer = Arc::new(TradeBuffer::new(100, 10_000));
        let store = Arc::new(MemoryTradeStore::new());
        let agg = TradeAggregator::new(
            cache.clone(),
            CacheTtls::default(),
            vec![Timeframe::M1, Timeframe::M5],
            recent_capacity,
            buffer.clone(),
            store.clone(),
        );
        Fixture { agg, cache, buffer, store }
    }

    #[tokio::test]
    async fn folds_ohlcv_within_window() {
        let f = fixture(100);
        let trades = vec![
            trade("1", dec!(100), dec!(1), 60_000),
            trade("2", dec!(105), dec!(2), 60_500),
            trade("3", dec!(95), dec!(1), 61_000),
            trade("4", dec!(102), dec!(1), 61_500),
        ];
        let updates = f.agg.process_trades(Exchange::Hyperliquid, "BTC", trades).await.unwrap();
        assert_eq!(updates.len(), 2);
        assert!(updates.iter().all(|u| !u.closed));

        let c = f.agg.get_aggregation("BTC", Exchange::Hyperliquid, Timeframe::M1).unwrap();
        assert_eq!(c.timestamp, 60_000);
        assert_eq!((c.open, c.high, c.low, c.close), (dec!(100), dec!(105), dec!(95), dec!(102)));
        assert_eq!(c.volume, dec!(5));
        assert_eq!(c.trade_count, 4);
        // (100 + 210 + 95 + 102) / 5
        assert_eq!(c.vwap, dec!(101.4));
        assert!(c.low <= c.open.min(c.close) && c.high >= c.open.max(c.close));
    }

    #[tokio::test]
    async fn window_change_emits_closed_candle() {
        let f = fixture(100);
        f.agg
            .process_trades(Exchange::Hyperliquid, "BTC", vec![trade("1", dec!(100), dec!(1), 119_999)])
            .await
            .unwrap();
        let updates = f
            .agg
            .process_trades(Exchange::Hyperliquid, "BTC", vec![trade("2", dec!(101), dec!(1), 120_000)])
            .await
            .unwrap();

        let closed: Vec<&CandleUpdate> = updates.iter().filter(|u| u.closed).collect();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].candle.timeframe, Timeframe::M1);
        assert_eq!(closed[0].candle.timestamp, 60_000);
        assert_eq!(closed[0].candle.close, dec!(100));

        let m5 = f.agg.get_aggregation("BTC", Exchange::Hyperliquid, Timeframe::M5).unwrap();
        assert_eq!(m5.trade_count, 2);
    }

    #[tokio::test]
    async fn duplicate_trade_ids_are_ignored() {
        let f = fixture(100);
        let batch = vec![trade("1", dec!(100), dec!(1), 1_000), trade("2", dec!(101), dec!(1), 2_000)];
        f.agg.process_trades(Exchange::Hyperliquid, "BTC", batch.clone()).await.unwrap();
        let updates = f.agg.process_trades(Exchange::Hyperliquid, "BTC", batch).await.unwrap();

        assert!(updates.is_empty());
        assert_eq!(f.buffer.len(), 2);
        let c = f.agg.get_aggregation("BTC", Exchange::Hyperliquid, Timeframe::M1).unwrap();
        assert_eq!(c.trade_count, 2);
    }

    #[tokio::test]
    async fn late_trade_does_not_reopen_closed_window() {
        let f = fixture(100);
        f.agg
            .process_trades(Exchange::Hyperliquid, "BTC", vec![trade("1", dec!(100), dec!(1), 130_000)])
            .await
            .unwrap();
        f.agg
            .process_trades(Exchange::Hyperliquid, "BTC", vec![trade("0", dec!(90), dec!(1), 59_000)])
            .await
            .unwrap();
        let c = f.agg.get_aggregation("BTC", Exchange::Hyperliquid, Timeframe::M1).unwrap();
        assert_eq!(c.timestamp, 120_000);
        assert_eq!(c.low, dec!(100));
        // Still persisted.
        assert_eq!(f.buffer.len(), 2);
    }

    #[tokio::test]
    async fn recent_trades_and_cache_mirror() {
        let f = fixture(3);
        let batch: Vec<Trade> = (0..5)
            .map(|i| trade(&i.to_string(), Decimal::from(100 + i), dec!(1), 1_000 + i))
            .collect();
        f.agg.process_trades(Exchange::Hyperliquid, "BTC", batch).await.unwrap();

        let recent = f.agg.get_recent_trades("BTC", Exchange::Hyperliquid, 10);
        let ids: Vec<&str> = recent.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3", "4"]);

        let cached: Vec<Trade> = cache::get_json(f.cache.as_ref(), &keys::trades(Exchange::Hyperliquid, "BTC"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.len(), 3);
        let candle: Option<Candle> = cache::get_json(
            f.cache.as_ref(),
            &keys::candle(Exchange::Hyperliquid, "BTC", Timeframe::M1),
        )
        .await
        .unwrap();
        assert_eq!(candle.unwrap().trade_count, 5);
    }

    #[tokio::test]
    async fn native_candle_venues_keep_their_candle_keys() {
        let f = fixture(100);
        let agg = TradeAggregator::new(
            f.cache.clone(),
            CacheTtls::default(),
            vec![Timeframe::M1],
            100,
            f.buffer.clone(),
            f.store.clone(),
        )
        .with_native_candles([Exchange::Hyperliquid]);

        let updates = agg
            .process_trades(Exchange::Hyperliquid, "BTC", vec![trade("1", dec!(100), dec!(1), 1_000)])
            .await
            .unwrap();
        assert_eq!(updates.len(), 1);
        let key = keys::candle(Exchange::Hyperliquid, "BTC", Timeframe::M1);
        assert!(f.cache.get(&key).await.unwrap().is_none());
        assert!(f.cache.get(&keys::trades(Exchange::Hyperliquid, "BTC")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn metrics_from_history_match_live_window() {
        let batch: Vec<Trade> = vec![
            trade("a", dec!(100), dec!(1), 10_000),
            trade("b", dec!(110), dec!(2), 20_000),
            trade("c", dec!(90), dec!(1), 30_000),
            trade("d", dec!(105), dec!(1), 40_000),
        ];
        let now = 45_000;
        let window = Duration::from_millis(40_000);

        // Recent trades reach back past the window start: served live.
        let live = fixture(100);
        live.agg
            .process_trades(Exchange::Hyperliquid, "BTC", vec![trade("z", dec!(1), dec!(1), 1_000)])
            .await
            .unwrap();
        live.agg.process_trades(Exchange::Hyperliquid, "BTC", batch.clone()).await.unwrap();
        assert!(live.store.row_count() == 0);
        let live_metrics = live
            .agg
            .metrics_at("BTC", Exchange::Hyperliquid, window, now)
            .await
            .unwrap()
            .unwrap();

        // Tiny recent window: must fall back to durable history.
        let cold = fixture(2);
        cold.agg.process_trades(Exchange::Hyperliquid, "BTC", batch).await.unwrap();
        cold.buffer.flush_once(cold.store.as_ref()).await;
        let cold_metrics = cold
            .agg
            .metrics_at("BTC", Exchange::Hyperliquid, window, now)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(live_metrics, cold_metrics);
        assert_eq!(cold_metrics.price, dec!(105));
        assert_eq!(cold_metrics.price_change, dec!(5));
        assert_eq!(cold_metrics.price_change_percent, dec!(5));
        assert_eq!((cold_metrics.high, cold_metrics.low), (dec!(110), dec!(90)));
        assert_eq!(cold_metrics.volume, dec!(5));
        assert_eq!(cold_metrics.trade_count, 4);
    }

    #[tokio::test]
    async fn metrics_include_unflushed_trades() {
        let f = fixture(2);
        let batch = vec![
            trade("a", dec!(100), dec!(1), 10_000),
            trade("b", dec!(100), dec!(1), 20_000),
            trade("c", dec!(100), dec!(1), 30_000),
        ];
        f.agg.process_trades(Exchange::Hyperliquid, "BTC", batch).await.unwrap();
        let m = f
            .agg
            .metrics_at("BTC", Exchange::Hyperliquid, Duration::from_millis(25_000), 31_000)
            .await
            .unwrap()
            .unwrap();
        // Nothing persisted yet; only the in-memory tail is available.
        assert_eq!(m.trade_count, 2);
    }

    #[tokio::test]
    async fn oversized_window_does_not_overflow() {
        let f = fixture(10);
        f.agg
            .process_trades(Exchange::Hyperliquid, "BTC", vec![trade("a", dec!(100), dec!(1), 10_000)])
            .await
            .unwrap();
        let m = f
            .agg
            .metrics_at("BTC", Exchange::Hyperliquid, Duration::MAX, 20_000)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(m.from, 20_000 - i64::MAX);
        assert_eq!(m.trade_count, 1);
    }

    #[tokio::test]
    async fn metrics_empty_window_is_none() {
        let f = fixture(10);
        let m = f
            .agg
            .get_trade_metrics("BTC", Exchange::Hyperliquid, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(m.is_none());
    }
}
