// =============================================================================
// Cross-Exchange Candle Merger — volume-weighted composite series
// =============================================================================
//
// Keeps the last-known candle per exchange for each (symbol, timeframe) and
// window, and recomputes the composite whenever a source changes:
//
//   * one source      → that candle, unchanged
//   * several sources → open/close weighted by volume (arithmetic mean when a
//                       source has no volume), high max, low min, volume,
//                       quote volume and trade count summed,
//                       vwap = Σquote / Σvolume (close when Σvolume is 0)
//
// A merge is published only when its OHLCV differs from the last one
// published for its window, and at most once per throttle interval per key.
// Merges that arrive inside the interval are parked per window and published
// in window order by the flush tick once the interval has elapsed, so a
// rollover never swallows the final state of the closing window. The history
// ring is upserted on every recomputed merge.
//
// Everything for one (symbol, timeframe) runs behind an async gate held across
// the cache writes, so lanes of different exchanges cannot publish an older
// merge over a newer one.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{self, keys, SharedCache};
use crate::market_data::CandleBuffer;
use crate::types::{AggregatedCandle, Candle, Exchange, Timeframe};

/// Windows retained per key so late updates for a just-closed window still
/// merge against their peers.
const RETAINED_WINDOWS: usize = 3;

type MergeKey = (String, Timeframe);

#[derive(Default)]
struct KeyState {
    /// window start → latest candle per exchange
    windows: BTreeMap<i64, BTreeMap<Exchange, Candle>>,
    /// window start → last merge published for it
    published: BTreeMap<i64, AggregatedCandle>,
    /// window start → merge waiting out the throttle
    pending: BTreeMap<i64, AggregatedCandle>,
    last_publish_at: Option<Instant>,
}

impl KeyState {
    fn throttled(&self, now: Instant, throttle: Duration) -> bool {
        self.last_publish_at
            .is_some_and(|at| now.duration_since(at) < throttle)
    }

    /// Move every parked merge to published, oldest window first.
    fn take_due(&mut self, now: Instant) -> Vec<AggregatedCandle> {
        let due: Vec<AggregatedCandle> = std::mem::take(&mut self.pending).into_values().collect();
        if due.is_empty() {
            return due;
        }
        for merged in &due {
            self.published.insert(merged.timestamp, merged.clone());
        }
        while self.published.len() > RETAINED_WINDOWS {
            self.published.pop_first();
        }
        self.last_publish_at = Some(now);
        due
    }
}

/// Merge same-window candles from different exchanges.
///
/// Returns `None` for an empty slice.
pub fn merge_candles(sources: &[Candle]) -> Option<AggregatedCandle> {
    let first = sources.first()?;
    let exchanges: Vec<Exchange> = sources.iter().map(|c| c.exchange).collect();

    if sources.len() == 1 {
        return Some(AggregatedCandle {
            symbol: first.symbol.clone(),
            timeframe: first.timeframe,
            timestamp: first.timestamp,
            open: first.open,
            high: first.high,
            low: first.low,
            close: first.close,
            volume: first.volume,
            quote_volume: first.quote_volume,
            trade_count: first.trade_count,
            vwap: first.vwap,
            sources: exchanges,
        });
    }

    let volume: Decimal = sources.iter().map(|c| c.volume).sum();
    let quote_volume: Decimal = sources.iter().map(|c| c.quote_volume).sum();
    let count = Decimal::from(sources.len() as u64);
    let weighted = !volume.is_zero() && sources.iter().all(|c| !c.volume.is_zero());

    let (open, close) = if weighted {
        (
            sources.iter().map(|c| c.open * c.volume).sum::<Decimal>() / volume,
            sources.iter().map(|c| c.close * c.volume).sum::<Decimal>() / volume,
        )
    } else {
        (
            sources.iter().map(|c| c.open).sum::<Decimal>() / count,
            sources.iter().map(|c| c.close).sum::<Decimal>() / count,
        )
    };

    let high = sources.iter().map(|c| c.high).max().unwrap_or(first.high);
    let low = sources.iter().map(|c| c.low).min().unwrap_or(first.low);
    let vwap = if volume.is_zero() { close } else { quote_volume / volume };

    Some(AggregatedCandle {
        symbol: first.symbol.clone(),
        timeframe: first.timeframe,
        timestamp: first.timestamp,
        open,
        high,
        low,
        close,
        volume,
        quote_volume,
        trade_count: sources.iter().map(|c| c.trade_count).sum(),
        vwap,
        sources: exchanges,
    })
}

pub struct CandleMerger {
    state: Mutex<HashMap<MergeKey, KeyState>>,
    gates: Mutex<HashMap<MergeKey, Arc<AsyncMutex<()>>>>,
    history: Arc<CandleBuffer>,
    throttle: Duration,
    cache: SharedCache,
    ttl: Duration,
}

impl CandleMerger {
    pub fn new(cache: SharedCache, history: Arc<CandleBuffer>, throttle: Duration, ttl: Duration) -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            history,
            throttle,
            cache,
            ttl,
        }
    }

    fn gate(&self, key: &MergeKey) -> Arc<AsyncMutex<()>> {
        self.gates.lock().entry(key.clone()).or_default().clone()
    }

    /// Record a source candle and publish the recomputed merge if it changed
    /// and the key is outside its throttle interval. Returns the merge
    /// published for the candle's window, if any.
    pub async fn on_source_candle_update(&self, candle: Candle) -> Result<Option<AggregatedCandle>> {
        let key = (candle.symbol.clone(), candle.timeframe);
        let window = candle.timestamp;
        let gate = self.gate(&key);
        let _serial = gate.lock().await;

        let now = Instant::now();
        let due = {
            let mut state = self.state.lock();
            let key_state = state.entry(key.clone()).or_default();

            if let Some(&oldest) = key_state.windows.keys().next() {
                if window < oldest && key_state.windows.len() >= RETAINED_WINDOWS {
                    debug!(
                        symbol = %candle.symbol, timeframe = %candle.timeframe, window,
                        "source candle older than retained windows ignored"
                    );
                    return Ok(None);
                }
            }

            let sources = key_state.windows.entry(window).or_default();
            sources.insert(candle.exchange, candle);
            let snapshot: Vec<Candle> = sources.values().cloned().collect();
            while key_state.windows.len() > RETAINED_WINDOWS {
                key_state.windows.pop_first();
            }

            let Some(merged) = merge_candles(&snapshot) else {
                return Ok(None);
            };
            self.history.upsert(merged.clone());

            let unchanged = key_state
                .published
                .get(&window)
                .is_some_and(|p| p.same_ohlcv(&merged));
            if unchanged {
                key_state.pending.remove(&window);
            } else {
                key_state.pending.insert(window, merged);
            }

            if key_state.throttled(now, self.throttle) {
                Vec::new()
            } else {
                key_state.take_due(now)
            }
        };

        self.publish(&key, &due).await?;
        Ok(due.into_iter().find(|c| c.timestamp == window))
    }

    /// Publish parked merges whose throttle interval has elapsed.
    pub async fn flush_pending(&self) -> Result<usize> {
        let waiting: Vec<MergeKey> = self
            .state
            .lock()
            .iter()
            .filter(|(_, s)| !s.pending.is_empty())
            .map(|(k, _)| k.clone())
            .collect();

        let mut published = 0;
        for key in waiting {
            let gate = self.gate(&key);
            let _serial = gate.lock().await;

            let now = Instant::now();
            let due = match self.state.lock().get_mut(&key) {
                Some(s) if !s.throttled(now, self.throttle) => s.take_due(now),
                _ => continue,
            };
            self.publish(&key, &due).await?;
            published += due.len();
        }
        Ok(published)
    }

    /// Write the current candle and history to the cache and announce each
    /// merge in `due`. Callers hold the key's gate.
    async fn publish(&self, key: &MergeKey, due: &[AggregatedCandle]) -> Result<()> {
        if due.is_empty() {
            return Ok(());
        }
        let (symbol, tf) = (key.0.as_str(), key.1);

        if let Some(current) = self.history.latest(symbol, tf) {
            cache::set_json(self.cache.as_ref(), &keys::agg_candle(symbol, tf), &current, self.ttl).await?;
        }
        let history = self.history.range(symbol, tf, None, None, usize::MAX);
        cache::set_json(self.cache.as_ref(), &keys::agg_candle_history(symbol, tf), &history, self.ttl)
            .await?;

        for merged in due {
            let payload = serde_json::to_string(merged)?;
            self.cache.publish(&keys::agg_candle_channel(symbol, tf), payload).await?;
            debug!(
                symbol, timeframe = %tf, ts = merged.timestamp, sources = merged.sources.len(),
                history = self.history.count(symbol, tf),
                "aggregated candle published"
            );
        }
        Ok(())
    }

    /// History for `(symbol, timeframe)`, oldest first.
    pub fn get_candle_history(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: Option<i64>,
        to: Option<i64>,
        limit: Option<usize>,
    ) -> Vec<AggregatedCandle> {
        self.history
            .range(symbol, timeframe, from, to, limit.unwrap_or(usize::MAX))
    }

    /// Drive `flush_pending` at the throttle interval until cancelled.
    pub async fn run_flush_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.throttle.max(Duration::from_millis(10)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = self.flush_pending().await {
                        warn!(error = %e, "aggregated candle flush failed");
                    }
                }
            }
        }
        info!("candle merger stopped");
    }
}

// =============================================================================
// Tests
// =============================================================================
