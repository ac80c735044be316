// =============================================================================
// Event Pipeline — dispatcher and per-(exchange, symbol) lanes
// =============================================================================
//
// Workers push normalized events into one channel. The dispatcher routes each
// event to the lane task for its (exchange, symbol), creating lanes on first
// sight. A lane applies its events strictly in arrival order; different lanes
// run in parallel. When the inbound channel closes or the token is cancelled,
// lanes drain what they already hold and exit.
//
// Routing inside a lane:
//   book snapshot / diff → OrderBookEngine → BookMerger (applied books only)
//   trades               → TradeAggregator → CandleMerger (non-native venues)
//   native candle        → per-exchange candle cache → CandleMerger
//   released             → drop the live book, its cache entry and its share
//                          of the consolidated book, then close the lane
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregation::{BookMerger, CandleMerger};
use crate::cache::{self, keys, keys::CacheTtls, SharedCache};
use crate::market_data::{DiffOutcome, OrderBookEngine, TradeAggregator};
use crate::types::{Exchange, MarketEvent};

/// Venues that stream their own candles.
pub const NATIVE_CANDLE_VENUES: [Exchange; 2] = [Exchange::Binance, Exchange::Hyperliquid];

type LaneKey = (Exchange, String);

pub struct Pipeline {
    books: Arc<OrderBookEngine>,
    trades: Arc<TradeAggregator>,
    candles: Arc<CandleMerger>,
    book_merger: Arc<BookMerger>,
    cache: SharedCache,
    ttls: CacheTtls,
}

impl Pipeline {
    pub fn new(
        books: Arc<OrderBookEngine>,
        trades: Arc<TradeAggregator>,
        candles: Arc<CandleMerger>,
        book_merger: Arc<BookMerger>,
        cache: SharedCache,
        ttls: CacheTtls,
    ) -> Self {
        Self {
            books,
            trades,
            candles,
            book_merger,
            cache,
            ttls,
        }
    }

    /// Apply one event to every component it concerns.
    pub async fn handle(&self, event: MarketEvent) -> Result<()> {
        match event {
            MarketEvent::BookSnapshot(book) => {
                let applied = self.books.apply_snapshot(book).await?;
                self.book_merger.on_book(&applied).await?;
            }
            MarketEvent::BookDiff(update) => {
                if let DiffOutcome::Applied(book) = self.books.apply_diff(update).await? {
                    self.book_merger.on_book(&book).await?;
                }
            }
            MarketEvent::Trades { exchange, symbol, trades } => {
                let updates = self.trades.process_trades(exchange, &symbol, trades).await?;
                if !self.trades.has_native_candles(exchange) {
                    for update in updates {
                        self.candles.on_source_candle_update(update.candle).await?;
                    }
                }
            }
            MarketEvent::Candle(candle) => {
                cache::set_and_publish(
                    self.cache.as_ref(),
                    &keys::candle(candle.exchange, &candle.symbol, candle.timeframe),
                    &keys::candle_channel(candle.exchange, &candle.symbol, candle.timeframe),
                    &candle,
                    self.ttls.chart,
                )
                .await?;
                self.candles.on_source_candle_update(candle).await?;
            }
            MarketEvent::Released { exchange, symbol } => {
                self.release(exchange, &symbol).await?;
            }
        }
        Ok(())
    }

    async fn release(&self, exchange: Exchange, symbol: &str) -> Result<()> {
        let had_book = self.books.remove(symbol, exchange).is_some();
        self.cache.delete(&keys::orderbook(exchange, symbol)).await?;
        self.book_merger.release(symbol, exchange).await?;
        debug!(%exchange, symbol, had_book, "symbol released");
        Ok(())
    }

    /// Route events into lanes until `events` closes or `cancel` fires, then
    /// wait for every lane to drain.
    pub async fn run_dispatcher(
        self: Arc<Self>,
        mut events: mpsc::Receiver<MarketEvent>,
        lane_capacity: usize,
        cancel: CancellationToken,
    ) {
        let mut lanes: HashMap<LaneKey, Lane> = HashMap::new();
        // Released lanes still finishing their queue; a reopened lane for the
        // same key waits for its predecessor before applying anything.
        let mut draining: HashMap<LaneKey, oneshot::Receiver<()>> = HashMap::new();
        let mut tasks = JoinSet::new();

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                ev = events.recv() => match ev {
                    Some(ev) => ev,
                    None => break,
                },
            };

            let (exchange, symbol) = event.key();
            let key = (exchange, symbol.to_string());
            let lane = lanes.entry(key.clone()).or_insert_with(|| {
                let after = draining.remove(&key);
                self.clone().spawn_lane(&mut tasks, key.clone(), lane_capacity, after)
            });

            let closing = matches!(event, MarketEvent::Released { .. });
            if lane.tx.send(event).await.is_err() {
                warn!(exchange = %key.0, symbol = %key.1, "lane closed, event dropped");
                lanes.remove(&key);
            } else if closing {
                if let Some(lane) = lanes.remove(&key) {
                    draining.retain(|_, done| matches!(done.try_recv(), Err(TryRecvError::Empty)));
                    draining.insert(key, lane.done);
                }
            }
        }

        let open = lanes.len();
        drop(lanes);
        while tasks.join_next().await.is_some() {}
        info!(lanes = open, "dispatcher stopped");
    }

    fn spawn_lane(
        self: Arc<Self>,
        tasks: &mut JoinSet<()>,
        key: LaneKey,
        capacity: usize,
        after: Option<oneshot::Receiver<()>>,
    ) -> Lane {
        let (tx, mut rx) = mpsc::channel(capacity.max(1));
        let (finished, done) = oneshot::channel::<()>();
        debug!(exchange = %key.0, symbol = %key.1, "lane opened");
        tasks.spawn(async move {
            if let Some(previous) = after {
                let _ = previous.await;
            }
            while let Some(event) = rx.recv().await {
                if let Err(e) = self.handle(event).await {
                    warn!(exchange = %key.0, symbol = %key.1, error = %e, "event processing failed");
                }
            }
            drop(finished);
        });
        Lane { tx, done }
    }
}

struct Lane {
    tx: mpsc::Sender<MarketEvent>,
    /// Resolves (closed) when the lane task exits.
    done: oneshot::Receiver<()>,
}

// =============================================================================
// Tests
// =============================================================================
