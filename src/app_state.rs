// =============================================================================
// Central Application State — Market Hub
// =============================================================================
//
// Ties the engines together for the API layer and startup wiring. Every
// engine owns its own interior mutability; AppState only holds Arcs, plus the
// worker status handles the health endpoint reports.
//
// Thread safety:
//   - parking_lot::RwLock for the config and the worker registry.
//   - Arc wrappers for engines shared with the pipeline lanes.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::aggregation::{BookMerger, CandleMerger};
use crate::api::hub::Hub;
use crate::cache::{keys::CacheTtls, SharedCache};
use crate::ingestion::{WorkerStatus, WorkerStatusSnapshot};
use crate::market_data::{CandleBuffer, OrderBookEngine, TradeAggregator, TradeBuffer, TradeStore};
use crate::pipeline::{Pipeline, NATIVE_CANDLE_VENUES};
use crate::runtime_config::RuntimeConfig;
use crate::types::Exchange;

/// Shared state handed to every axum handler via `State<Arc<AppState>>`.
pub struct AppState {
    // ── Configuration ───────────────────────────────────────────────────
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,
    pub ttls: CacheTtls,

    // ── Storage ─────────────────────────────────────────────────────────
    pub cache: SharedCache,
    pub trade_store: Arc<dyn TradeStore>,
    pub trade_buffer: Arc<TradeBuffer>,

    // ── Engines ─────────────────────────────────────────────────────────
    pub books: Arc<OrderBookEngine>,
    pub trades: Arc<TradeAggregator>,
    pub candles: Arc<CandleMerger>,
    pub book_merger: Arc<BookMerger>,

    // ── Fan-out ─────────────────────────────────────────────────────────
    pub hub: Arc<Hub>,

    // ── Operational status ──────────────────────────────────────────────
    pub workers: RwLock<Vec<(Exchange, Arc<WorkerStatus>)>>,
    pub start_time: Instant,
}

impl AppState {
    /// Build every engine from `config`. Nothing is spawned here.
    pub fn new(config: RuntimeConfig, cache: SharedCache, trade_store: Arc<dyn TradeStore>) -> Self {
        let ttls = CacheTtls::from_config(&config);
        let trade_buffer = Arc::new(TradeBuffer::new(
            config.persistence.batch_size,
            config.persistence.buffer_capacity,
        ));

        let books = Arc::new(OrderBookEngine::new(cache.clone(), config.book_depth, ttls.orderbook));
        let trades = Arc::new(
            TradeAggregator::new(
                cache.clone(),
                ttls,
                config.timeframes.clone(),
                config.recent_trades,
                trade_buffer.clone(),
                trade_store.clone(),
            )
            .with_native_candles(NATIVE_CANDLE_VENUES),
        );
        let candles = Arc::new(CandleMerger::new(
            cache.clone(),
            Arc::new(CandleBuffer::new(config.history_capacity)),
            Duration::from_millis(config.merge_throttle_ms),
            ttls.chart,
        ));
        let book_merger = Arc::new(BookMerger::new(
            cache.clone(),
            config.book_depth,
            config.book_stale_ms,
            ttls.orderbook,
        ));
        let hub = Arc::new(
            Hub::new(
                cache.clone(),
                config.max_subscriptions_per_client,
                config.client_queue_capacity,
            )
            .with_resubscribe(config.reconnect.clone()),
        );

        Self {
            runtime_config: Arc::new(RwLock::new(config)),
            ttls,
            cache,
            trade_store,
            trade_buffer,
            books,
            trades,
            candles,
            book_merger,
            hub,
            workers: RwLock::new(Vec::new()),
            start_time: Instant::now(),
        }
    }

    /// Event pipeline over this state's engines.
    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(
            self.books.clone(),
            self.trades.clone(),
            self.candles.clone(),
            self.book_merger.clone(),
            self.cache.clone(),
            self.ttls,
        )
    }

    pub fn register_worker(&self, exchange: Exchange, status: Arc<WorkerStatus>) {
        self.workers.write().push((exchange, status));
    }

    pub fn worker_statuses(&self) -> Vec<WorkerStatusSnapshot> {
        self.workers
            .read()
            .iter()
            .map(|(ex, status)| status.snapshot(*ex))
            .collect()
    }

    pub fn client_ping_interval(&self) -> Duration {
        Duration::from_secs(self.runtime_config.read().client_ping_secs.max(1))
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
