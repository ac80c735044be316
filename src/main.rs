// =============================================================================
// Market Hub — Main Entry Point
// =============================================================================
//
// Startup order: config → cache → engines → background loops → exchange
// workers → HTTP server. Ctrl-C cancels the root token; shutdown then runs in
// dependency order so no accepted trade is lost between the lanes and the
// final flush.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod aggregation;
mod api;
mod app_state;
mod cache;
mod ingestion;
mod market_data;
mod pipeline;
mod runtime_config;
mod types;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::cache::{MemoryCache, RedisCache, SharedCache};
use crate::ingestion::binance::BinanceRestClient;
use crate::ingestion::{BinanceAdapter, HyperliquidAdapter, LighterAdapter, WorkerHandle};
use crate::market_data::{MemoryTradeStore, TradeStore};
use crate::runtime_config::RuntimeConfig;
use crate::types::{Exchange, MarketEvent};

const CONFIG_PATH: &str = "hub_config.json";
const EVENT_CHANNEL_CAPACITY: usize = 10_000;
const LANE_CAPACITY: usize = 1_024;
const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Market Hub — Starting Up                         ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        let defaults = RuntimeConfig::default();
        if !Path::new(CONFIG_PATH).exists() {
            if let Err(e) = defaults.save(CONFIG_PATH) {
                warn!(error = %e, "Failed to write default config");
            }
        }
        defaults
    });
    config.apply_env_overrides()?;

    info!(
        symbols = ?config.symbols,
        exchanges = ?config.exchanges,
        timeframes = ?config.timeframes,
        "Configured markets"
    );

    let root = CancellationToken::new();
    let flush_cancel = CancellationToken::new();

    // ── 2. Cache backend ─────────────────────────────────────────────────
    // Redis is connected in the background; until it is up, cache writes
    // fail per event and /health reports degraded.
    let cache: SharedCache = match config.cache_url.as_deref() {
        Some(url) => {
            let redis = Arc::new(RedisCache::open(url).context("cache url")?);
            let retry = config.reconnect.clone();
            let cancel = root.clone();
            let connecting = redis.clone();
            tokio::spawn(async move {
                connecting.connect_with_retry(&retry, &cancel).await;
            });
            redis
        }
        None => {
            let memory = Arc::new(MemoryCache::new());
            tokio::spawn(memory.clone().run_sweeper(CACHE_SWEEP_INTERVAL));
            info!("Using in-process cache");
            memory
        }
    };

    // ── 3. Engines ───────────────────────────────────────────────────────
    let trade_store: Arc<dyn TradeStore> = Arc::new(MemoryTradeStore::with_retention(
        Duration::from_secs(config.persistence.store_retention_secs),
    ));
    let state = Arc::new(AppState::new(config.clone(), cache, trade_store.clone()));

    // ── 4. Background loops ──────────────────────────────────────────────
    let flusher = tokio::spawn(state.trade_buffer.clone().run_flusher(
        trade_store,
        Duration::from_millis(config.persistence.flush_interval_ms),
        flush_cancel.clone(),
    ));
    let merger = tokio::spawn(state.candles.clone().run_flush_loop(root.clone()));
    let bridge = state.hub.spawn_bridge(root.clone()).await;

    let (events_tx, events_rx) = mpsc::channel::<MarketEvent>(EVENT_CHANNEL_CAPACITY);
    let dispatcher = tokio::spawn(Arc::new(state.pipeline()).run_dispatcher(
        events_rx,
        LANE_CAPACITY,
        root.clone(),
    ));

    // ── 5. Exchange workers ──────────────────────────────────────────────
    let workers = spawn_workers(&config, &state, events_tx, &root)?;

    // ── 6. HTTP server ───────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "HTTP server listening");

    let shutdown = root.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Ctrl-C handler failed");
        }
        info!("Shutdown requested");
        shutdown.cancel();
    });

    axum::serve(listener, api::router(state.clone()))
        .with_graceful_shutdown(root.clone().cancelled_owned())
        .await
        .context("HTTP server")?;

    // ── 7. Shutdown ──────────────────────────────────────────────────────
    root.cancel();
    for worker in workers {
        worker.disconnect();
        let status = worker.status();
        info!(
            exchange = %worker.exchange(),
            messages = status.messages,
            reconnects = status.reconnects,
            parse_errors = status.parse_errors,
            "Stopping exchange worker"
        );
        worker.join().await;
    }
    if let Err(e) = dispatcher.await {
        warn!(error = %e, "dispatcher task failed");
    }
    flush_cancel.cancel();
    if let Err(e) = flusher.await {
        warn!(error = %e, "flusher task failed");
    }
    let _ = merger.await;
    let _ = bridge.await;

    info!("Market Hub stopped");
    Ok(())
}

/// One worker per enabled exchange, all feeding the same event channel.
fn spawn_workers(
    config: &RuntimeConfig,
    state: &AppState,
    events: mpsc::Sender<MarketEvent>,
    root: &CancellationToken,
) -> anyhow::Result<Vec<WorkerHandle>> {
    let mut handles = Vec::with_capacity(config.exchanges.len());

    for &exchange in &config.exchanges {
        let reconnect = config.reconnect.clone();
        let symbols = config.symbols.clone();
        let endpoints = &config.endpoints;

        let handle = match exchange {
            Exchange::Binance => {
                let rest = BinanceRestClient::new(&endpoints.binance_rest, reconnect.connect_timeout())?;
                let adapter = BinanceAdapter::new(
                    &endpoints.binance_ws,
                    rest,
                    config.timeframes.clone(),
                    config.book_depth,
                );
                WorkerHandle::connect(adapter, symbols, events.clone(), reconnect, root)
            }
            Exchange::Hyperliquid => {
                let adapter = HyperliquidAdapter::new(&endpoints.hyperliquid_ws, config.timeframes.clone());
                WorkerHandle::connect(adapter, symbols, events.clone(), reconnect, root)
            }
            Exchange::Lighter => {
                let mapped: Vec<String> = symbols
                    .into_iter()
                    .filter(|s| config.lighter_markets.contains_key(s))
                    .collect();
                let adapter = LighterAdapter::new(&endpoints.lighter_ws, config.lighter_markets.clone());
                WorkerHandle::connect(adapter, mapped, events.clone(), reconnect, root)
            }
        };

        info!(%exchange, "Exchange worker spawned");
        state.register_worker(exchange, handle.status_handle());
        handles.push(handle);
    }

    Ok(handles)
}
