// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Read-only views under `/api/v1/`. Engines answer first; the cache covers
// keys this process does not own (e.g. another hub instance writing to the
// same Redis). A miss on both is a 404, malformed parameters are a 400, and
// every error body is `{"error": "..."}`.
//
// CORS is permissive; the hub serves public market data only.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::aggregation::AggregatedBook;
use crate::api::error::ApiError;
use crate::api::hub::Venue;
use crate::app_state::AppState;
use crate::cache::{self, keys};
use crate::ingestion::WorkerStatusSnapshot;
use crate::types::{now_ms, AggregatedCandle, Exchange, OrderBook, Timeframe, Trade};

const DEFAULT_RECENT_LIMIT: usize = 50;
const DEFAULT_METRICS_WINDOW: &str = "1h";
const MAX_METRICS_WINDOW: Duration = Duration::from_secs(30 * 86_400);

// =============================================================================
// Router construction
// =============================================================================

/// Build the full router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/orderbook/:exchange/:symbol", get(orderbook))
        .route("/api/v1/trades/:exchange/:symbol/metrics", get(trade_metrics))
        .route("/api/v1/trades/:exchange/:symbol/recent", get(recent_trades))
        .route("/api/v1/candles/:symbol/:timeframe", get(candle_history))
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Parameter helpers
// =============================================================================

fn parse_exchange(raw: &str) -> Result<Exchange, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("unknown exchange `{raw}`")))
}

/// `30s`, `15m`, `1h`, `7d`, up to `MAX_METRICS_WINDOW`.
pub fn parse_window(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let (split, _) = raw.char_indices().last()?;
    let (num, unit) = raw.split_at(split);
    let n: u64 = num.parse().ok().filter(|n| *n > 0)?;
    let unit_secs = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        _ => return None,
    };
    let window = Duration::from_secs(n.checked_mul(unit_secs)?);
    (window <= MAX_METRICS_WINDOW).then_some(window)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    cache: bool,
    workers: Vec<WorkerStatusSnapshot>,
    connections: usize,
    subscriptions: usize,
    pending_trades: usize,
    uptime_secs: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cache_ok = state.cache.ping().await.is_ok();
    let workers = state.worker_statuses();
    let degraded = !cache_ok || workers.iter().any(|w| w.failed);

    Json(HealthResponse {
        status: if degraded { "degraded" } else { "ok" },
        cache: cache_ok,
        workers,
        connections: state.hub.connection_count(),
        subscriptions: state.hub.subscription_count(),
        pending_trades: state.trade_buffer.len(),
        uptime_secs: state.uptime_secs(),
        server_time: now_ms(),
    })
}

// =============================================================================
// Order books
// =============================================================================

#[derive(Debug, Deserialize)]
struct DepthQuery {
    depth: Option<usize>,
}

async fn orderbook(
    State(state): State<Arc<AppState>>,
    Path((exchange, symbol)): Path<(String, String)>,
    query: Result<Query<DepthQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(q) = query?;
    let symbol = symbol.to_uppercase();
    let depth = q.depth.unwrap_or_else(|| state.runtime_config.read().book_depth);
    if depth == 0 {
        return Err(ApiError::BadRequest("depth must be positive".into()));
    }

    match Venue::parse(&exchange).map_err(|e| ApiError::BadRequest(e.to_string()))? {
        Venue::All => {
            let book: Option<AggregatedBook> =
                cache::get_json(state.cache.as_ref(), &keys::agg_book(&symbol)).await?;
            let mut book = book.ok_or_else(|| ApiError::NotFound(format!("orderbook all:{symbol}")))?;
            book.bids.truncate(depth);
            book.asks.truncate(depth);
            Ok(Json(book).into_response())
        }
        Venue::Exchange(ex) => {
            let book = match state.books.top_levels(&symbol, ex, depth) {
                Some(book) => Some(book),
                None => cache::get_json::<OrderBook>(state.cache.as_ref(), &keys::orderbook(ex, &symbol))
                    .await?
                    .map(|mut book| {
                        book.truncate(depth);
                        book
                    }),
            };
            let book = book.ok_or_else(|| ApiError::NotFound(format!("orderbook {ex}:{symbol}")))?;
            Ok(Json(book).into_response())
        }
    }
}

// =============================================================================
// Trades
// =============================================================================

#[derive(Debug, Deserialize)]
struct MetricsQuery {
    window: Option<String>,
}

async fn trade_metrics(
    State(state): State<Arc<AppState>>,
    Path((exchange, symbol)): Path<(String, String)>,
    query: Result<Query<MetricsQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(q) = query?;
    let exchange = parse_exchange(&exchange)?;
    let symbol = symbol.to_uppercase();
    let raw = q.window.as_deref().unwrap_or(DEFAULT_METRICS_WINDOW);
    let window = parse_window(raw).ok_or_else(|| ApiError::BadRequest(format!("invalid window `{raw}`")))?;

    let metrics = state
        .trades
        .get_trade_metrics(&symbol, exchange, window)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("trades {exchange}:{symbol} in {raw}")))?;
    Ok(Json(metrics).into_response())
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    limit: Option<usize>,
}

async fn recent_trades(
    State(state): State<Arc<AppState>>,
    Path((exchange, symbol)): Path<(String, String)>,
    query: Result<Query<RecentQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(q) = query?;
    let exchange = parse_exchange(&exchange)?;
    let symbol = symbol.to_uppercase();
    let limit = q.limit.unwrap_or(DEFAULT_RECENT_LIMIT);
    if limit == 0 {
        return Err(ApiError::BadRequest("limit must be positive".into()));
    }

    let mut trades = state.trades.get_recent_trades(&symbol, exchange, limit);
    if trades.is_empty() {
        let cached: Option<Vec<Trade>> =
            cache::get_json(state.cache.as_ref(), &keys::trades(exchange, &symbol)).await?;
        trades = cached.unwrap_or_default();
        let start = trades.len().saturating_sub(limit);
        trades.drain(..start);
    }
    if trades.is_empty() {
        return Err(ApiError::NotFound(format!("trades {exchange}:{symbol}")));
    }
    Ok(Json(trades).into_response())
}

// =============================================================================
// Aggregated candles
// =============================================================================

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    from: Option<i64>,
    to: Option<i64>,
    limit: Option<usize>,
}

async fn candle_history(
    State(state): State<Arc<AppState>>,
    Path((symbol, timeframe)): Path<(String, String)>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(q) = query?;
    let symbol = symbol.to_uppercase();
    let tf: Timeframe = timeframe
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("unknown timeframe `{timeframe}`")))?;
    if let (Some(from), Some(to)) = (q.from, q.to) {
        if from > to {
            return Err(ApiError::BadRequest("`from` is after `to`".into()));
        }
    }

    let mut candles = state.candles.get_candle_history(&symbol, tf, q.from, q.to, q.limit);
    if candles.is_empty() {
        let cached: Option<Vec<AggregatedCandle>> =
            cache::get_json(state.cache.as_ref(), &keys::agg_candle_history(&symbol, tf)).await?;
        candles = cached
            .unwrap_or_default()
            .into_iter()
            .filter(|c| q.from.map_or(true, |f| c.timestamp >= f))
            .filter(|c| q.to.map_or(true, |t| c.timestamp <= t))
            .collect();
        if let Some(limit) = q.limit {
            let start = candles.len().saturating_sub(limit);
            candles.drain(..start);
        }
    }
    if candles.is_empty() {
        return Err(ApiError::NotFound(format!("candles {symbol}:{tf}")));
    }
    Ok(Json(candles).into_response())
}

// =============================================================================
// Tests
// =============================================================================
