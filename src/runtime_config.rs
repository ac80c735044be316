// =============================================================================
// Runtime Configuration — Hub tunables with atomic save
// =============================================================================
//
// Every tunable lives here. All fields carry `#[serde(default)]` so adding a
// field never breaks loading an older config file. Persistence uses an atomic
// tmp + rename write.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{Exchange, Timeframe};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec!["BTC".to_string(), "ETH".to_string(), "SOL".to_string()]
}

fn default_exchanges() -> Vec<Exchange> {
    Exchange::ALL.to_vec()
}

fn default_timeframes() -> Vec<Timeframe> {
    Timeframe::ALL.to_vec()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_book_depth() -> usize {
    50
}

fn default_orderbook_ttl_secs() -> u64 {
    30
}

fn default_trades_ttl_secs() -> u64 {
    60
}

fn default_chart_ttl_secs() -> u64 {
    7 * 24 * 3600
}

fn default_lighter_markets() -> HashMap<String, u32> {
    HashMap::from([
        ("ETH".to_string(), 0),
        ("BTC".to_string(), 1),
        ("SOL".to_string(), 2),
    ])
}

// =============================================================================
// Sub-sections
// =============================================================================

/// Reconnect and heartbeat policy shared by all ingestion workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Consecutive failed attempts before a worker reports itself failed. It
    /// keeps retrying at `max_delay_ms` afterwards. 0 = never report.
    pub max_attempts: u32,
    pub heartbeat_interval_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 10,
            heartbeat_interval_secs: 20,
            connect_timeout_secs: 10,
        }
    }
}

impl ReconnectConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Durable trade persistence buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub flush_interval_ms: u64,
    pub batch_size: usize,
    /// Above this many buffered trades the oldest batch is dropped.
    pub buffer_capacity: usize,
    /// In-process store: how far behind its newest trade a series is kept.
    pub store_retention_secs: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 1_000,
            batch_size: 100,
            buffer_capacity: 50_000,
            store_retention_secs: 86_400,
        }
    }
}

/// Venue endpoints. Overridable for testnets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub binance_ws: String,
    pub binance_rest: String,
    pub hyperliquid_ws: String,
    pub lighter_ws: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            binance_ws: "wss://stream.binance.com:9443/stream".to_string(),
            binance_rest: "https://api.binance.com".to_string(),
            hyperliquid_ws: "wss://api.hyperliquid.xyz/ws".to_string(),
            lighter_ws: "wss://mainnet.zklighter.elliot.ai/stream".to_string(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level configuration for the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Universe ------------------------------------------------------------

    /// Canonical base-asset symbols (e.g. `BTC`).
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    #[serde(default = "default_exchanges")]
    pub exchanges: Vec<Exchange>,

    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<Timeframe>,

    /// Lighter identifies markets by numeric id.
    #[serde(default = "default_lighter_markets")]
    pub lighter_markets: HashMap<String, u32>,

    // --- Engines -------------------------------------------------------------

    /// Levels kept per book side.
    #[serde(default = "default_book_depth")]
    pub book_depth: usize,

    /// Recent trades retained per (exchange, symbol) for the live metrics path.
    #[serde(default = "RuntimeConfig::default_recent_trades")]
    pub recent_trades: usize,

    /// Minimum gap between aggregated-candle publishes per (symbol, timeframe).
    #[serde(default = "RuntimeConfig::default_merge_throttle_ms")]
    pub merge_throttle_ms: u64,

    /// Aggregated candles retained per (symbol, timeframe).
    #[serde(default = "RuntimeConfig::default_history_capacity")]
    pub history_capacity: usize,

    /// Books older than this are left out of the cross-exchange book.
    #[serde(default = "RuntimeConfig::default_book_stale_ms")]
    pub book_stale_ms: i64,

    // --- Cache ---------------------------------------------------------------

    /// `redis://...` to share state across processes; in-process when unset.
    #[serde(default)]
    pub cache_url: Option<String>,

    #[serde(default = "default_orderbook_ttl_secs")]
    pub orderbook_ttl_secs: u64,

    #[serde(default = "default_trades_ttl_secs")]
    pub trades_ttl_secs: u64,

    #[serde(default = "default_chart_ttl_secs")]
    pub chart_ttl_secs: u64,

    // --- Ingestion / persistence --------------------------------------------

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub endpoints: EndpointConfig,

    // --- Fan-out server ------------------------------------------------------

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "RuntimeConfig::default_client_ping_secs")]
    pub client_ping_secs: u64,

    #[serde(default = "RuntimeConfig::default_max_subscriptions")]
    pub max_subscriptions_per_client: usize,

    /// Outbound messages queued per client before it counts as too slow.
    #[serde(default = "RuntimeConfig::default_client_queue")]
    pub client_queue_capacity: usize,
}

impl RuntimeConfig {
    fn default_recent_trades() -> usize {
        1_000
    }

    fn default_merge_throttle_ms() -> u64 {
        250
    }

    fn default_history_capacity() -> usize {
        1_500
    }

    fn default_book_stale_ms() -> i64 {
        5_000
    }

    fn default_client_ping_secs() -> u64 {
        30
    }

    fn default_max_subscriptions() -> usize {
        50
    }

    fn default_client_queue() -> usize {
        256
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            exchanges: default_exchanges(),
            timeframes: default_timeframes(),
            lighter_markets: default_lighter_markets(),
            book_depth: default_book_depth(),
            recent_trades: Self::default_recent_trades(),
            merge_throttle_ms: Self::default_merge_throttle_ms(),
            history_capacity: Self::default_history_capacity(),
            book_stale_ms: Self::default_book_stale_ms(),
            cache_url: None,
            orderbook_ttl_secs: default_orderbook_ttl_secs(),
            trades_ttl_secs: default_trades_ttl_secs(),
            chart_ttl_secs: default_chart_ttl_secs(),
            reconnect: ReconnectConfig::default(),
            persistence: PersistenceConfig::default(),
            endpoints: EndpointConfig::default(),
            bind_addr: default_bind_addr(),
            client_ping_secs: Self::default_client_ping_secs(),
            max_subscriptions_per_client: Self::default_max_subscriptions(),
            client_queue_capacity: Self::default_client_queue(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read hub config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse hub config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            exchanges = ?config.exchanges,
            "hub config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration using an atomic write (tmp, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise hub config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "hub config saved (atomic)");
        Ok(())
    }

    /// Apply `HUB_*` environment overrides on top of the loaded file.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(syms) = std::env::var("HUB_SYMBOLS") {
            self.symbols = parse_symbol_list(&syms);
        }
        if let Ok(list) = std::env::var("HUB_EXCHANGES") {
            self.exchanges = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<Exchange>())
                .collect::<Result<Vec<_>>>()
                .context("invalid HUB_EXCHANGES")?;
        }
        if let Ok(addr) = std::env::var("HUB_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Ok(url) = std::env::var("HUB_CACHE_URL") {
            self.cache_url = Some(url).filter(|u| !u.trim().is_empty());
        }
        Ok(())
    }

    pub fn orderbook_ttl(&self) -> Duration {
        Duration::from_secs(self.orderbook_ttl_secs)
    }

    pub fn trades_ttl(&self) -> Duration {
        Duration::from_secs(self.trades_ttl_secs)
    }

    pub fn chart_ttl(&self) -> Duration {
        Duration::from_secs(self.chart_ttl_secs)
    }
}

/// Split a comma list into upper-cased, de-blanked symbols.
pub fn parse_symbol_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}
