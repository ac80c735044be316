// =============================================================================
// Shared types used across the market data hub
// =============================================================================

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Current wall-clock time in Unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// =============================================================================
// Exchange / Side / Timeframe
// =============================================================================

/// Upstream venues the hub ingests from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
    Hyperliquid,
    Lighter,
}

impl Exchange {
    pub const ALL: [Exchange; 3] = [Exchange::Binance, Exchange::Hyperliquid, Exchange::Lighter];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::Hyperliquid => "hyperliquid",
            Self::Lighter => "lighter",
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binance" => Ok(Self::Binance),
            "hyperliquid" => Ok(Self::Hyperliquid),
            "lighter" => Ok(Self::Lighter),
            other => anyhow::bail!("unknown exchange: {other}"),
        }
    }
}

/// Taker side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

/// Candle timeframes produced by the trade aggregator and the merger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 6] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }

    /// Window length in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        match self {
            Self::M1 => 60_000,
            Self::M5 => 5 * 60_000,
            Self::M15 => 15 * 60_000,
            Self::H1 => 3_600_000,
            Self::H4 => 4 * 3_600_000,
            Self::D1 => 86_400_000,
        }
    }

    /// Start of the window containing `timestamp_ms` (epoch aligned).
    pub fn window_start(&self, timestamp_ms: i64) -> i64 {
        let d = self.duration_ms();
        timestamp_ms.div_euclid(d) * d
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timeframe::ALL
            .iter()
            .copied()
            .find(|tf| tf.as_str() == s.trim())
            .ok_or_else(|| anyhow::anyhow!("unknown timeframe: {s}"))
    }
}

// =============================================================================
// Order book
// =============================================================================

/// One price level. A zero `size` in a diff means "remove this price".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBookSide {
    pub levels: Vec<PriceLevel>,
    pub total_size: Decimal,
}

impl OrderBookSide {
    pub fn from_levels(levels: Vec<PriceLevel>) -> Self {
        let total_size = levels.iter().map(|l| l.size).sum();
        Self { levels, total_size }
    }

    pub fn best(&self) -> Option<&PriceLevel> {
        self.levels.first()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

/// Authoritative book state for one (exchange, symbol).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBook {
    pub symbol: String,
    pub exchange: Exchange,
    pub bids: OrderBookSide,
    pub asks: OrderBookSide,
    pub timestamp: i64,
    pub sequence: u64,
    pub spread: Decimal,
    pub mid_price: Decimal,
}

impl OrderBook {
    /// Build a book from raw level lists, sorting and truncating to `depth`.
    pub fn from_levels(
        exchange: Exchange,
        symbol: impl Into<String>,
        mut bids: Vec<PriceLevel>,
        mut asks: Vec<PriceLevel>,
        sequence: u64,
        timestamp: i64,
    ) -> Self {
        bids.retain(|l| !l.size.is_zero());
        asks.retain(|l| !l.size.is_zero());
        bids.sort_by(|a, b| b.price.cmp(&a.price));
        asks.sort_by(|a, b| a.price.cmp(&b.price));
        bids.dedup_by(|a, b| a.price == b.price);
        asks.dedup_by(|a, b| a.price == b.price);

        let mut book = Self {
            symbol: symbol.into(),
            exchange,
            bids: OrderBookSide::from_levels(bids),
            asks: OrderBookSide::from_levels(asks),
            timestamp,
            sequence,
            spread: Decimal::ZERO,
            mid_price: Decimal::ZERO,
        };
        book.refresh_derived();
        book
    }

    /// Recompute side totals, spread and mid price.
    pub fn refresh_derived(&mut self) {
        self.bids.total_size = self.bids.levels.iter().map(|l| l.size).sum();
        self.asks.total_size = self.asks.levels.iter().map(|l| l.size).sum();
        match (self.bids.best(), self.asks.best()) {
            (Some(bid), Some(ask)) => {
                self.spread = ask.price - bid.price;
                self.mid_price = (ask.price + bid.price) / Decimal::from(2);
            }
            _ => {
                self.spread = Decimal::ZERO;
                self.mid_price = Decimal::ZERO;
            }
        }
    }

    pub fn truncate(&mut self, depth: usize) {
        self.bids.levels.truncate(depth);
        self.asks.levels.truncate(depth);
        self.refresh_derived();
    }
}

/// Incremental update naming only changed levels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBookUpdate {
    pub symbol: String,
    pub exchange: Exchange,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub sequence: u64,
    pub timestamp: i64,
}

// =============================================================================
// Trades and candles
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub id: String,
    pub symbol: String,
    pub exchange: Exchange,
    pub price: Decimal,
    pub size: Decimal,
    pub side: Side,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_time: Option<i64>,
}

/// OHLCV summary for one exchange over one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub symbol: String,
    pub exchange: Exchange,
    pub timeframe: Timeframe,
    /// Window start (ms).
    pub timestamp: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub quote_volume: Decimal,
    pub trade_count: u64,
    pub vwap: Decimal,
}

impl Candle {
    /// Open a fresh candle from the first trade of a window.
    pub fn open_from_trade(trade: &Trade, timeframe: Timeframe) -> Self {
        let quote = trade.price * trade.size;
        Self {
            symbol: trade.symbol.clone(),
            exchange: trade.exchange,
            timeframe,
            timestamp: timeframe.window_start(trade.timestamp),
            open: trade.price,
            high: trade.price,
            low: trade.price,
            close: trade.price,
            volume: trade.size,
            quote_volume: quote,
            trade_count: 1,
            vwap: trade.price,
        }
    }

    /// Fold a trade that belongs to this candle's window.
    pub fn apply_trade(&mut self, trade: &Trade) {
        self.high = self.high.max(trade.price);
        self.low = self.low.min(trade.price);
        self.close = trade.price;
        self.volume += trade.size;
        self.quote_volume += trade.price * trade.size;
        self.trade_count += 1;
        self.vwap = if self.volume.is_zero() {
            self.close
        } else {
            self.quote_volume / self.volume
        };
    }
}

/// Cross-exchange composite candle. Always derivable from its sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedCandle {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub timestamp: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub quote_volume: Decimal,
    pub trade_count: u64,
    pub vwap: Decimal,
    pub sources: Vec<Exchange>,
}

impl AggregatedCandle {
    /// True when the OHLCV fields match (used for change detection).
    pub fn same_ohlcv(&self, other: &AggregatedCandle) -> bool {
        self.timestamp == other.timestamp
            && self.open == other.open
            && self.high == other.high
            && self.low == other.low
            && self.close == other.close
            && self.volume == other.volume
    }
}

// =============================================================================
// Normalized ingestion events
// =============================================================================

/// What an ingestion worker emits after vendor parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    BookSnapshot(OrderBook),
    BookDiff(OrderBookUpdate),
    Trades {
        exchange: Exchange,
        symbol: String,
        trades: Vec<Trade>,
    },
    Candle(Candle),
    /// The worker stopped streaming this symbol (unsubscribe or shutdown);
    /// live state derived from it should be dropped.
    Released { exchange: Exchange, symbol: String },
}

impl MarketEvent {
    /// The (exchange, symbol) lane this event belongs to.
    pub fn key(&self) -> (Exchange, &str) {
        match self {
            Self::BookSnapshot(b) => (b.exchange, &b.symbol),
            Self::BookDiff(d) => (d.exchange, &d.symbol),
            Self::Trades { exchange, symbol, .. } => (*exchange, symbol),
            Self::Candle(c) => (c.exchange, &c.symbol),
            Self::Released { exchange, symbol } => (*exchange, symbol),
        }
    }
}
