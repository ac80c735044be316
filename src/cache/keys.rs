//! Cache key and pub/sub channel naming.
//!
//! Keys are namespaced by data type, exchange, symbol and (for charts)
//! timeframe. [`parse_channel`] is the inverse used by the fan-out bridge.

use std::time::Duration;

use crate::runtime_config::RuntimeConfig;
use crate::types::{Exchange, Timeframe};

pub fn orderbook(exchange: Exchange, symbol: &str) -> String {
    format!("orderbook:{exchange}:{symbol}")
}

pub fn orderbook_channel(exchange: Exchange, symbol: &str) -> String {
    format!("orderbook:update:{exchange}:{symbol}")
}

pub fn trades(exchange: Exchange, symbol: &str) -> String {
    format!("trades:{exchange}:{symbol}")
}

pub fn trades_channel(exchange: Exchange, symbol: &str) -> String {
    format!("trades:update:{exchange}:{symbol}")
}

pub fn candle(exchange: Exchange, symbol: &str, tf: Timeframe) -> String {
    format!("candles:{exchange}:{symbol}:{tf}")
}

pub fn candle_channel(exchange: Exchange, symbol: &str, tf: Timeframe) -> String {
    format!("candles:update:{exchange}:{symbol}:{tf}")
}

pub fn agg_candle(symbol: &str, tf: Timeframe) -> String {
    format!("agg:candles:{symbol}:{tf}")
}

pub fn agg_candle_history(symbol: &str, tf: Timeframe) -> String {
    format!("agg:candles:{symbol}:{tf}:history")
}

pub fn agg_candle_channel(symbol: &str, tf: Timeframe) -> String {
    format!("aggregated:candles:{symbol}:{tf}")
}

pub fn agg_book(symbol: &str) -> String {
    format!("agg:book:{symbol}")
}

pub fn agg_book_channel(symbol: &str) -> String {
    format!("agg:book:update:{symbol}")
}

/// Patterns the fan-out bridge listens on.
pub const FANOUT_PATTERNS: [&str; 5] = [
    "orderbook:update:*",
    "trades:update:*",
    "candles:update:*",
    "aggregated:candles:*",
    "agg:book:update:*",
];

/// A parsed notification channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    OrderBook { exchange: Exchange, symbol: String },
    Trades { exchange: Exchange, symbol: String },
    Candle { exchange: Exchange, symbol: String, timeframe: Timeframe },
    AggregatedCandle { symbol: String, timeframe: Timeframe },
    AggregatedBook { symbol: String },
}

pub fn parse_channel(channel: &str) -> Option<Topic> {
    let parts: Vec<&str> = channel.split(':').collect();
    match parts.as_slice() {
        ["orderbook", "update", ex, sym] => Some(Topic::OrderBook {
            exchange: ex.parse().ok()?,
            symbol: sym.to_string(),
        }),
        ["trades", "update", ex, sym] => Some(Topic::Trades {
            exchange: ex.parse().ok()?,
            symbol: sym.to_string(),
        }),
        ["candles", "update", ex, sym, tf] => Some(Topic::Candle {
            exchange: ex.parse().ok()?,
            symbol: sym.to_string(),
            timeframe: tf.parse().ok()?,
        }),
        ["aggregated", "candles", sym, tf] => Some(Topic::AggregatedCandle {
            symbol: sym.to_string(),
            timeframe: tf.parse().ok()?,
        }),
        ["agg", "book", "update", sym] => Some(Topic::AggregatedBook {
            symbol: sym.to_string(),
        }),
        _ => None,
    }
}

/// Per-type TTLs. Order books are only useful fresh; charts serve cold starts.
#[derive(Debug, Clone, Copy)]
pub struct CacheTtls {
    pub orderbook: Duration,
    pub trades: Duration,
    pub chart: Duration,
}

impl CacheTtls {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            orderbook: config.orderbook_ttl(),
            trades: config.trades_ttl(),
            chart: config.chart_ttl(),
        }
    }
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self::from_config(&RuntimeConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_shapes() {
        assert_eq!(orderbook(Exchange::Binance, "BTC"), "orderbook:binance:BTC");
        assert_eq!(agg_candle_history("BTC", Timeframe::M1), "agg:candles:BTC:1m:history");
        assert_eq!(agg_candle_channel("ETH", Timeframe::H4), "aggregated:candles:ETH:4h");
        assert_eq!(agg_book("SOL"), "agg:book:SOL");
    }

    #[test]
    fn channels_parse_back() {
        assert_eq!(
            parse_channel(&orderbook_channel(Exchange::Lighter, "SOL")),
            Some(Topic::OrderBook { exchange: Exchange::Lighter, symbol: "SOL".into() })
        );
        assert_eq!(
            parse_channel(&candle_channel(Exchange::Binance, "BTC", Timeframe::M5)),
            Some(Topic::Candle {
                exchange: Exchange::Binance,
                symbol: "BTC".into(),
                timeframe: Timeframe::M5
            })
        );
        assert_eq!(
            parse_channel(&agg_candle_channel("BTC", Timeframe::D1)),
            Some(Topic::AggregatedCandle { symbol: "BTC".into(), timeframe: Timeframe::D1 })
        );
        assert_eq!(parse_channel("orderbook:update:kraken:BTC"), None);
        assert_eq!(parse_channel("garbage"), None);
    }

    #[test]
    fn every_channel_matches_a_fanout_pattern() {
        let channels = [
            orderbook_channel(Exchange::Binance, "BTC"),
            trades_channel(Exchange::Binance, "BTC"),
            candle_channel(Exchange::Binance, "BTC", Timeframe::M1),
            agg_candle_channel("BTC", Timeframe::M1),
            agg_book_channel("BTC"),
        ];
        for ch in channels {
            assert!(
                FANOUT_PATTERNS.iter().any(|p| super::super::pattern_matches(p, &ch)),
                "{ch} not covered"
            );
        }
    }
}
