//! Lighter adapter.
//!
//! Markets are addressed by numeric id (`order_book/{id}`, `trade/{id}`); the
//! canonical symbol ↔ id mapping comes from configuration. The first order
//! book frame after subscribing is a full snapshot, later ones are diffs whose
//! `offset` is the book sequence. The server pings at the application level
//! and expects a pong back.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use super::{ExchangeAdapter, Parsed};
use crate::types::{
    now_ms, Exchange, MarketEvent, OrderBook, OrderBookUpdate, PriceLevel, Side, Trade,
};

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum Frame {
    #[serde(rename = "connected")]
    Connected,
    #[serde(rename = "subscribed/order_book")]
    BookSnapshot(BookFrame),
    #[serde(rename = "update/order_book")]
    BookUpdate(BookFrame),
    #[serde(rename = "subscribed/trade")]
    TradeSnapshot(TradeFrame),
    #[serde(rename = "update/trade")]
    TradeUpdate(TradeFrame),
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
}

#[derive(Debug, Deserialize)]
struct BookFrame {
    channel: String,
    order_book: WsBook,
}

#[derive(Debug, Deserialize)]
struct WsBook {
    asks: Vec<WsLevel>,
    bids: Vec<WsLevel>,
    offset: u64,
}

#[derive(Debug, Deserialize)]
struct WsLevel {
    price: Decimal,
    size: Decimal,
}

#[derive(Debug, Deserialize)]
struct TradeFrame {
    channel: String,
    trades: Vec<WsTrade>,
}

#[derive(Debug, Deserialize)]
struct WsTrade {
    trade_id: u64,
    price: Decimal,
    size: Decimal,
    is_maker_ask: bool,
    timestamp: i64,
}

fn levels(raw: Vec<WsLevel>) -> Vec<PriceLevel> {
    raw.into_iter().map(|l| PriceLevel::new(l.price, l.size)).collect()
}

/// `order_book:3` / `trade:3` → 3
fn market_id(channel: &str) -> Option<u32> {
    channel.rsplit([':', '/']).next()?.parse().ok()
}

pub struct LighterAdapter {
    ws_url: String,
    markets: HashMap<String, u32>,
    symbols: HashMap<u32, String>,
}

impl LighterAdapter {
    pub fn new(ws_url: impl Into<String>, markets: HashMap<String, u32>) -> Self {
        let symbols = markets.iter().map(|(s, id)| (*id, s.clone())).collect();
        Self {
            ws_url: ws_url.into(),
            markets,
            symbols,
        }
    }

    fn symbol_for(&self, channel: &str) -> Option<String> {
        market_id(channel).and_then(|id| self.symbols.get(&id).cloned())
    }

    fn frames(&self, kind: &str, symbols: &[String]) -> Vec<String> {
        let mut frames = Vec::new();
        for sym in symbols {
            let Some(id) = self.markets.get(sym) else {
                warn!(symbol = %sym, "no lighter market id configured, skipped");
                continue;
            };
            frames.push(json!({"type": kind, "channel": format!("order_book/{id}")}).to_string());
            frames.push(json!({"type": kind, "channel": format!("trade/{id}")}).to_string());
        }
        frames
    }

    /// Canonical parser for Lighter frames.
    pub fn parse_frame(&self, text: &str) -> Parsed {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(f) => f,
            Err(e) => return Parsed::Unrecognized(format!("lighter frame: {e}")),
        };

        match frame {
            Frame::BookSnapshot(b) => {
                let Some(symbol) = self.symbol_for(&b.channel) else {
                    return Parsed::Unrecognized(format!("lighter unknown market {}", b.channel));
                };
                Parsed::Events(vec![MarketEvent::BookSnapshot(OrderBook::from_levels(
                    Exchange::Lighter,
                    symbol,
                    levels(b.order_book.bids),
                    levels(b.order_book.asks),
                    b.order_book.offset,
                    now_ms(),
                ))])
            }
            Frame::BookUpdate(b) => {
                let Some(symbol) = self.symbol_for(&b.channel) else {
                    return Parsed::Unrecognized(format!("lighter unknown market {}", b.channel));
                };
                Parsed::Events(vec![MarketEvent::BookDiff(OrderBookUpdate {
                    symbol,
                    exchange: Exchange::Lighter,
                    bids: levels(b.order_book.bids),
                    asks: levels(b.order_book.asks),
                    sequence: b.order_book.offset,
                    timestamp: now_ms(),
                })])
            }
            Frame::TradeSnapshot(t) | Frame::TradeUpdate(t) => {
                let Some(symbol) = self.symbol_for(&t.channel) else {
                    return Parsed::Unrecognized(format!("lighter unknown market {}", t.channel));
                };
                if t.trades.is_empty() {
                    return Parsed::Control;
                }
                let trades = t
                    .trades
                    .into_iter()
                    .map(|raw| Trade {
                        id: raw.trade_id.to_string(),
                        symbol: symbol.clone(),
                        exchange: Exchange::Lighter,
                        price: raw.price,
                        size: raw.size,
                        // Maker was the ask, so the aggressor bought.
                        side: if raw.is_maker_ask { Side::Buy } else { Side::Sell },
                        timestamp: raw.timestamp,
                        block_time: Some(raw.timestamp),
                    })
                    .collect();
                Parsed::Events(vec![MarketEvent::Trades {
                    exchange: Exchange::Lighter,
                    symbol,
                    trades,
                }])
            }
            Frame::Ping => Parsed::Reply(json!({"type": "pong"}).to_string()),
            Frame::Connected | Frame::Pong => Parsed::Control,
        }
    }
}

#[async_trait::async_trait]
impl ExchangeAdapter for LighterAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Lighter
    }

    fn ws_url(&self) -> String {
        self.ws_url.clone()
    }

    fn subscribe_frames(&self, symbols: &[String]) -> Vec<String> {
        self.frames("subscribe", symbols)
    }

    fn unsubscribe_frames(&self, symbols: &[String]) -> Vec<String> {
        self.frames("unsubscribe", symbols)
    }

    fn ping_frame(&self) -> Option<String> {
        Some(json!({"type": "ping"}).to_string())
    }

    fn parse(&self, text: &str) -> Parsed {
        self.parse_frame(text)
    }
}
