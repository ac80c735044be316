//! Hyperliquid adapter.
//!
//! `l2Book` pushes full snapshots, so books never need a REST bootstrap.
//! Coins are already canonical (`BTC`, `ETH`, ...). The venue closes idle
//! sockets, so the worker heartbeat sends `{"method":"ping"}` and the server
//! answers on the `pong` channel.

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;

use super::{ExchangeAdapter, Parsed};
use crate::types::{Candle, Exchange, MarketEvent, OrderBook, PriceLevel, Side, Timeframe, Trade};

#[derive(Debug, Deserialize)]
#[serde(tag = "channel", content = "data", rename_all = "camelCase")]
enum Frame {
    L2Book(L2Book),
    Trades(Vec<WsTrade>),
    Candle(WsCandle),
    Pong,
    SubscriptionResponse(serde_json::Value),
    Error(String),
}

#[derive(Debug, Deserialize)]
struct L2Book {
    coin: String,
    time: i64,
    levels: (Vec<WsLevel>, Vec<WsLevel>),
}

#[derive(Debug, Deserialize)]
struct WsLevel {
    px: Decimal,
    sz: Decimal,
}

#[derive(Debug, Deserialize)]
struct WsTrade {
    coin: String,
    side: String,
    px: Decimal,
    sz: Decimal,
    time: i64,
    tid: u64,
}

#[derive(Debug, Deserialize)]
struct WsCandle {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "s")]
    coin: String,
    #[serde(rename = "i")]
    interval: Timeframe,
    #[serde(rename = "o")]
    open: Decimal,
    #[serde(rename = "c")]
    close: Decimal,
    #[serde(rename = "h")]
    high: Decimal,
    #[serde(rename = "l")]
    low: Decimal,
    #[serde(rename = "v")]
    volume: Decimal,
    #[serde(rename = "n")]
    trades: u64,
}

fn levels(raw: Vec<WsLevel>) -> Vec<PriceLevel> {
    raw.into_iter().map(|l| PriceLevel::new(l.px, l.sz)).collect()
}

fn side(raw: &str) -> Option<Side> {
    match raw {
        "B" => Some(Side::Buy),
        "A" => Some(Side::Sell),
        _ => None,
    }
}

/// Canonical parser for Hyperliquid frames.
pub fn parse_frame(text: &str) -> Parsed {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => return Parsed::Unrecognized(format!("hyperliquid frame: {e}")),
    };

    match frame {
        Frame::L2Book(book) => {
            let (bids, asks) = book.levels;
            Parsed::Events(vec![MarketEvent::BookSnapshot(OrderBook::from_levels(
                Exchange::Hyperliquid,
                book.coin,
                levels(bids),
                levels(asks),
                book.time.max(0) as u64,
                book.time,
            ))])
        }
        Frame::Trades(raw) => {
            let Some(coin) = raw.first().map(|t| t.coin.clone()) else {
                return Parsed::Control;
            };
            let mut trades = Vec::with_capacity(raw.len());
            for t in raw {
                let Some(side) = side(&t.side) else {
                    return Parsed::Unrecognized(format!("hyperliquid trade side {:?}", t.side));
                };
                if t.coin != coin {
                    return Parsed::Unrecognized("hyperliquid trades batch spans coins".into());
                }
                trades.push(Trade {
                    id: t.tid.to_string(),
                    symbol: t.coin,
                    exchange: Exchange::Hyperliquid,
                    price: t.px,
                    size: t.sz,
                    side,
                    timestamp: t.time,
                    block_time: Some(t.time),
                });
            }
            Parsed::Events(vec![MarketEvent::Trades {
                exchange: Exchange::Hyperliquid,
                symbol: coin,
                trades,
            }])
        }
        Frame::Candle(c) => {
            // No quote volume on the wire; use the typical price.
            let typical = (c.high + c.low + c.close) / Decimal::from(3);
            Parsed::Events(vec![MarketEvent::Candle(Candle {
                symbol: c.coin,
                exchange: Exchange::Hyperliquid,
                timeframe: c.interval,
                timestamp: c.open_time,
                open: c.open,
                high: c.high,
                low: c.low,
                close: c.close,
                volume: c.volume,
                quote_volume: typical * c.volume,
                trade_count: c.trades,
                vwap: typical,
            })])
        }
        Frame::Pong | Frame::SubscriptionResponse(_) => Parsed::Control,
        Frame::Error(msg) => Parsed::Unrecognized(format!("hyperliquid error: {msg}")),
    }
}

pub struct HyperliquidAdapter {
    ws_url: String,
    timeframes: Vec<Timeframe>,
}

impl HyperliquidAdapter {
    pub fn new(ws_url: impl Into<String>, timeframes: Vec<Timeframe>) -> Self {
        Self {
            ws_url: ws_url.into(),
            timeframes,
        }
    }

    fn frames(&self, method: &str, symbols: &[String]) -> Vec<String> {
        let mut frames = Vec::new();
        for coin in symbols {
            frames.push(json!({"method": method, "subscription": {"type": "l2Book", "coin": coin}}).to_string());
            frames.push(json!({"method": method, "subscription": {"type": "trades", "coin": coin}}).to_string());
            for tf in &self.timeframes {
                frames.push(
                    json!({
                        "method": method,
                        "subscription": {"type": "candle", "coin": coin, "interval": tf.as_str()}
                    })
                    .to_string(),
                );
            }
        }
        frames
    }
}

#[async_trait::async_trait]
impl ExchangeAdapter for HyperliquidAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Hyperliquid
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
        Some(json!({"method": "ping"}).to_string())
    }

    fn parse(&self, text: &str) -> Parsed {
        parse_frame(text)
    }
}
