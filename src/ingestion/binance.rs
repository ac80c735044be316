// =============================================================================
// Binance Adapter — spot combined stream plus REST depth bootstrap
// =============================================================================
//
// The stream carries `depthUpdate` diffs, `aggTrade` and `kline` events. Diffs
// have no base on their own, so every (re)subscribe fetches a REST snapshot
// (`/api/v3/depth`) whose `lastUpdateId` becomes the book sequence; buffered
// diffs with a final id `u` at or below it are then dropped as stale by the
// order book engine.
//
// Canonical symbols are base assets quoted in USDT: `BTC` ↔ `BTCUSDT`.
// =============================================================================

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use super::{payload_head, ExchangeAdapter, Parsed};
use crate::types::{
    Candle, Exchange, MarketEvent, OrderBook, OrderBookUpdate, PriceLevel, Side, Timeframe, Trade,
};

const QUOTE_ASSET: &str = "USDT";

/// Request weight Binance allows per minute; we stop bootstrapping above this.
const WEIGHT_HARD_LIMIT: u32 = 1000;
const WEIGHT_WARN_THRESHOLD: u32 = 800;

pub fn venue_symbol(symbol: &str) -> String {
    format!("{}{QUOTE_ASSET}", symbol.to_uppercase())
}

pub fn canonical_symbol(venue: &str) -> Option<String> {
    venue
        .to_uppercase()
        .strip_suffix(QUOTE_ASSET)
        .filter(|base| !base.is_empty())
        .map(str::to_string)
}

/// Smallest limit the depth endpoint accepts that still covers `depth`.
fn snapshot_limit(depth: usize) -> u32 {
    const LIMITS: [u32; 8] = [5, 10, 20, 50, 100, 500, 1000, 5000];
    LIMITS
        .into_iter()
        .find(|&l| l as usize >= depth)
        .unwrap_or(5000)
}

/// Request weight of one depth call at `limit`.
fn depth_weight(limit: u32) -> u32 {
    match limit {
        0..=100 => 5,
        101..=500 => 25,
        501..=1000 => 50,
        _ => 250,
    }
}

// ---------------------------------------------------------------------------
// Vendor frames
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Frame {
    Stream { data: StreamEvent },
    Error { error: VenueError },
    Ack { id: u64 },
}

#[derive(Debug, Deserialize)]
struct VenueError {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "e")]
enum StreamEvent {
    #[serde(rename = "depthUpdate")]
    Depth(DepthUpdate),
    #[serde(rename = "aggTrade")]
    AggTrade(AggTrade),
    #[serde(rename = "kline")]
    Kline(KlineEvent),
}

#[derive(Debug, Deserialize)]
struct DepthUpdate {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "u")]
    final_update_id: u64,
    #[serde(rename = "b")]
    bids: Vec<(Decimal, Decimal)>,
    #[serde(rename = "a")]
    asks: Vec<(Decimal, Decimal)>,
}

#[derive(Debug, Deserialize)]
struct AggTrade {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "a")]
    agg_id: u64,
    #[serde(rename = "p")]
    price: Decimal,
    #[serde(rename = "q")]
    quantity: Decimal,
    #[serde(rename = "T")]
    trade_time: i64,
    #[serde(rename = "m")]
    buyer_is_maker: bool,
}

#[derive(Debug, Deserialize)]
struct KlineEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "k")]
    kline: Kline,
}

#[derive(Debug, Deserialize)]
struct Kline {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "i")]
    interval: Timeframe,
    #[serde(rename = "o")]
    open: Decimal,
    #[serde(rename = "h")]
    high: Decimal,
    #[serde(rename = "l")]
    low: Decimal,
    #[serde(rename = "c")]
    close: Decimal,
    #[serde(rename = "v")]
    volume: Decimal,
    #[serde(rename = "q")]
    quote_volume: Decimal,
    #[serde(rename = "n")]
    trades: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DepthSnapshot {
    last_update_id: u64,
    bids: Vec<(Decimal, Decimal)>,
    asks: Vec<(Decimal, Decimal)>,
}

fn levels(raw: Vec<(Decimal, Decimal)>) -> Vec<PriceLevel> {
    raw.into_iter().map(|(p, s)| PriceLevel::new(p, s)).collect()
}

/// Canonical parser for combined-stream frames.
pub fn parse_frame(text: &str) -> Parsed {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => return Parsed::Unrecognized(format!("binance frame: {e}")),
    };

    let event = match frame {
        Frame::Stream { data } => data,
        Frame::Ack { .. } => return Parsed::Control,
        Frame::Error { error } => {
            return Parsed::Unrecognized(format!("binance error {}: {}", error.code, error.msg));
        }
    };

    let Some(symbol) = (match &event {
        StreamEvent::Depth(d) => canonical_symbol(&d.symbol),
        StreamEvent::AggTrade(t) => canonical_symbol(&t.symbol),
        StreamEvent::Kline(k) => canonical_symbol(&k.symbol),
    }) else {
        return Parsed::Unrecognized(format!("binance symbol not quoted in {QUOTE_ASSET}"));
    };

    let event = match event {
        StreamEvent::Depth(d) => MarketEvent::BookDiff(OrderBookUpdate {
            symbol,
            exchange: Exchange::Binance,
            bids: levels(d.bids),
            asks: levels(d.asks),
            sequence: d.final_update_id,
            timestamp: d.event_time,
        }),
        StreamEvent::AggTrade(t) => MarketEvent::Trades {
            exchange: Exchange::Binance,
            symbol: symbol.clone(),
            trades: vec![Trade {
                id: t.agg_id.to_string(),
                symbol,
                exchange: Exchange::Binance,
                price: t.price,
                size: t.quantity,
                // Maker was the buyer, so the aggressor sold.
                side: if t.buyer_is_maker { Side::Sell } else { Side::Buy },
                timestamp: t.trade_time,
                block_time: None,
            }],
        },
        StreamEvent::Kline(KlineEvent { kline: k, .. }) => MarketEvent::Candle(Candle {
            symbol,
            exchange: Exchange::Binance,
            timeframe: k.interval,
            timestamp: k.open_time,
            open: k.open,
            high: k.high,
            low: k.low,
            close: k.close,
            volume: k.volume,
            quote_volume: k.quote_volume,
            trade_count: k.trades,
            vwap: if k.volume.is_zero() { k.close } else { k.quote_volume / k.volume },
        }),
    };
    Parsed::Events(vec![event])
}

/// Parse a `/api/v3/depth` body into a snapshot for `symbol`.
pub fn parse_depth_snapshot(symbol: &str, body: &str, timestamp: i64) -> Result<OrderBook> {
    let snap: DepthSnapshot = serde_json::from_str(body).context("failed to parse depth snapshot")?;
    Ok(OrderBook::from_levels(
        Exchange::Binance,
        symbol,
        levels(snap.bids),
        levels(snap.asks),
        snap.last_update_id,
        timestamp,
    ))
}

// ---------------------------------------------------------------------------
// REST client
// ---------------------------------------------------------------------------

/// Public-data REST client with request-weight tracking.
#[derive(Debug)]
pub struct BinanceRestClient {
    base_url: String,
    client: reqwest::Client,
    used_weight_1m: AtomicU32,
}

impl BinanceRestClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self {
            base_url: base_url.into(),
            client,
            used_weight_1m: AtomicU32::new(0),
        })
    }

    /// Record the `X-MBX-USED-WEIGHT-1M` header of a response.
    fn update_weight(&self, headers: &reqwest::header::HeaderMap) {
        let Some(w) = headers
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            return;
        };
        let prev = self.used_weight_1m.swap(w, Ordering::Relaxed);
        if w >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
            warn!(used_weight = w, hard_limit = WEIGHT_HARD_LIMIT, "rate-limit weight crossed warning threshold");
        }
    }

    pub fn can_spend(&self, weight: u32) -> bool {
        self.used_weight_1m.load(Ordering::Relaxed) + weight <= WEIGHT_HARD_LIMIT
    }

    /// GET /api/v3/depth (public).
    #[instrument(skip(self), name = "binance::get_depth")]
    pub async fn get_depth(&self, symbol: &str, limit: u32) -> Result<OrderBook> {
        let url = format!(
            "{}/api/v3/depth?symbol={}&limit={}",
            self.base_url,
            venue_symbol(symbol),
            limit
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/depth request failed")?;
        self.update_weight(resp.headers());

        let status = resp.status();
        let body = resp.text().await.context("failed to read depth response")?;
        if !status.is_success() {
            anyhow::bail!("Binance GET /api/v3/depth returned {}: {}", status, payload_head(&body));
        }

        let book = parse_depth_snapshot(symbol, &body, crate::types::now_ms())?;
        debug!(symbol, sequence = book.sequence, "depth snapshot fetched");
        Ok(book)
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub struct BinanceAdapter {
    ws_url: String,
    rest: BinanceRestClient,
    timeframes: Vec<Timeframe>,
    snapshot_limit: u32,
    request_id: AtomicU64,
}

impl BinanceAdapter {
    pub fn new(ws_url: impl Into<String>, rest: BinanceRestClient, timeframes: Vec<Timeframe>, depth: usize) -> Self {
        Self {
            ws_url: ws_url.into(),
            rest,
            timeframes,
            snapshot_limit: snapshot_limit(depth),
            request_id: AtomicU64::new(1),
        }
    }

    fn streams(&self, symbols: &[String]) -> Vec<String> {
        let mut streams = Vec::new();
        for sym in symbols {
            let lower = venue_symbol(sym).to_lowercase();
            streams.push(format!("{lower}@depth@100ms"));
            streams.push(format!("{lower}@aggTrade"));
            for tf in &self.timeframes {
                streams.push(format!("{lower}@kline_{tf}"));
            }
        }
        streams
    }

    fn method_frame(&self, method: &str, symbols: &[String]) -> Vec<String> {
        if symbols.is_empty() {
            return Vec::new();
        }
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        vec![serde_json::json!({
            "method": method,
            "params": self.streams(symbols),
            "id": id,
        })
        .to_string()]
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    fn ws_url(&self) -> String {
        self.ws_url.clone()
    }

    fn subscribe_frames(&self, symbols: &[String]) -> Vec<String> {
        self.method_frame("SUBSCRIBE", symbols)
    }

    fn unsubscribe_frames(&self, symbols: &[String]) -> Vec<String> {
        self.method_frame("UNSUBSCRIBE", symbols)
    }

    fn parse(&self, text: &str) -> Parsed {
        parse_frame(text)
    }

    async fn bootstrap(&self, symbols: &[String]) -> Result<Vec<MarketEvent>> {
        let weight = depth_weight(self.snapshot_limit);
        let mut events = Vec::with_capacity(symbols.len());
        for sym in symbols {
            if !self.rest.can_spend(weight) {
                warn!(symbol = %sym, "depth snapshot skipped, request weight exhausted");
                continue;
            }
            match self.rest.get_depth(sym, self.snapshot_limit).await {
                Ok(book) => events.push(MarketEvent::BookSnapshot(book)),
                Err(e) => warn!(symbol = %sym, error = %e, "depth snapshot failed"),
            }
        }
        Ok(events)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn events(text: &str) -> Vec<MarketEvent> {
        match parse_frame(text) {
            Parsed::Events(e) => e,
            other => panic!("expected events, got {other:?}"),
        }
    }

    #[test]
    fn symbol_mapping() {
        assert_eq!(venue_symbol("btc"), "BTCUSDT");
        assert_eq!(canonical_symbol("ethusdt").as_deref(), Some("ETH"));
        assert_eq!(canonical_symbol("USDT"), None);
        assert_eq!(canonical_symbol("ETHBTC"), None);
    }

    #[test]
    fn depth_update_becomes_diff() {
        let text = r#"{"stream":"btcusdt@depth@100ms","data":{"e":"depthUpdate","E":1700000000123,
            "s":"BTCUSDT","U":157,"u":160,"b":[["0.0024","10"]],"a":[["0.0026","100"],["0.0027","0"]]}}"#;
        let ev = events(text);
        let MarketEvent::BookDiff(d) = &ev[0] else { panic!("not a diff") };
        assert_eq!(d.symbol, "BTC");
        assert_eq!(d.sequence, 160);
        assert_eq!(d.timestamp, 1_700_000_000_123);
        assert_eq!(d.bids, vec![PriceLevel::new(dec!(0.0024), dec!(10))]);
        assert_eq!(d.asks[1].size, Decimal::ZERO);
    }

    #[test]
    fn agg_trade_side_follows_maker_flag() {
        let text = r#"{"stream":"ethusdt@aggTrade","data":{"e":"aggTrade","E":1,"s":"ETHUSDT",
            "a":26129,"p":"3500.10","q":"0.5","f":100,"l":105,"T":1700000000000,"m":true,"M":true}}"#;
        let ev = events(text);
        let MarketEvent::Trades { symbol, trades, .. } = &ev[0] else { panic!("not trades") };
        assert_eq!(symbol, "ETH");
        assert_eq!(trades[0].id, "26129");
        assert_eq!(trades[0].side, Side::Sell);
        assert_eq!(trades[0].price, dec!(3500.10));
    }

    #[test]
    fn kline_becomes_candle() {
        let text = r#"{"stream":"solusdt@kline_5m","data":{"e":"kline","E":1,"s":"SOLUSDT","k":{
            "t":1700000100000,"T":1700000399999,"s":"SOLUSDT","i":"5m","f":1,"L":2,
            "o":"100","c":"102","h":"103","l":"99","v":"10","n":7,"x":false,"q":"1010","V":"5","Q":"505","B":"0"}}}"#;
        let ev = events(text);
        let MarketEvent::Candle(c) = &ev[0] else { panic!("not a candle") };
        assert_eq!(c.timeframe, Timeframe::M5);
        assert_eq!(c.timestamp, 1_700_000_100_000);
        assert_eq!((c.open, c.high, c.low, c.close), (dec!(100), dec!(103), dec!(99), dec!(102)));
        assert_eq!(c.vwap, dec!(101));
        assert_eq!(c.trade_count, 7);
    }

    #[test]
    fn acks_and_garbage() {
        assert_eq!(parse_frame(r#"{"result":null,"id":3}"#), Parsed::Control);
        assert!(matches!(parse_frame("not json"), Parsed::Unrecognized(_)));
        assert!(matches!(
            parse_frame(r#"{"stream":"x","data":{"e":"outboundAccountPosition"}}"#),
            Parsed::Unrecognized(_)
        ));
        assert!(matches!(
            parse_frame(r#"{"error":{"code":2,"msg":"Invalid request"},"id":4}"#),
            Parsed::Unrecognized(_)
        ));
    }

    #[test]
    fn depth_snapshot_parses_into_sorted_book() {
        let body = r#"{"lastUpdateId":1027024,"bids":[["4.00000000","431.00000000"],["4.10000000","1"]],
            "asks":[["4.00000200","12.00000000"]]}"#;
        let book = parse_depth_snapshot("BNB", body, 5).unwrap();
        assert_eq!(book.sequence, 1_027_024);
        assert_eq!(book.bids.levels[0].price, dec!(4.1));
        assert_eq!(book.asks.levels.len(), 1);
        assert_eq!(book.exchange, Exchange::Binance);
    }

    #[test]
    fn subscribe_frame_lists_all_streams() {
        let rest = BinanceRestClient::new("http://localhost", Duration::from_secs(1)).unwrap();
        let adapter = BinanceAdapter::new("ws://x", rest, vec![Timeframe::M1, Timeframe::H1], 50);
        let frames = adapter.subscribe_frames(&["BTC".to_string()]);
        let v: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(v["method"], "SUBSCRIBE");
        let params: Vec<&str> = v["params"].as_array().unwrap().iter().filter_map(|p| p.as_str()).collect();
        assert_eq!(
            params,
            vec!["btcusdt@depth@100ms", "btcusdt@aggTrade", "btcusdt@kline_1m", "btcusdt@kline_1h"]
        );
        assert!(adapter.unsubscribe_frames(&[]).is_empty());
        assert_eq!(adapter.snapshot_limit, 50);
    }

    #[test]
    fn snapshot_limit_rounds_up() {
        assert_eq!(snapshot_limit(1), 5);
        assert_eq!(snapshot_limit(50), 50);
        assert_eq!(snapshot_limit(51), 100);
        assert_eq!(snapshot_limit(10_000), 5000);
    }
}
