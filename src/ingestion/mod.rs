//! Exchange ingestion.
//!
//! Each venue has one adapter that knows its URL, its subscribe/unsubscribe
//! frames and its canonical parser. The generic [`worker`] owns the socket:
//! connect, resubscribe, heartbeat and reconnect with backoff. Workers emit
//! normalized [`MarketEvent`]s on a typed channel and never share state with
//! each other.

pub mod backoff;
pub mod binance;
pub mod hyperliquid;
pub mod lighter;
pub mod worker;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::Relaxed};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::types::{Exchange, MarketEvent};

pub use binance::BinanceAdapter;
pub use hyperliquid::HyperliquidAdapter;
pub use lighter::LighterAdapter;
pub use worker::WorkerHandle;

/// Outcome of parsing one text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    Events(Vec<MarketEvent>),
    /// Frame the venue expects echoed back (server-initiated ping).
    Reply(String),
    /// Acks, pongs and other frames that carry no market data.
    Control,
    /// Unknown or schema-violating payload; logged and dropped.
    Unrecognized(String),
}

/// Venue-specific half of an ingestion worker.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync + 'static {
    fn exchange(&self) -> Exchange;

    fn ws_url(&self) -> String;

    /// Frames that subscribe `symbols` on an open connection.
    fn subscribe_frames(&self, symbols: &[String]) -> Vec<String>;

    fn unsubscribe_frames(&self, symbols: &[String]) -> Vec<String>;

    /// Application-level ping. `None` means a WebSocket ping frame is used.
    fn ping_frame(&self) -> Option<String> {
        None
    }

    fn parse(&self, text: &str) -> Parsed;

    /// Events to emit right after `symbols` were subscribed, e.g. REST
    /// snapshots for venues whose stream only carries diffs.
    async fn bootstrap(&self, _symbols: &[String]) -> Result<Vec<MarketEvent>> {
        Ok(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// Worker status
// ---------------------------------------------------------------------------

/// Lock-free counters a worker updates and the health endpoint reads.
#[derive(Debug, Default)]
pub struct WorkerStatus {
    pub connected: AtomicBool,
    /// Set once consecutive reconnects exceed the configured bound.
    pub failed: AtomicBool,
    pub reconnects: AtomicU64,
    pub messages: AtomicU64,
    pub parse_errors: AtomicU64,
    pub last_message_ms: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatusSnapshot {
    pub exchange: Exchange,
    pub connected: bool,
    pub failed: bool,
    pub reconnects: u64,
    pub messages: u64,
    pub parse_errors: u64,
    pub last_message_ms: u64,
}

impl WorkerStatus {
    pub fn snapshot(&self, exchange: Exchange) -> WorkerStatusSnapshot {
        WorkerStatusSnapshot {
            exchange,
            connected: self.connected.load(Relaxed),
            failed: self.failed.load(Relaxed),
            reconnects: self.reconnects.load(Relaxed),
            messages: self.messages.load(Relaxed),
            parse_errors: self.parse_errors.load(Relaxed),
            last_message_ms: self.last_message_ms.load(Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared parsing helpers
// ---------------------------------------------------------------------------

/// First 200 bytes of a payload for log lines.
pub(crate) fn payload_head(text: &str) -> &str {
    let mut end = text.len().min(200);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
