//! Consolidated cross-exchange order book.
//!
//! The latest book from every exchange is kept per symbol; a merge sums sizes
//! at equal prices and keeps per-exchange attribution on every level. Books
//! not refreshed within the staleness threshold are left out.
//!
//! Updates for one symbol are serialized behind an async gate held across
//! the cache write, so the cached merge always reflects the latest insert.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::cache::{self, keys, SharedCache};
use crate::types::{now_ms, Exchange, OrderBook, PriceLevel};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelSource {
    pub exchange: Exchange,
    pub size: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedLevel {
    pub price: Decimal,
    pub size: Decimal,
    pub sources: Vec<LevelSource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedBook {
    pub symbol: String,
    pub bids: Vec<AggregatedLevel>,
    pub asks: Vec<AggregatedLevel>,
    pub exchanges: Vec<Exchange>,
    pub spread: Decimal,
    pub mid_price: Decimal,
    pub timestamp: i64,
}

struct Entry {
    book: OrderBook,
    received_at: i64,
}

pub struct BookMerger {
    books: RwLock<HashMap<String, BTreeMap<Exchange, Entry>>>,
    gates: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    depth: usize,
    stale_after_ms: i64,
    cache: SharedCache,
    ttl: Duration,
}

impl BookMerger {
    pub fn new(cache: SharedCache, depth: usize, stale_after_ms: i64, ttl: Duration) -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            depth,
            stale_after_ms,
            cache,
            ttl,
        }
    }

    /// Record a fresh per-exchange book and publish the consolidated one.
    pub async fn on_book(&self, book: &OrderBook) -> Result<Option<AggregatedBook>> {
        self.on_book_at(book, now_ms()).await
    }

    fn gate(&self, symbol: &str) -> Arc<AsyncMutex<()>> {
        self.gates.lock().entry(symbol.to_string()).or_default().clone()
    }

    async fn on_book_at(&self, book: &OrderBook, now: i64) -> Result<Option<AggregatedBook>> {
        let gate = self.gate(&book.symbol);
        let _serial = gate.lock().await;

        self.books.write().entry(book.symbol.clone()).or_default().insert(
            book.exchange,
            Entry {
                book: book.clone(),
                received_at: now,
            },
        );

        let Some(merged) = self.merge_at(&book.symbol, now) else {
            return Ok(None);
        };
        self.store(&merged).await?;
        Ok(Some(merged))
    }

    /// Drop an exchange's book after its feed was unsubscribed or closed, and
    /// republish the merge of whatever remains. The cached merge is deleted
    /// once no fresh source is left.
    pub async fn release(&self, symbol: &str, exchange: Exchange) -> Result<Option<AggregatedBook>> {
        self.release_at(symbol, exchange, now_ms()).await
    }

    async fn release_at(&self, symbol: &str, exchange: Exchange, now: i64) -> Result<Option<AggregatedBook>> {
        let gate = self.gate(symbol);
        let _serial = gate.lock().await;

        let removed = {
            let mut books = self.books.write();
            let removed = books.get_mut(symbol).and_then(|per_ex| per_ex.remove(&exchange));
            if books.get(symbol).is_some_and(BTreeMap::is_empty) {
                books.remove(symbol);
            }
            removed
        };
        if removed.is_none() {
            return Ok(None);
        }
        debug!(symbol, %exchange, "book source released");

        match self.merge_at(symbol, now) {
            Some(merged) => {
                self.store(&merged).await?;
                Ok(Some(merged))
            }
            None => {
                self.cache.delete(&keys::agg_book(symbol)).await?;
                Ok(None)
            }
        }
    }

    async fn store(&self, merged: &AggregatedBook) -> Result<()> {
        cache::set_and_publish(
            self.cache.as_ref(),
            &keys::agg_book(&merged.symbol),
            &keys::agg_book_channel(&merged.symbol),
            merged,
            self.ttl,
        )
        .await
    }

    /// Consolidated book for `symbol` from the non-stale sources.
    pub fn merge_at(&self, symbol: &str, now: i64) -> Option<AggregatedBook> {
        let books = self.books.read();
        let fresh: Vec<&OrderBook> = books
            .get(symbol)?
            .values()
            .filter(|e| now - e.received_at <= self.stale_after_ms)
            .map(|e| &e.book)
            .collect();
        if fresh.is_empty() {
            return None;
        }

        let bids = merge_side(fresh.iter().map(|b| (b.exchange, &b.bids.levels)), true, self.depth);
        let asks = merge_side(fresh.iter().map(|b| (b.exchange, &b.asks.levels)), false, self.depth);
        let (spread, mid_price) = match (bids.first(), asks.first()) {
            (Some(b), Some(a)) => (a.price - b.price, (a.price + b.price) / Decimal::TWO),
            _ => (Decimal::ZERO, Decimal::ZERO),
        };

        Some(AggregatedBook {
            symbol: symbol.to_string(),
            bids,
            asks,
            exchanges: fresh.iter().map(|b| b.exchange).collect(),
            spread,
            mid_price,
            timestamp: fresh.iter().map(|b| b.timestamp).max().unwrap_or(now),
        })
    }
}

fn merge_side<'a>(
    sides: impl Iterator<Item = (Exchange, &'a Vec<PriceLevel>)>,
    descending: bool,
    depth: usize,
) -> Vec<AggregatedLevel> {
    let mut by_price: BTreeMap<Decimal, AggregatedLevel> = BTreeMap::new();
    for (exchange, levels) in sides {
        for level in levels.iter().filter(|l| !l.size.is_zero()) {
            let entry = by_price.entry(level.price).or_insert_with(|| AggregatedLevel {
                price: level.price,
                size: Decimal::ZERO,
                sources: Vec::new(),
            });
            entry.size += level.size;
            entry.sources.push(LevelSource {
                exchange,
                size: level.size,
            });
        }
    }

    if descending {
        by_price.into_values().rev().take(depth).collect()
    } else {
        by_price.into_values().take(depth).collect()
    }
}
