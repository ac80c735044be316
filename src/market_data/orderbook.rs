// =============================================================================
// Order Book Engine — authoritative per-(exchange, symbol) book state
// =============================================================================
//
// Snapshots replace a key's state outright. Diffs merge into the existing
// state through a price→size map (zero size deletes), are re-sorted and cut to
// the configured depth. Diffs with a sequence at or below the current one are
// replay and get dropped; diffs for a key with no snapshot yet are dropped too,
// since there is no base to apply them to.
//
// Every accepted write is stored in the cache and announced on the key's
// update channel.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use anyhow::Result;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::cache::{self, keys, SharedCache};
use crate::types::{Exchange, OrderBook, OrderBookSide, OrderBookUpdate, PriceLevel};

type BookKey = (Exchange, String);

/// Result of applying a diff.
#[derive(Debug, Clone, PartialEq)]
pub enum DiffOutcome {
    Applied(OrderBook),
    /// Sequence at or below the current one.
    Stale { current: u64, incoming: u64 },
    /// No snapshot has been seen for this key.
    NoBase,
}

pub struct OrderBookEngine {
    books: RwLock<HashMap<BookKey, OrderBook>>,
    depth: usize,
    cache: SharedCache,
    ttl: Duration,
}

impl OrderBookEngine {
    pub fn new(cache: SharedCache, depth: usize, ttl: Duration) -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            depth,
            cache,
            ttl,
        }
    }

    /// Replace the state for the snapshot's key and publish it.
    pub async fn apply_snapshot(&self, mut snapshot: OrderBook) -> Result<OrderBook> {
        snapshot.truncate(self.depth);
        let key = (snapshot.exchange, snapshot.symbol.clone());
        self.books.write().insert(key, snapshot.clone());

        debug!(
            exchange = %snapshot.exchange,
            symbol = %snapshot.symbol,
            sequence = snapshot.sequence,
            "orderbook snapshot applied"
        );
        self.publish(&snapshot).await?;
        Ok(snapshot)
    }

    /// Merge a diff into existing state. Only `Applied` outcomes are published.
    pub async fn apply_diff(&self, update: OrderBookUpdate) -> Result<DiffOutcome> {
        let outcome = self.merge_diff(&update);
        match &outcome {
            DiffOutcome::Applied(book) => self.publish(book).await?,
            DiffOutcome::Stale { current, incoming } => {
                debug!(
                    exchange = %update.exchange,
                    symbol = %update.symbol,
                    current,
                    incoming,
                    "stale orderbook diff dropped"
                );
            }
            DiffOutcome::NoBase => {
                warn!(
                    exchange = %update.exchange,
                    symbol = %update.symbol,
                    sequence = update.sequence,
                    "orderbook diff before any snapshot dropped"
                );
            }
        }
        Ok(outcome)
    }

    fn merge_diff(&self, update: &OrderBookUpdate) -> DiffOutcome {
        let key = (update.exchange, update.symbol.clone());
        let mut books = self.books.write();
        let Some(book) = books.get_mut(&key) else {
            return DiffOutcome::NoBase;
        };
        if update.sequence <= book.sequence {
            return DiffOutcome::Stale {
                current: book.sequence,
                incoming: update.sequence,
            };
        }

        book.bids = merge_side(&book.bids, &update.bids, true, self.depth);
        book.asks = merge_side(&book.asks, &update.asks, false, self.depth);
        book.sequence = update.sequence;
        book.timestamp = update.timestamp;
        book.refresh_derived();
        DiffOutcome::Applied(book.clone())
    }

    pub fn get(&self, symbol: &str, exchange: Exchange) -> Option<OrderBook> {
        self.books.read().get(&(exchange, symbol.to_string())).cloned()
    }

    /// Book cut to the top `depth` levels per side.
    pub fn top_levels(&self, symbol: &str, exchange: Exchange, depth: usize) -> Option<OrderBook> {
        self.get(symbol, exchange).map(|mut book| {
            book.truncate(depth);
            book
        })
    }

    /// Drop state for a key, e.g. after the upstream unsubscribes.
    pub fn remove(&self, symbol: &str, exchange: Exchange) -> Option<OrderBook> {
        self.books.write().remove(&(exchange, symbol.to_string()))
    }

    async fn publish(&self, book: &OrderBook) -> Result<()> {
        cache::set_and_publish(
            self.cache.as_ref(),
            &keys::orderbook(book.exchange, &book.symbol),
            &keys::orderbook_channel(book.exchange, &book.symbol),
            book,
            self.ttl,
        )
        .await
    }
}

/// Load a side into a price map, apply level changes, re-sort and truncate.
fn merge_side(
    side: &OrderBookSide,
    changes: &[PriceLevel],
    descending: bool,
    depth: usize,
) -> OrderBookSide {
    let mut levels: BTreeMap<Decimal, Decimal> =
        side.levels.iter().map(|l| (l.price, l.size)).collect();

    for change in changes {
        if change.size.is_zero() {
            levels.remove(&change.price);
        } else {
            levels.insert(change.price, change.size);
        }
    }

    let sorted: Vec<PriceLevel> = if descending {
        levels
            .iter()
            .rev()
            .take(depth)
            .map(|(p, s)| PriceLevel::new(*p, *s))
            .collect()
    } else {
        levels
            .iter()
            .take(depth)
            .map(|(p, s)| PriceLevel::new(*p, *s))
            .collect()
    };
    OrderBookSide::from_levels(sorted)
}

// =============================================================================
// Tests
// =============================================================================
