use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;

use crate::types::{AggregatedCandle, Timeframe};

// ---------------------------------------------------------------------------
// CandleBuffer -- bounded aggregated history per (symbol, timeframe)
// ---------------------------------------------------------------------------

type HistoryKey = (String, Timeframe);

/// Thread-safe ring that keeps the most recent aggregated candles per
/// `(symbol, timeframe)`, ordered by open time. The in-progress candle is
/// updated in place; candles for a new window are appended and the ring is
/// trimmed to `max_candles`.
pub struct CandleBuffer {
    buffers: RwLock<HashMap<HistoryKey, VecDeque<AggregatedCandle>>>,
    max_candles: usize,
}

impl CandleBuffer {
    pub fn new(max_candles: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            max_candles: max_candles.max(1),
        }
    }

    /// Insert or replace the candle with the same open time.
    ///
    /// A candle older than everything retained in a full ring is dropped.
    pub fn upsert(&self, candle: AggregatedCandle) {
        let mut map = self.buffers.write();
        let ring = map
            .entry((candle.symbol.clone(), candle.timeframe))
            .or_insert_with(|| VecDeque::with_capacity(self.max_candles));

        match ring.back() {
            Some(last) if last.timestamp == candle.timestamp => {
                ring.pop_back();
                ring.push_back(candle);
            }
            Some(last) if last.timestamp > candle.timestamp => {
                match ring.binary_search_by_key(&candle.timestamp, |c| c.timestamp) {
                    Ok(i) => ring[i] = candle,
                    Err(0) if ring.len() >= self.max_candles => {}
                    Err(i) => ring.insert(i, candle),
                }
            }
            _ => ring.push_back(candle),
        }

        while ring.len() > self.max_candles {
            ring.pop_front();
        }
    }

    /// Candles with `from <= timestamp <= to`, oldest first, keeping the most
    /// recent `limit`.
    pub fn range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: Option<i64>,
        to: Option<i64>,
        limit: usize,
    ) -> Vec<AggregatedCandle> {
        let map = self.buffers.read();
        let Some(ring) = map.get(&(symbol.to_string(), timeframe)) else {
            return Vec::new();
        };
        let selected: Vec<&AggregatedCandle> = ring
            .iter()
            .filter(|c| from.map_or(true, |f| c.timestamp >= f))
            .filter(|c| to.map_or(true, |t| c.timestamp <= t))
            .collect();
        let start = selected.len().saturating_sub(limit);
        selected[start..].iter().map(|c| (*c).clone()).collect()
    }

    pub fn latest(&self, symbol: &str, timeframe: Timeframe) -> Option<AggregatedCandle> {
        let map = self.buffers.read();
        map.get(&(symbol.to_string(), timeframe))
            .and_then(|ring| ring.back().cloned())
    }

    pub fn count(&self, symbol: &str, timeframe: Timeframe) -> usize {
        let map = self.buffers.read();
        map.get(&(symbol.to_string(), timeframe))
            .map_or(0, VecDeque::len)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Exchange;
    use rust_decimal::Decimal;

    fn sample(ts: i64, close: i64) -> AggregatedCandle {
        let c = Decimal::from(close);
        AggregatedCandle {
            symbol: "ETH".into(),
            timeframe: Timeframe::M1,
            timestamp: ts,
            open: c,
            high: c,
            low: c,
            close: c,
            volume: Decimal::ONE,
            quote_volume: c,
            trade_count: 1,
            vwap: c,
            sources: vec![Exchange::Binance],
        }
    }

    #[test]
    fn ring_buffer_trimming() {
        let buf = CandleBuffer::new(3);
        for i in 0..5 {
            buf.upsert(sample(i * 60_000, i));
        }
        assert_eq!(buf.count("ETH", Timeframe::M1), 3);
        let all = buf.range("ETH", Timeframe::M1, None, None, 10);
        assert_eq!(all.first().unwrap().timestamp, 120_000);
        assert_eq!(all.last().unwrap().timestamp, 240_000);
    }

    #[test]
    fn in_progress_replacement() {
        let buf = CandleBuffer::new(10);
        buf.upsert(sample(60_000, 1));
        buf.upsert(sample(60_000, 2));
        assert_eq!(buf.count("ETH", Timeframe::M1), 1);
        assert_eq!(buf.latest("ETH", Timeframe::M1).unwrap().close, Decimal::from(2));
    }

    #[test]
    fn out_of_order_insert_keeps_ordering() {
        let buf = CandleBuffer::new(10);
        buf.upsert(sample(0, 1));
        buf.upsert(sample(120_000, 3));
        buf.upsert(sample(60_000, 2));
        buf.upsert(sample(0, 9));
        let ts: Vec<i64> = buf
            .range("ETH", Timeframe::M1, None, None, 10)
            .iter()
            .map(|c| c.timestamp)
            .collect();
        assert_eq!(ts, vec![0, 60_000, 120_000]);
        assert_eq!(buf.range("ETH", Timeframe::M1, None, Some(0), 10)[0].close, Decimal::from(9));
    }

    #[test]
    fn range_filters_and_limits() {
        let buf = CandleBuffer::new(100);
        for i in 0..10 {
            buf.upsert(sample(i * 60_000, i));
        }
        let r = buf.range("ETH", Timeframe::M1, Some(120_000), Some(420_000), 3);
        let ts: Vec<i64> = r.iter().map(|c| c.timestamp).collect();
        assert_eq!(ts, vec![300_000, 360_000, 420_000]);
        assert!(buf.range("BTC", Timeframe::M1, None, None, 3).is_empty());
    }
}
