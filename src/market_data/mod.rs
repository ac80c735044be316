pub mod candle_buffer;
pub mod orderbook;
pub mod trade_aggregator;
pub mod trade_buffer;
pub mod trade_store;

pub use candle_buffer::CandleBuffer;
pub use orderbook::{DiffOutcome, OrderBookEngine};
pub use trade_aggregator::TradeAggregator;
pub use trade_buffer::TradeBuffer;
pub use trade_store::{MemoryTradeStore, TradeStore};
