pub mod book_merger;
pub mod candle_merger;

pub use book_merger::{AggregatedBook, BookMerger};
pub use candle_merger::CandleMerger;
