pub mod candle_store;
pub mod file_store;
pub mod series;

// Re-export the core store types (e.g. `use crate::store::Candle`).
pub use candle_store::CandleStore;
pub use file_store::{FileStore, Persistence};
pub use series::{Candle, PairKey};
