//! Durable storage: the latest-rate cache and the append-only history log.

pub mod cache;
pub mod history;

pub use cache::{CacheEntry, CacheSnapshot, RateCache};
pub use history::{HistoryFilter, HistoryStore};
