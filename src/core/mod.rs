//! Core domain types and abstractions

pub mod config;
pub mod error;
pub mod log;
pub mod provider;
pub mod rate;

// Re-export main types for cleaner imports
pub use error::{ErrorKind, LookupError, ProviderError, RateError};
pub use provider::{FetchOutcome, PairFailure, RateProvider};
pub use rate::{CurrencyPair, ProviderKind, RateRecord, RateSource};
