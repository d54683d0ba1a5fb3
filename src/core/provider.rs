//! Rate provider abstraction

use async_trait::async_trait;

use super::error::{ErrorKind, ProviderError};
use super::rate::{CurrencyPair, ProviderKind, RateRecord};

/// A pair that could not be fetched, attributed to the error that sank it.
#[derive(Debug, Clone, PartialEq)]
pub struct PairFailure {
    pub pair: CurrencyPair,
    pub error: ProviderError,
}

impl PairFailure {
    pub fn new(pair: CurrencyPair, error: ProviderError) -> Self {
        Self { pair, error }
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

/// Result of one provider fetch. A fetch never fails as a whole; every
/// requested pair ends up either accepted or failed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOutcome {
    pub accepted: Vec<RateRecord>,
    pub failed: Vec<PairFailure>,
}

impl FetchOutcome {
    /// Marks every pair as failed with the same error.
    pub fn all_failed(pairs: &[CurrencyPair], error: &ProviderError) -> Self {
        Self {
            accepted: Vec::new(),
            failed: pairs
                .iter()
                .map(|pair| PairFailure::new(pair.clone(), error.clone()))
                .collect(),
        }
    }

    pub fn merge(&mut self, other: FetchOutcome) {
        self.accepted.extend(other.accepted);
        self.failed.extend(other.failed);
    }
}

#[async_trait]
pub trait RateProvider: Send + Sync {
    /// Human readable provider name used in logs and reports.
    fn name(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    async fn fetch(&self, pairs: &[CurrencyPair]) -> FetchOutcome;
}
