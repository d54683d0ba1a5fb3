//! Error taxonomy for fetching and reading rates.
//!
//! - [`RateError`]: a record or pair violated its invariants
//! - [`ProviderError`]: a provider fetch failed, classified by [`ErrorKind`]
//! - [`LookupError`]: what consumers get back when a rate can't be served as asked

use chrono::Duration;
use serde::Serialize;
use thiserror::Error;

use super::rate::{CurrencyPair, ProviderKind, RateRecord};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RateError {
    #[error("Invalid currency code: '{0}'")]
    InvalidCode(String),

    #[error("Base and quote currency must differ: {0}")]
    SameCurrency(String),

    #[error("Invalid currency pair: '{0}'")]
    InvalidPair(String),

    #[error("Rate for {pair} must be positive and finite, got {rate}")]
    InvalidRate { pair: String, rate: f64 },
}

/// Whether a failed fetch is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Timeouts, 5xx, rate limiting. Retried with backoff.
    Transient,
    /// Unknown symbols, rejected credentials, malformed payloads. Never retried.
    Permanent,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Request timed out: {provider}")]
    Timeout { provider: String },

    #[error("Rate limited: {provider}")]
    RateLimited { provider: String },

    #[error("Server error {status}: {provider}")]
    Server { provider: String, status: u16 },

    #[error("Network error: {provider} - {message}")]
    Network { provider: String, message: String },

    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("Credential rejected: {provider}")]
    Unauthorized { provider: String },

    #[error("Malformed response from {provider}: {message}")]
    MalformedResponse { provider: String, message: String },

    #[error("HTTP error {status}: {provider}")]
    Http { provider: String, status: u16 },

    #[error("No {0} provider configured")]
    NoProvider(ProviderKind),

    #[error(transparent)]
    InvalidRate(#[from] RateError),
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. }
            | Self::RateLimited { .. }
            | Self::Server { .. }
            | Self::Network { .. } => ErrorKind::Transient,

            Self::UnknownSymbol(_)
            | Self::Unauthorized { .. }
            | Self::MalformedResponse { .. }
            | Self::Http { .. }
            | Self::NoProvider(_)
            | Self::InvalidRate(_) => ErrorKind::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LookupError {
    #[error("No rate recorded for {0}")]
    NotFound(CurrencyPair),

    /// Not a failure of the cache: the last known record is attached so the
    /// caller can decide between using it and refreshing.
    #[error("Rate for {} is stale ({}s old)", record.pair(), age.num_seconds())]
    Stale { record: RateRecord, age: Duration },

    #[error(transparent)]
    InvalidPair(#[from] RateError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> String {
        "CoinGecko".to_string()
    }

    #[test]
    fn test_transient_errors() {
        for error in [
            ProviderError::Timeout {
                provider: provider(),
            },
            ProviderError::RateLimited {
                provider: provider(),
            },
            ProviderError::Server {
                provider: provider(),
                status: 503,
            },
            ProviderError::Network {
                provider: provider(),
                message: "connection reset".to_string(),
            },
        ] {
            assert_eq!(error.kind(), ErrorKind::Transient, "{error}");
        }
    }

    #[test]
    fn test_permanent_errors() {
        for error in [
            ProviderError::UnknownSymbol("DOGE".to_string()),
            ProviderError::Unauthorized {
                provider: provider(),
            },
            ProviderError::MalformedResponse {
                provider: provider(),
                message: "expected map".to_string(),
            },
            ProviderError::Http {
                provider: provider(),
                status: 404,
            },
            ProviderError::InvalidRate(RateError::InvalidRate {
                pair: "BTC/USD".to_string(),
                rate: 0.0,
            }),
        ] {
            assert_eq!(error.kind(), ErrorKind::Permanent, "{error}");
        }
    }

    #[test]
    fn test_error_display() {
        let error = ProviderError::Server {
            provider: provider(),
            status: 500,
        };
        assert_eq!(error.to_string(), "Server error 500: CoinGecko");

        let error = LookupError::NotFound(CurrencyPair::new("USD", "EUR").unwrap());
        assert_eq!(error.to_string(), "No rate recorded for USD/EUR");
    }
}
