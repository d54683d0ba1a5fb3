use chrono::{DateTime, Utc};
use tracing::warn;

use crate::core::{
    CurrencyPair, FetchOutcome, PairFailure, ProviderError, ProviderKind, RateRecord, RateSource,
};

/// Fixed rates served when a provider can't be used with the configured
/// credential. Values are `(base, quote, rate)`.
const CRYPTO_FALLBACK: &[(&str, &str, f64)] = &[
    ("BTC", "USD", 40_000.0),
    ("ETH", "USD", 2_500.0),
    ("SOL", "USD", 100.0),
    ("BTC", "EUR", 36_800.0),
    ("ETH", "EUR", 2_300.0),
];

const FIAT_FALLBACK: &[(&str, &str, f64)] = &[
    ("USD", "EUR", 0.92),
    ("USD", "GBP", 0.79),
    ("USD", "RUB", 91.5),
    ("USD", "JPY", 150.0),
    ("EUR", "USD", 1.09),
    ("GBP", "USD", 1.27),
];

fn table_for(source: RateSource) -> &'static [(&'static str, &'static str, f64)] {
    match source.provider_kind() {
        ProviderKind::Crypto => CRYPTO_FALLBACK,
        ProviderKind::Fiat => FIAT_FALLBACK,
    }
}

pub fn fallback_rate(source: RateSource, pair: &CurrencyPair) -> Option<f64> {
    table_for(source)
        .iter()
        .find(|(base, quote, _)| *base == pair.base() && *quote == pair.quote())
        .map(|(_, _, rate)| *rate)
}

/// Answers `pairs` from the fallback table, tagging records with the
/// degraded variant of `source`. Pairs the table doesn't cover fail with
/// `reason`.
pub fn fallback_outcome(
    source: RateSource,
    pairs: &[CurrencyPair],
    reason: &ProviderError,
    now: DateTime<Utc>,
) -> FetchOutcome {
    warn!(provider = %source, reason = %reason, "Serving offline fallback rates");
    let degraded = source.offline();
    let mut outcome = FetchOutcome::default();
    for pair in pairs {
        let record = fallback_rate(source, pair)
            .ok_or_else(|| reason.clone())
            .and_then(|rate| {
                RateRecord::new(pair.clone(), rate, degraded, now).map_err(ProviderError::from)
            });
        match record {
            Ok(record) => outcome.accepted.push(record),
            Err(error) => outcome.failed.push(PairFailure::new(pair.clone(), error)),
        }
    }
    outcome
}
