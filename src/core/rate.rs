//! Rate records and the currency pairs they are quoted for

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;

use super::error::RateError;

/// The family of currencies a provider quotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Crypto,
    Fiat,
}

impl Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Crypto => write!(f, "crypto"),
            ProviderKind::Fiat => write!(f, "fiat"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "crypto" => Ok(ProviderKind::Crypto),
            "fiat" => Ok(ProviderKind::Fiat),
            other => Err(format!("unknown provider kind '{other}', expected crypto or fiat")),
        }
    }
}

/// Where a record came from. The `*Offline` variants mark records served from
/// the built-in fallback table instead of the live provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateSource {
    CoinGecko,
    CoinGeckoOffline,
    ExchangeRateApi,
    ExchangeRateApiOffline,
}

impl RateSource {
    pub fn provider_kind(&self) -> ProviderKind {
        match self {
            RateSource::CoinGecko | RateSource::CoinGeckoOffline => ProviderKind::Crypto,
            RateSource::ExchangeRateApi | RateSource::ExchangeRateApiOffline => ProviderKind::Fiat,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            RateSource::CoinGeckoOffline | RateSource::ExchangeRateApiOffline
        )
    }

    /// The degraded counterpart of a live source.
    pub fn offline(&self) -> RateSource {
        match self {
            RateSource::CoinGecko | RateSource::CoinGeckoOffline => RateSource::CoinGeckoOffline,
            RateSource::ExchangeRateApi | RateSource::ExchangeRateApiOffline => {
                RateSource::ExchangeRateApiOffline
            }
        }
    }
}

impl Display for RateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RateSource::CoinGecko => "CoinGecko",
            RateSource::CoinGeckoOffline => "CoinGecko (offline)",
            RateSource::ExchangeRateApi => "ExchangeRate-API",
            RateSource::ExchangeRateApiOffline => "ExchangeRate-API (offline)",
        };
        write!(f, "{name}")
    }
}

/// An ordered `(base, quote)` combination. Codes are upper-cased on
/// construction and the two sides never match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawPair")]
pub struct CurrencyPair {
    base: String,
    quote: String,
}

#[derive(Deserialize)]
struct RawPair {
    base: String,
    quote: String,
}

impl TryFrom<RawPair> for CurrencyPair {
    type Error = RateError;

    fn try_from(raw: RawPair) -> Result<Self, Self::Error> {
        CurrencyPair::new(&raw.base, &raw.quote)
    }
}

fn normalize_code(code: &str) -> Result<String, RateError> {
    let code = code.trim();
    if code.is_empty() || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(RateError::InvalidCode(code.to_string()));
    }
    Ok(code.to_ascii_uppercase())
}

impl CurrencyPair {
    pub fn new(base: &str, quote: &str) -> Result<Self, RateError> {
        let base = normalize_code(base)?;
        let quote = normalize_code(quote)?;
        if base == quote {
            return Err(RateError::SameCurrency(base));
        }
        Ok(Self { base, quote })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn quote(&self) -> &str {
        &self.quote
    }

    pub fn inverse(&self) -> CurrencyPair {
        CurrencyPair {
            base: self.quote.clone(),
            quote: self.base.clone(),
        }
    }

    pub fn involves(&self, code: &str) -> bool {
        self.base.eq_ignore_ascii_case(code) || self.quote.eq_ignore_ascii_case(code)
    }

    /// Key used in the durable cache file, e.g. `BTC_USD`.
    pub fn storage_key(&self) -> String {
        format!("{}_{}", self.base, self.quote)
    }
}

impl Display for CurrencyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

impl FromStr for CurrencyPair {
    type Err = RateError;

    /// Accepts `BTC_USD`, `BTC/USD` and `BTC-USD`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, quote) = s
            .split_once(['_', '/', '-'])
            .ok_or_else(|| RateError::InvalidPair(s.to_string()))?;
        CurrencyPair::new(base, quote)
    }
}

/// A single quoted rate. Immutable once built; every constructor path,
/// deserialization included, enforces `rate > 0` and finiteness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RecordRepr", into = "RecordRepr")]
pub struct RateRecord {
    pair: CurrencyPair,
    rate: f64,
    source: RateSource,
    fetched_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct RecordRepr {
    base: String,
    quote: String,
    rate: f64,
    source: RateSource,
    fetched_at: DateTime<Utc>,
}

impl TryFrom<RecordRepr> for RateRecord {
    type Error = RateError;

    fn try_from(repr: RecordRepr) -> Result<Self, Self::Error> {
        let pair = CurrencyPair::new(&repr.base, &repr.quote)?;
        RateRecord::new(pair, repr.rate, repr.source, repr.fetched_at)
    }
}

impl From<RateRecord> for RecordRepr {
    fn from(record: RateRecord) -> Self {
        RecordRepr {
            base: record.pair.base,
            quote: record.pair.quote,
            rate: record.rate,
            source: record.source,
            fetched_at: record.fetched_at,
        }
    }
}

impl RateRecord {
    pub fn new(
        pair: CurrencyPair,
        rate: f64,
        source: RateSource,
        fetched_at: DateTime<Utc>,
    ) -> Result<Self, RateError> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(RateError::InvalidRate {
                pair: pair.to_string(),
                rate,
            });
        }
        Ok(Self {
            pair,
            rate,
            source,
            fetched_at,
        })
    }

    pub fn pair(&self) -> &CurrencyPair {
        &self.pair
    }

    pub fn base(&self) -> &str {
        self.pair.base()
    }

    pub fn quote(&self) -> &str {
        self.pair.quote()
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn source(&self) -> RateSource {
        self.source
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        now - self.fetched_at
    }

    /// Stale once strictly older than `ttl`.
    pub fn is_stale_at(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        self.age_at(now) > ttl
    }
}
