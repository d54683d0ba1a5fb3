use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, instrument};

use super::http::HttpFetcher;
use super::offline;
use super::retry::RetryPolicy;
use crate::core::config::ProviderConfig;
use crate::core::{
    CurrencyPair, FetchOutcome, PairFailure, ProviderError, ProviderKind, RateProvider,
    RateRecord, RateSource,
};

const PROVIDER_NAME: &str = "CoinGecko";
const API_KEY_HEADER: &str = "x-cg-demo-api-key";

/// `simple/price` answers `{ "<coin id>": { "<vs currency>": price } }`.
type SimplePriceResponse = HashMap<String, HashMap<String, f64>>;

/// Crypto rates from CoinGecko's `simple/price` endpoint, quoted as
/// `(CRYPTO, QUOTE)` pairs.
pub struct CoinGeckoProvider {
    base_url: String,
    api_key: Option<String>,
    /// Crypto code to coin id, e.g. `BTC` -> `bitcoin`.
    ids: BTreeMap<String, String>,
    http: HttpFetcher,
    retry: RetryPolicy,
}

impl CoinGeckoProvider {
    pub fn new(config: &ProviderConfig, ids: &BTreeMap<String, String>) -> Result<Self> {
        Ok(CoinGeckoProvider {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config
                .api_key
                .clone()
                .filter(|key| !key.trim().is_empty()),
            ids: ids
                .iter()
                .map(|(code, id)| (code.to_ascii_uppercase(), id.clone()))
                .collect(),
            http: HttpFetcher::new(
                PROVIDER_NAME,
                config.timeout(),
                config.min_request_interval(),
            )?,
            retry: config.retry.clone(),
        })
    }

    async fn request(&self, ids: &[&str], vs: &[String]) -> Result<SimplePriceResponse, ProviderError> {
        let url = format!(
            "{}/simple/price?ids={}&vs_currencies={}",
            self.base_url,
            ids.join(","),
            vs.join(",")
        );
        let headers: Vec<(&str, &str)> = self
            .api_key
            .as_deref()
            .map(|key| vec![(API_KEY_HEADER, key)])
            .unwrap_or_default();

        let (http, url, headers) = (&self.http, url.as_str(), headers.as_slice());
        self.retry
            .run(move || http.get_json::<SimplePriceResponse>(url, headers, url))
            .await
    }
}

#[async_trait]
impl RateProvider for CoinGeckoProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Crypto
    }

    #[instrument(name = "CoinGeckoFetch", skip(self, pairs), fields(pairs = pairs.len()))]
    async fn fetch(&self, pairs: &[CurrencyPair]) -> FetchOutcome {
        let mut outcome = FetchOutcome::default();

        // Pairs without a known coin id never reach the network
        let mut requestable: Vec<(&CurrencyPair, &str)> = Vec::new();
        for pair in pairs {
            match self.ids.get(pair.base()) {
                Some(id) => requestable.push((pair, id.as_str())),
                None => outcome.failed.push(PairFailure::new(
                    pair.clone(),
                    ProviderError::UnknownSymbol(pair.base().to_string()),
                )),
            }
        }
        if requestable.is_empty() {
            return outcome;
        }

        let mut ids: Vec<&str> = requestable.iter().map(|(_, id)| *id).collect();
        ids.sort_unstable();
        ids.dedup();
        let mut vs: Vec<String> = requestable
            .iter()
            .map(|(pair, _)| pair.quote().to_ascii_lowercase())
            .collect();
        vs.sort_unstable();
        vs.dedup();

        let requested: Vec<CurrencyPair> =
            requestable.iter().map(|(pair, _)| (*pair).clone()).collect();
        let fetched_at = Utc::now();

        let prices = match self.request(&ids, &vs).await {
            Ok(prices) => prices,
            Err(error @ ProviderError::Unauthorized { .. }) => {
                outcome.merge(offline::fallback_outcome(
                    RateSource::CoinGecko,
                    &requested,
                    &error,
                    fetched_at,
                ));
                return outcome;
            }
            Err(error) => {
                outcome.merge(FetchOutcome::all_failed(&requested, &error));
                return outcome;
            }
        };

        for (pair, id) in requestable {
            let price = prices
                .get(id)
                .and_then(|quotes| quotes.get(&pair.quote().to_ascii_lowercase()));
            let record = match price {
                Some(price) => {
                    RateRecord::new(pair.clone(), *price, RateSource::CoinGecko, fetched_at)
                        .map_err(ProviderError::from)
                }
                None => Err(ProviderError::UnknownSymbol(pair.to_string())),
            };
            match record {
                Ok(record) => {
                    debug!(pair = %pair, rate = record.rate(), "Accepted rate");
                    outcome.accepted.push(record)
                }
                Err(error) => outcome.failed.push(PairFailure::new(pair.clone(), error)),
            }
        }
        outcome
    }
}
