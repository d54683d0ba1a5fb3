use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, instrument, warn};

use super::http::HttpFetcher;
use super::offline;
use super::retry::RetryPolicy;
use crate::core::config::ProviderConfig;
use crate::core::{
    CurrencyPair, FetchOutcome, PairFailure, ProviderError, ProviderKind, RateProvider,
    RateRecord, RateSource,
};

const PROVIDER_NAME: &str = "ExchangeRate-API";

#[derive(Debug, Deserialize)]
struct LatestResponse {
    result: String,
    #[serde(rename = "error-type")]
    error_type: Option<String>,
    #[serde(default, alias = "rates")]
    conversion_rates: HashMap<String, f64>,
}

impl LatestResponse {
    /// The API reports some failures with a 200 and `"result": "error"`.
    fn into_rates(self) -> Result<HashMap<String, f64>, ProviderError> {
        if self.result == "success" {
            return Ok(self.conversion_rates);
        }
        let provider = PROVIDER_NAME.to_string();
        Err(match self.error_type.as_deref() {
            Some("invalid-key") | Some("inactive-account") => {
                ProviderError::Unauthorized { provider }
            }
            Some("quota-reached") => ProviderError::RateLimited { provider },
            Some("unsupported-code") => {
                ProviderError::UnknownSymbol("unsupported base currency".to_string())
            }
            other => ProviderError::MalformedResponse {
                provider,
                message: format!("error-type: {}", other.unwrap_or("missing")),
            },
        })
    }
}

/// Fiat rates from ExchangeRate-API's `latest/<BASE>` endpoint, quoted as
/// `(BASE, FIAT)` pairs. One request covers every quote for a base.
pub struct ExchangeRateProvider {
    base_url: String,
    api_key: Option<String>,
    http: HttpFetcher,
    retry: RetryPolicy,
}

impl ExchangeRateProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty());
        if api_key.is_none() {
            warn!("No API key for {PROVIDER_NAME}, fiat rates will come from the offline table");
        }
        Ok(ExchangeRateProvider {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            http: HttpFetcher::new(
                PROVIDER_NAME,
                config.timeout(),
                config.min_request_interval(),
            )?,
            retry: config.retry.clone(),
        })
    }

    async fn latest(&self, api_key: &str, base: &str) -> Result<HashMap<String, f64>, ProviderError> {
        let url = format!("{}/{}/latest/{}", self.base_url, api_key, base);
        let log_url = format!("{}/***/latest/{}", self.base_url, base);
        let (http, url, log_url) = (&self.http, url.as_str(), log_url.as_str());
        self.retry
            .run(move || async move {
                http.get_json::<LatestResponse>(url, &[], log_url)
                    .await?
                    .into_rates()
            })
            .await
    }
}

#[async_trait]
impl RateProvider for ExchangeRateProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Fiat
    }

    #[instrument(name = "ExchangeRateFetch", skip(self, pairs), fields(pairs = pairs.len()))]
    async fn fetch(&self, pairs: &[CurrencyPair]) -> FetchOutcome {
        let mut outcome = FetchOutcome::default();
        if pairs.is_empty() {
            return outcome;
        }

        let Some(api_key) = self.api_key.as_deref() else {
            let reason = ProviderError::Unauthorized {
                provider: PROVIDER_NAME.to_string(),
            };
            return offline::fallback_outcome(
                RateSource::ExchangeRateApi,
                pairs,
                &reason,
                Utc::now(),
            );
        };

        let bases: BTreeSet<&str> = pairs.iter().map(|pair| pair.base()).collect();
        for base in bases {
            let group: Vec<CurrencyPair> = pairs
                .iter()
                .filter(|pair| pair.base() == base)
                .cloned()
                .collect();
            let fetched_at = Utc::now();

            let rates = match self.latest(api_key, base).await {
                Ok(rates) => rates,
                Err(error @ ProviderError::Unauthorized { .. }) => {
                    outcome.merge(offline::fallback_outcome(
                        RateSource::ExchangeRateApi,
                        &group,
                        &error,
                        fetched_at,
                    ));
                    continue;
                }
                Err(error) => {
                    outcome.merge(FetchOutcome::all_failed(&group, &error));
                    continue;
                }
            };

            for pair in group {
                let record = match rates.get(pair.quote()) {
                    Some(rate) => {
                        RateRecord::new(pair.clone(), *rate, RateSource::ExchangeRateApi, fetched_at)
                            .map_err(ProviderError::from)
                    }
                    None => Err(ProviderError::UnknownSymbol(pair.quote().to_string())),
                };
                match record {
                    Ok(record) => {
                        debug!(pair = %pair, rate = record.rate(), "Accepted rate");
                        outcome.accepted.push(record)
                    }
                    Err(error) => outcome.failed.push(PairFailure::new(pair, error)),
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: &str, api_key: Option<&str>) -> ProviderConfig {
        ProviderConfig {
            base_url: base_url.to_string(),
            api_key: api_key.map(String::from),
            timeout_secs: 5,
            min_request_interval_ms: 0,
            retry: RetryPolicy {
                max_attempts: 2,
                initial_delay_ms: 10,
                multiplier: 2.0,
                max_delay_ms: 50,
            },
        }
    }

    fn usd_pairs(quotes: &[&str]) -> Vec<CurrencyPair> {
        quotes
            .iter()
            .map(|quote| CurrencyPair::new("USD", quote).unwrap())
            .collect()
    }

    async fn mount_latest(mock_server: &MockServer, status: u16, body: &str) {
        Mock::given(method("GET"))
            .and(path("/test-key/latest/USD"))
            .respond_with(ResponseTemplate::new(status).set_body_string(body))
            .mount(mock_server)
            .await;
    }

    #[tokio::test]
    async fn test_successful_fetch() {
        let mock_server = MockServer::start().await;
        mount_latest(
            &mock_server,
            200,
            r#"{"result": "success", "base_code": "USD", "conversion_rates": {"USD": 1, "EUR": 0.92, "GBP": 0.79}}"#,
        )
        .await;

        let provider =
            ExchangeRateProvider::new(&config(&mock_server.uri(), Some("test-key"))).unwrap();
        let outcome = provider.fetch(&usd_pairs(&["EUR", "GBP", "XXX"])).await;

        assert_eq!(outcome.accepted.len(), 2);
        assert_eq!(outcome.accepted[0].pair(), &CurrencyPair::new("USD", "EUR").unwrap());
        assert_eq!(outcome.accepted[0].rate(), 0.92);
        assert_eq!(outcome.accepted[0].source(), RateSource::ExchangeRateApi);
        assert_eq!(outcome.accepted[1].rate(), 0.79);

        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(
            outcome.failed[0].error,
            ProviderError::UnknownSymbol("XXX".to_string())
        );
    }

    #[tokio::test]
    async fn test_legacy_rates_field_is_accepted() {
        let mock_server = MockServer::start().await;
        mount_latest(
            &mock_server,
            200,
            r#"{"result": "success", "rates": {"EUR": 0.93}}"#,
        )
        .await;

        let provider =
            ExchangeRateProvider::new(&config(&mock_server.uri(), Some("test-key"))).unwrap();
        let outcome = provider.fetch(&usd_pairs(&["EUR"])).await;
        assert_eq!(outcome.accepted[0].rate(), 0.93);
    }

    #[tokio::test]
    async fn test_missing_key_uses_offline_rates_without_request() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&mock_server)
            .await;

        let provider = ExchangeRateProvider::new(&config(&mock_server.uri(), None)).unwrap();
        let outcome = provider.fetch(&usd_pairs(&["EUR", "GBP"])).await;

        assert!(outcome.failed.is_empty());
        assert_eq!(outcome.accepted.len(), 2);
        assert!(
            outcome
                .accepted
                .iter()
                .all(|r| r.source() == RateSource::ExchangeRateApiOffline)
        );
    }

    #[tokio::test]
    async fn test_invalid_key_body_uses_offline_rates() {
        let mock_server = MockServer::start().await;
        mount_latest(
            &mock_server,
            200,
            r#"{"result": "error", "error-type": "invalid-key"}"#,
        )
        .await;

        let provider =
            ExchangeRateProvider::new(&config(&mock_server.uri(), Some("test-key"))).unwrap();
        let outcome = provider.fetch(&usd_pairs(&["EUR", "CHF"])).await;

        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(
            outcome.accepted[0].source(),
            RateSource::ExchangeRateApiOffline
        );
        assert_eq!(outcome.failed.len(), 1);
        assert!(matches!(
            outcome.failed[0].error,
            ProviderError::Unauthorized { .. }
        ));
    }

    #[tokio::test]
    async fn test_quota_reached_is_retried_as_transient() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/test-key/latest/USD"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"result": "error", "error-type": "quota-reached"}"#),
            )
            .expect(2)
            .mount(&mock_server)
            .await;

        let provider =
            ExchangeRateProvider::new(&config(&mock_server.uri(), Some("test-key"))).unwrap();
        let outcome = provider.fetch(&usd_pairs(&["EUR"])).await;

        assert!(outcome.accepted.is_empty());
        assert_eq!(outcome.failed[0].kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_malformed_body_is_permanent() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/test-key/latest/USD"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let provider =
            ExchangeRateProvider::new(&config(&mock_server.uri(), Some("test-key"))).unwrap();
        let outcome = provider.fetch(&usd_pairs(&["EUR"])).await;

        assert!(matches!(
            outcome.failed[0].error,
            ProviderError::MalformedResponse { .. }
        ));
        assert_eq!(outcome.failed[0].kind(), ErrorKind::Permanent);
    }
}
