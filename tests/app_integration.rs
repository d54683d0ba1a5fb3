use std::fs;
use std::path::Path;
use tracing::info;

use ratevault::config::AppConfig;
use ratevault::core::{LookupError, RateSource};
use ratevault::scheduler::TriggerOutcome;
use ratevault::service::{Derivation, RateFilter, RateService};
use ratevault::store::HistoryFilter;
use ratevault::updater::Scope;

mod test_utils {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub async fn create_coingecko_mock(status: u16, body: &str) -> MockServer {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/simple/price"))
            .respond_with(ResponseTemplate::new(status).set_body_string(body))
            .mount(&mock_server)
            .await;
        mock_server
    }

    pub async fn create_exchangerate_mock(status: u16, body: &str) -> MockServer {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/test-key/latest/USD"))
            .respond_with(ResponseTemplate::new(status).set_body_string(body))
            .mount(&mock_server)
            .await;
        mock_server
    }

    pub const COINGECKO_OK: &str = r#"{"bitcoin": {"usd": 65000.0}, "ethereum": {"usd": 3200.0}}"#;
    pub const EXCHANGERATE_OK: &str = r#"{
        "result": "success",
        "base_code": "USD",
        "conversion_rates": {"USD": 1, "EUR": 0.92, "GBP": 0.79}
    }"#;
}

fn write_config(dir: &Path, coingecko_url: &str, exchangerate_url: &str) -> String {
    let config_path = dir.join("config.yaml");
    let config_content = format!(
        r#"
        base_currency: "USD"
        fiat_currencies: ["EUR", "GBP"]
        crypto_currencies: ["BTC", "ETH"]
        ttl_secs: 300
        data_path: "{}"
        providers:
          coingecko:
            base_url: "{}"
            min_request_interval_ms: 0
            retry:
              max_attempts: 2
              initial_delay_ms: 10
          exchangerate:
            base_url: "{}"
            api_key: "test-key"
            min_request_interval_ms: 0
            retry:
              max_attempts: 2
              initial_delay_ms: 10
    "#,
        dir.join("data").display(),
        coingecko_url,
        exchangerate_url
    );
    fs::write(&config_path, config_content).expect("Failed to write config file");
    config_path.to_string_lossy().into_owned()
}

fn cached_pairs(dir: &Path) -> Vec<String> {
    let contents = fs::read_to_string(dir.join("data").join("rates.json"))
        .expect("Rate cache should exist after an update");
    let cache: serde_json::Value = serde_json::from_str(&contents).expect("Cache is valid JSON");
    cache["rates"]
        .as_object()
        .expect("Cache has a rates map")
        .keys()
        .cloned()
        .collect()
}

#[test_log::test(tokio::test)]
async fn test_full_app_flow_with_mock() {
    let coingecko = test_utils::create_coingecko_mock(200, test_utils::COINGECKO_OK).await;
    let exchangerate =
        test_utils::create_exchangerate_mock(200, test_utils::EXCHANGERATE_OK).await;
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let config_path = write_config(temp_dir.path(), &coingecko.uri(), &exchangerate.uri());

    let result = ratevault::run_command(
        ratevault::AppCommand::Update { scope: Scope::All },
        Some(&config_path),
    )
    .await;
    assert!(result.is_ok(), "Update failed with: {:?}", result.err());
    assert_eq!(
        cached_pairs(temp_dir.path()),
        vec!["BTC_USD", "ETH_USD", "USD_EUR", "USD_GBP"]
    );

    for command in [
        ratevault::AppCommand::Rate {
            from: "BTC".to_string(),
            to: "EUR".to_string(),
        },
        ratevault::AppCommand::Rates(RateFilter {
            top: Some(2),
            ..RateFilter::default()
        }),
        ratevault::AppCommand::History {
            filter: HistoryFilter::default(),
            limit: Some(10),
        },
        ratevault::AppCommand::Status,
    ] {
        let result = ratevault::run_command(command, Some(&config_path)).await;
        assert!(result.is_ok(), "Command failed with: {:?}", result.err());
    }
}

#[test_log::test(tokio::test)]
async fn test_crypto_outage_is_partial_success() {
    let coingecko = test_utils::create_coingecko_mock(500, "").await;
    let exchangerate =
        test_utils::create_exchangerate_mock(200, test_utils::EXCHANGERATE_OK).await;
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let config_path = write_config(temp_dir.path(), &coingecko.uri(), &exchangerate.uri());

    let result = ratevault::run_command(
        ratevault::AppCommand::Update { scope: Scope::All },
        Some(&config_path),
    )
    .await;
    assert!(result.is_ok(), "Update failed with: {:?}", result.err());
    assert_eq!(cached_pairs(temp_dir.path()), vec!["USD_EUR", "USD_GBP"]);

    let missing = ratevault::run_command(
        ratevault::AppCommand::Rate {
            from: "BTC".to_string(),
            to: "USD".to_string(),
        },
        Some(&config_path),
    )
    .await;
    assert!(missing.is_err());
}

#[test_log::test(tokio::test)]
async fn test_total_outage_fails_the_update() {
    let coingecko = test_utils::create_coingecko_mock(503, "").await;
    let exchangerate = test_utils::create_exchangerate_mock(500, "").await;
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let config_path = write_config(temp_dir.path(), &coingecko.uri(), &exchangerate.uri());

    let result = ratevault::run_command(
        ratevault::AppCommand::Update { scope: Scope::All },
        Some(&config_path),
    )
    .await;
    let err = result.expect_err("Update with every provider down should fail");
    info!("Update failed as expected: {err}");
    assert!(err.to_string().contains("no rates were accepted"));
}

#[test_log::test(tokio::test)]
async fn test_service_serves_offline_fiat_without_key() {
    let coingecko = test_utils::create_coingecko_mock(200, test_utils::COINGECKO_OK).await;
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");

    let mut config = AppConfig {
        fiat_currencies: vec!["EUR".to_string(), "CHF".to_string()],
        crypto_currencies: vec!["BTC".to_string()],
        data_path: Some(temp_dir.path().to_string_lossy().into_owned()),
        ..AppConfig::default()
    };
    config.providers.coingecko.base_url = coingecko.uri();
    config.providers.coingecko.min_request_interval_ms = 0;
    // Never contacted: there is no key
    config.providers.exchangerate.base_url = "http://127.0.0.1:9".to_string();
    config.providers.exchangerate.api_key = None;

    let service = RateService::open(&config).expect("Failed to open service");
    let TriggerOutcome::Completed(cycle) = service.refresh_now(Scope::All).await else {
        panic!("No other cycle should be running");
    };
    assert!(cycle.is_partial(), "{cycle:?}");
    assert_eq!(cycle.accepted.len(), 2);
    assert_eq!(cycle.failed.len(), 1);
    assert_eq!(cycle.failed[0].pair.quote(), "CHF");

    let eur = service.current_rate("USD", "EUR").await.expect("USD/EUR");
    assert_eq!(eur.rate, 0.92);
    assert_eq!(eur.source(), Some(RateSource::ExchangeRateApiOffline));
    assert!(!eur.stale);

    let cross = service.current_rate("EUR", "BTC").await.expect("EUR/BTC");
    assert!(matches!(cross.derivation, Derivation::Cross { .. }));
    assert!((cross.rate - 1.0 / (65000.0 * 0.92)).abs() < 1e-12);

    assert!(matches!(
        service.current_rate("USD", "CHF").await,
        Err(LookupError::NotFound(_))
    ));

    let status = service.status().await.expect("status");
    assert_eq!(status.cache_total, 2);
    assert_eq!(status.history_len, 2);
}
