pub mod coingecko;
pub mod exchangerate;
pub mod http;
pub mod offline;
pub mod retry;

use anyhow::Result;
use std::sync::Arc;

use crate::core::RateProvider;
use crate::core::config::AppConfig;
use coingecko::CoinGeckoProvider;
use exchangerate::ExchangeRateProvider;

/// Builds one provider per family from the configuration.
pub fn build_providers(config: &AppConfig) -> Result<Vec<Arc<dyn RateProvider>>> {
    let crypto = CoinGeckoProvider::new(&config.providers.coingecko, &config.crypto_ids)?;
    let fiat = ExchangeRateProvider::new(&config.providers.exchangerate)?;
    Ok(vec![Arc::new(crypto), Arc::new(fiat)])
}
