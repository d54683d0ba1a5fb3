use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::{fs, path::PathBuf, time::Duration};
use tracing::debug;

use crate::providers::retry::RetryPolicy;

// Largest TTL chrono can represent in milliseconds
const MAX_TTL_SECS: u64 = (i64::MAX / 1000) as u64;

/// Environment variable consulted when the fiat provider has no `api_key`.
pub const EXCHANGERATE_API_KEY_ENV: &str = "EXCHANGERATE_API_KEY";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub min_request_interval_ms: u64,
    pub retry: RetryPolicy,
}

impl ProviderConfig {
    fn with_base_url(base_url: &str) -> Self {
        ProviderConfig {
            base_url: base_url.to_string(),
            api_key: None,
            timeout_secs: 10,
            min_request_interval_ms: 1000,
            retry: RetryPolicy::default(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval_ms)
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self::with_base_url("")
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ProvidersConfig {
    pub coingecko: ProviderConfig,
    pub exchangerate: ProviderConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        ProvidersConfig {
            coingecko: ProviderConfig::with_base_url("https://api.coingecko.com/api/v3"),
            exchangerate: ProviderConfig::with_base_url("https://v6.exchangerate-api.com/v6"),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub base_currency: String,
    pub fiat_currencies: Vec<String>,
    pub crypto_currencies: Vec<String>,
    /// Crypto code to CoinGecko coin id.
    pub crypto_ids: BTreeMap<String, String>,
    pub refresh_interval_secs: u64,
    pub ttl_secs: u64,
    pub data_path: Option<String>,
    pub providers: ProvidersConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            base_currency: "USD".to_string(),
            fiat_currencies: ["EUR", "GBP", "RUB"].map(String::from).to_vec(),
            crypto_currencies: ["BTC", "ETH", "SOL"].map(String::from).to_vec(),
            crypto_ids: [("BTC", "bitcoin"), ("ETH", "ethereum"), ("SOL", "solana")]
                .into_iter()
                .map(|(code, id)| (code.to_string(), id.to_string()))
                .collect(),
            refresh_interval_secs: 300,
            ttl_secs: 300,
            data_path: None,
            providers: ProvidersConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        debug!("Loading default config");
        let config_path = Self::default_config_path()?;
        Self::load_from_path(&config_path)
    }

    pub fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("io", "ratevault", "ratevault")
            .context("Could not determine project directories")?;
        Ok(proj_dirs.config_dir().join("config.yaml"))
    }

    pub fn default_data_path(&self) -> Result<PathBuf> {
        if let Some(custom_path) = &self.data_path {
            return Ok(PathBuf::from(custom_path));
        }
        let proj_dirs = ProjectDirs::from("io", "ratevault", "ratevault")
            .context("Could not determine project directories")?;
        Ok(proj_dirs.data_dir().to_path_buf())
    }

    pub fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let config_str = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let mut config: Self = serde_yaml::from_str(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;
        config.apply_env_overrides(std::env::var(EXCHANGERATE_API_KEY_ENV).ok());
        config.validate()?;
        debug!("Successfully loaded config");
        Ok(config)
    }

    /// Fills the fiat provider key from the environment when the file has none.
    pub fn apply_env_overrides(&mut self, exchangerate_key: Option<String>) {
        let key = &mut self.providers.exchangerate.api_key;
        if key.as_deref().is_none_or(|k| k.trim().is_empty()) {
            *key = exchangerate_key.filter(|k| !k.trim().is_empty());
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_currency.trim().is_empty() {
            anyhow::bail!("base_currency must not be empty");
        }
        if self.refresh_interval_secs == 0 {
            anyhow::bail!("refresh_interval_secs must be greater than zero");
        }
        if self.ttl_secs == 0 || self.ttl_secs > MAX_TTL_SECS {
            anyhow::bail!("ttl_secs must be between 1 and {MAX_TTL_SECS}");
        }
        if self.fiat_currencies.is_empty() && self.crypto_currencies.is_empty() {
            anyhow::bail!("At least one fiat or crypto currency must be configured");
        }
        for code in &self.crypto_currencies {
            if !self.crypto_ids.contains_key(&code.to_ascii_uppercase()) {
                tracing::warn!(code = %code, "No CoinGecko id configured, pair will fail");
            }
        }
        Ok(())
    }

    pub fn ttl(&self) -> Result<chrono::Duration> {
        i64::try_from(self.ttl_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .with_context(|| format!("ttl_secs out of range: {}", self.ttl_secs))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}
