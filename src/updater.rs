use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::core::config::AppConfig;
use crate::core::{
    CurrencyPair, ErrorKind, PairFailure, ProviderError, ProviderKind, RateProvider, RateRecord,
};
use crate::store::{HistoryStore, RateCache};

/// Which pairs a refresh cycle targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    #[default]
    All,
    CryptoOnly,
    FiatOnly,
}

impl Scope {
    pub fn includes(&self, kind: ProviderKind) -> bool {
        match self {
            Scope::All => true,
            Scope::CryptoOnly => kind == ProviderKind::Crypto,
            Scope::FiatOnly => kind == ProviderKind::Fiat,
        }
    }
}

impl Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::All => write!(f, "all"),
            Scope::CryptoOnly => write!(f, "crypto"),
            Scope::FiatOnly => write!(f, "fiat"),
        }
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(Scope::All),
            "crypto" | "crypto-only" => Ok(Scope::CryptoOnly),
            "fiat" | "fiat-only" => Ok(Scope::FiatOnly),
            other => Err(format!("unknown scope '{other}', expected all, crypto or fiat")),
        }
    }
}

/// The configured pairs, split by the provider family that quotes them.
/// Crypto pairs are `(CRYPTO, BASE)`, fiat pairs `(BASE, FIAT)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PairUniverse {
    pub crypto: Vec<CurrencyPair>,
    pub fiat: Vec<CurrencyPair>,
}

impl PairUniverse {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let base = config.base_currency.trim();
        let build = |codes: &[String], crypto: bool| -> Result<Vec<CurrencyPair>> {
            let mut pairs = Vec::new();
            for code in codes {
                if code.trim().eq_ignore_ascii_case(base) {
                    warn!(code = %code, "Skipping currency equal to the base currency");
                    continue;
                }
                let pair = if crypto {
                    CurrencyPair::new(code, base)
                } else {
                    CurrencyPair::new(base, code)
                }
                .with_context(|| format!("Invalid currency in config: {code}"))?;
                if !pairs.contains(&pair) {
                    pairs.push(pair);
                }
            }
            Ok(pairs)
        };

        Ok(PairUniverse {
            crypto: build(&config.crypto_currencies, true)?,
            fiat: build(&config.fiat_currencies, false)?,
        })
    }

    pub fn pairs_for(&self, kind: ProviderKind) -> &[CurrencyPair] {
        match kind {
            ProviderKind::Crypto => &self.crypto,
            ProviderKind::Fiat => &self.fiat,
        }
    }

    pub fn len(&self) -> usize {
        self.crypto.len() + self.fiat.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Which durable store rejected a cycle's write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Cache,
    History,
}

impl Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreKind::Cache => write!(f, "cache"),
            StoreKind::History => write!(f, "history"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorageFailure {
    pub store: StoreKind,
    pub message: String,
}

/// Everything one refresh cycle did. Never persisted.
#[derive(Debug, Clone)]
pub struct CycleResult {
    pub scope: Scope,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub accepted: Vec<RateRecord>,
    pub failed: Vec<PairFailure>,
    pub storage_errors: Vec<StorageFailure>,
    /// Set when the cycle died before finishing, e.g. a panic inside a provider.
    pub fault: Option<String>,
}

impl CycleResult {
    pub fn aborted(scope: Scope, started_at: DateTime<Utc>, fault: String) -> Self {
        CycleResult {
            scope,
            started_at,
            finished_at: Utc::now(),
            accepted: Vec::new(),
            failed: Vec::new(),
            storage_errors: Vec::new(),
            fault: Some(fault),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.storage_errors.is_empty() && self.fault.is_none()
    }

    /// Some pairs made it, some didn't.
    pub fn is_partial(&self) -> bool {
        !self.accepted.is_empty() && !self.is_success()
    }

    /// `(pair, kind)` for every pair that failed.
    pub fn failures(&self) -> impl Iterator<Item = (&CurrencyPair, ErrorKind)> {
        self.failed.iter().map(|f| (&f.pair, f.kind()))
    }

    pub fn summary(&self) -> CycleSummary {
        CycleSummary {
            scope: self.scope,
            started_at: self.started_at,
            finished_at: self.finished_at,
            accepted: self.accepted.len(),
            failed: self.failed.len(),
            storage_errors: self.storage_errors.len(),
            fault: self.fault.clone(),
        }
    }
}

/// Counts-only view of a [`CycleResult`], kept around for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleSummary {
    pub scope: Scope,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub accepted: usize,
    pub failed: usize,
    pub storage_errors: usize,
    pub fault: Option<String>,
}

impl Display for CycleSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let elapsed = (self.finished_at - self.started_at).num_milliseconds();
        write!(
            f,
            "scope={} accepted={} failed={} storage_errors={} in {}ms",
            self.scope, self.accepted, self.failed, self.storage_errors, elapsed
        )?;
        if let Some(fault) = &self.fault {
            write!(f, " fault: {fault}")?;
        }
        Ok(())
    }
}

/// Runs one refresh cycle: fetch from every provider in scope, then write
/// the accepted records to the cache and the history log.
pub struct Updater {
    providers: Vec<Arc<dyn RateProvider>>,
    universe: PairUniverse,
    cache: Arc<RateCache>,
    history: Arc<HistoryStore>,
}

impl Updater {
    pub fn new(
        providers: Vec<Arc<dyn RateProvider>>,
        universe: PairUniverse,
        cache: Arc<RateCache>,
        history: Arc<HistoryStore>,
    ) -> Self {
        Updater {
            providers,
            universe,
            cache,
            history,
        }
    }

    pub fn cache(&self) -> &Arc<RateCache> {
        &self.cache
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    pub fn universe(&self) -> &PairUniverse {
        &self.universe
    }

    /// Never fails: provider errors land in `failed`, store errors in
    /// `storage_errors`.
    pub async fn run_cycle(&self, scope: Scope) -> CycleResult {
        let started_at = Utc::now();
        debug!(%scope, "Starting refresh cycle");

        let fetches = self
            .providers
            .iter()
            .filter(|provider| scope.includes(provider.kind()))
            .filter_map(|provider| {
                let pairs = self.universe.pairs_for(provider.kind());
                (!pairs.is_empty()).then(|| async move {
                    let outcome = provider.fetch(pairs).await;
                    debug!(
                        provider = provider.name(),
                        accepted = outcome.accepted.len(),
                        failed = outcome.failed.len(),
                        "Provider fetch finished"
                    );
                    outcome
                })
            });

        let mut accepted = Vec::new();
        let mut failed = Vec::new();
        for kind in [ProviderKind::Crypto, ProviderKind::Fiat] {
            if scope.includes(kind) && !self.providers.iter().any(|p| p.kind() == kind) {
                let error = ProviderError::NoProvider(kind);
                failed.extend(
                    self.universe
                        .pairs_for(kind)
                        .iter()
                        .map(|pair| PairFailure::new(pair.clone(), error.clone())),
                );
            }
        }
        for outcome in join_all(fetches).await {
            accepted.extend(outcome.accepted);
            failed.extend(outcome.failed);
        }

        let mut storage_errors = Vec::new();
        if !accepted.is_empty() {
            if let Err(e) = self.cache.put(&accepted).await {
                error!(error = ?e, "Failed to write rate cache");
                storage_errors.push(StorageFailure {
                    store: StoreKind::Cache,
                    message: format!("{e:#}"),
                });
            }
            if let Err(e) = self.history.append(&accepted).await {
                error!(error = ?e, "Failed to append rate history");
                storage_errors.push(StorageFailure {
                    store: StoreKind::History,
                    message: format!("{e:#}"),
                });
            }
        }

        for failure in &failed {
            warn!(pair = %failure.pair, kind = ?failure.kind(), error = %failure.error, "Pair not refreshed");
        }

        let result = CycleResult {
            scope,
            started_at,
            finished_at: Utc::now(),
            accepted,
            failed,
            storage_errors,
            fault: None,
        };
        info!("Refresh cycle finished: {}", result.summary());
        result
    }
}
