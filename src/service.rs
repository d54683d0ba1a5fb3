//! Consumer-facing read and trigger API over the stores and the scheduler.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::config::AppConfig;
use crate::core::{CurrencyPair, LookupError, ProviderKind, RateRecord, RateSource};
use crate::providers::build_providers;
use crate::scheduler::{Scheduler, SchedulerStatus, TriggerOutcome};
use crate::store::{CacheEntry, CacheSnapshot, HistoryFilter, HistoryStore, RateCache};
use crate::updater::{PairUniverse, Scope, Updater};

const CACHE_FILE: &str = "rates.json";
const HISTORY_DIR: &str = "history";

/// How a quoted rate was obtained from the cached records.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Derivation {
    Direct,
    /// `1 / rate` of the opposite pair.
    Inverse,
    /// Product of two legs through `via`.
    Cross { via: String },
}

/// Answer to a current-rate lookup. Stale answers are still answers; the
/// caller decides whether to use them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateQuote {
    pub pair: CurrencyPair,
    pub rate: f64,
    /// Oldest `fetched_at` among the records used.
    pub fetched_at: DateTime<Utc>,
    pub stale: bool,
    pub derivation: Derivation,
    pub legs: Vec<RateRecord>,
}

impl RateQuote {
    pub fn source(&self) -> Option<RateSource> {
        self.legs.first().map(RateRecord::source)
    }

    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        now - self.fetched_at
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateFilter {
    /// Matches pairs with this code on either side.
    pub currency: Option<String>,
    pub kind: Option<ProviderKind>,
    /// Keep only the N highest rates.
    pub top: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub cache_total: usize,
    pub cache_fresh: usize,
    pub cache_stale: usize,
    pub last_refresh: Option<DateTime<Utc>>,
    pub history_len: usize,
    pub ttl_secs: i64,
    pub scheduler: SchedulerStatus,
}

pub struct RateService {
    cache: Arc<RateCache>,
    history: Arc<HistoryStore>,
    scheduler: Scheduler,
    ttl: Duration,
    base_currency: String,
}

impl RateService {
    /// Opens the stores under the configured data directory and wires up
    /// the live providers.
    pub fn open(config: &AppConfig) -> Result<Self> {
        config.validate()?;
        let data_dir = config.default_data_path()?;
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;
        debug!(path = %data_dir.display(), "Using data directory");

        let cache = Arc::new(RateCache::open(data_dir.join(CACHE_FILE))?);
        let history = Arc::new(HistoryStore::open(data_dir.join(HISTORY_DIR))?);
        let updater = Updater::new(
            build_providers(config)?,
            PairUniverse::from_config(config)?,
            cache,
            history,
        );
        Ok(Self::from_parts(
            Arc::new(updater),
            config.ttl()?,
            &config.base_currency,
        ))
    }

    pub fn from_parts(updater: Arc<Updater>, ttl: Duration, base_currency: &str) -> Self {
        RateService {
            cache: Arc::clone(updater.cache()),
            history: Arc::clone(updater.history()),
            scheduler: Scheduler::new(updater),
            ttl,
            base_currency: base_currency.trim().to_ascii_uppercase(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn current_rate(&self, base: &str, quote: &str) -> Result<RateQuote, LookupError> {
        self.current_rate_at(base, quote, Utc::now()).await
    }

    /// Direct record first, then the inverse pair, then a cross through the
    /// base currency. `NotFound` only when none of those exist.
    pub async fn current_rate_at(
        &self,
        base: &str,
        quote: &str,
        now: DateTime<Utc>,
    ) -> Result<RateQuote, LookupError> {
        let pair = CurrencyPair::new(base, quote)?;
        let snapshot = self.cache.snapshot().await;

        let (rate, derivation, legs) = if let Some(record) = snapshot.get(&pair) {
            (record.rate(), Derivation::Direct, vec![record.clone()])
        } else if let Some(record) = snapshot.get(&pair.inverse()) {
            (1.0 / record.rate(), Derivation::Inverse, vec![record.clone()])
        } else {
            self.cross(&snapshot, &pair)
                .ok_or_else(|| LookupError::NotFound(pair.clone()))?
        };
        // Inverting or multiplying extreme magnitudes can leave the f64 range
        if !rate.is_finite() || rate <= 0.0 {
            debug!(%pair, rate, ?derivation, "Derived rate out of range");
            return Err(LookupError::NotFound(pair));
        }

        let fetched_at = legs
            .iter()
            .map(RateRecord::fetched_at)
            .min()
            .unwrap_or(now);
        let stale = legs.iter().any(|leg| leg.is_stale_at(self.ttl, now));
        debug!(%pair, rate, ?derivation, stale, "Resolved rate");

        Ok(RateQuote {
            pair,
            rate,
            fetched_at,
            stale,
            derivation,
            legs,
        })
    }

    fn cross(
        &self,
        snapshot: &CacheSnapshot,
        pair: &CurrencyPair,
    ) -> Option<(f64, Derivation, Vec<RateRecord>)> {
        let via = self.base_currency.as_str();
        if pair.involves(via) {
            return None;
        }
        let (first_rate, first) = leg(snapshot, pair.base(), via)?;
        let (second_rate, second) = leg(snapshot, via, pair.quote())?;
        Some((
            first_rate * second_rate,
            Derivation::Cross {
                via: via.to_string(),
            },
            vec![first, second],
        ))
    }

    /// Current records with their staleness, filtered. With `top`, sorted by
    /// rate descending; otherwise in pair order.
    pub async fn list_rates(&self, filter: &RateFilter) -> Vec<CacheEntry> {
        self.list_rates_at(filter, Utc::now()).await
    }

    pub async fn list_rates_at(&self, filter: &RateFilter, now: DateTime<Utc>) -> Vec<CacheEntry> {
        let currency = filter
            .currency
            .as_deref()
            .map(|code| code.trim().to_ascii_uppercase());
        let mut entries: Vec<CacheEntry> = self
            .cache
            .entries_at(self.ttl, now)
            .await
            .into_iter()
            .filter(|entry| {
                currency
                    .as_deref()
                    .is_none_or(|code| entry.record.pair().involves(code))
            })
            .filter(|entry| {
                filter
                    .kind
                    .is_none_or(|kind| entry.record.source().provider_kind() == kind)
            })
            .collect();

        if let Some(top) = filter.top {
            entries.sort_by(|a, b| b.record.rate().total_cmp(&a.record.rate()));
            entries.truncate(top);
        }
        entries
    }

    pub fn historical_rates(&self, filter: &HistoryFilter) -> impl Iterator<Item = RateRecord> + '_ {
        self.history.query(filter)
    }

    /// The most recent `limit` matching records, oldest first.
    pub fn recent_history(&self, filter: &HistoryFilter, limit: usize) -> Vec<RateRecord> {
        self.history.latest(filter, limit)
    }

    /// Synchronous manual refresh through the scheduler's single cycle slot.
    pub async fn refresh_now(&self, scope: Scope) -> TriggerOutcome {
        self.scheduler.trigger_now(scope).await
    }

    pub async fn start_auto_refresh(&self, interval_secs: u64) -> Result<bool> {
        self.scheduler
            .start(std::time::Duration::from_secs(interval_secs))
            .await
    }

    pub async fn stop_auto_refresh(&self) -> bool {
        let stopped = self.scheduler.stop().await;
        if stopped {
            info!("Auto refresh stopped");
        }
        stopped
    }

    /// Waits for an in-flight cycle, if any, to finish.
    pub async fn wait_idle(&self) {
        self.scheduler.wait_idle().await
    }

    pub async fn status(&self) -> Result<ServiceStatus> {
        self.status_at(Utc::now()).await
    }

    pub async fn status_at(&self, now: DateTime<Utc>) -> Result<ServiceStatus> {
        let snapshot = self.cache.snapshot().await;
        let cache_stale = snapshot
            .records()
            .filter(|record| record.is_stale_at(self.ttl, now))
            .count();
        Ok(ServiceStatus {
            cache_total: snapshot.len(),
            cache_fresh: snapshot.len() - cache_stale,
            cache_stale,
            last_refresh: snapshot.last_refresh(),
            history_len: self.history.len(),
            ttl_secs: self.ttl.num_seconds(),
            scheduler: self.scheduler.status().await,
        })
    }
}

/// Rate for converting `from` into `to`, from the direct or inverse record.
fn leg(snapshot: &CacheSnapshot, from: &str, to: &str) -> Option<(f64, RateRecord)> {
    let pair = CurrencyPair::new(from, to).ok()?;
    if let Some(record) = snapshot.get(&pair) {
        return Some((record.rate(), record.clone()));
    }
    snapshot
        .get(&pair.inverse())
        .map(|record| (1.0 / record.rate(), record.clone()))
}
