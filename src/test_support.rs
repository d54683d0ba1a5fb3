//! Scriptable providers and store fixtures shared by unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::core::{
    CurrencyPair, FetchOutcome, PairFailure, ProviderError, ProviderKind, RateProvider,
    RateRecord, RateSource,
};
use crate::store::{HistoryStore, RateCache};

/// A provider whose answers are set by the test. Pairs with neither a rate
/// nor a failure come back as `UnknownSymbol`.
pub(crate) struct ScriptedProvider {
    kind: ProviderKind,
    rates: Mutex<HashMap<CurrencyPair, f64>>,
    failures: Mutex<HashMap<CurrencyPair, ProviderError>>,
    fetched_at: Mutex<Option<DateTime<Utc>>>,
    outage: Mutex<Option<ProviderError>>,
    delay: Duration,
    panics: bool,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub(crate) fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            rates: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            fetched_at: Mutex::new(None),
            outage: Mutex::new(None),
            delay: Duration::ZERO,
            panics: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_rate(self, base: &str, quote: &str, rate: f64) -> Self {
        self.set_rate(base, quote, rate);
        self
    }

    pub(crate) fn with_failure(self, base: &str, quote: &str, error: ProviderError) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(pair(base, quote), error);
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }

    pub(crate) fn set_rate(&self, base: &str, quote: &str, rate: f64) {
        self.rates.lock().unwrap().insert(pair(base, quote), rate);
    }

    /// Pins `fetched_at` for every record produced from now on.
    pub(crate) fn set_fetched_at(&self, at: DateTime<Utc>) {
        *self.fetched_at.lock().unwrap() = Some(at);
    }

    /// Fails every pair with `error` until cleared, as an outage would.
    pub(crate) fn set_outage(&self, error: Option<ProviderError>) {
        *self.outage.lock().unwrap() = error;
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub(crate) fn pair(base: &str, quote: &str) -> CurrencyPair {
    CurrencyPair::new(base, quote).unwrap()
}

#[async_trait]
impl RateProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn fetch(&self, pairs: &[CurrencyPair]) -> FetchOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.panics {
            panic!("scripted provider fault");
        }

        if let Some(error) = self.outage.lock().unwrap().clone() {
            return FetchOutcome::all_failed(pairs, &error);
        }

        let source = match self.kind {
            ProviderKind::Crypto => RateSource::CoinGecko,
            ProviderKind::Fiat => RateSource::ExchangeRateApi,
        };
        let fetched_at = self.fetched_at.lock().unwrap().unwrap_or_else(Utc::now);
        let rates = self.rates.lock().unwrap().clone();
        let failures = self.failures.lock().unwrap().clone();

        let mut outcome = FetchOutcome::default();
        for pair in pairs {
            if let Some(rate) = rates.get(pair) {
                outcome
                    .accepted
                    .push(RateRecord::new(pair.clone(), *rate, source, fetched_at).unwrap());
            } else {
                let error = failures
                    .get(pair)
                    .cloned()
                    .unwrap_or_else(|| ProviderError::UnknownSymbol(pair.to_string()));
                outcome.failed.push(PairFailure::new(pair.clone(), error));
            }
        }
        outcome
    }
}

pub(crate) fn open_stores(dir: &Path) -> (Arc<RateCache>, Arc<HistoryStore>) {
    let cache = RateCache::open(dir.join("rates.json")).unwrap();
    let history = HistoryStore::open(dir.join("history")).unwrap();
    (Arc::new(cache), Arc::new(history))
}
