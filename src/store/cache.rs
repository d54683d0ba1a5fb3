use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::core::{CurrencyPair, LookupError, RateRecord, RateSource};

/// A cached record plus its freshness at read time.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub record: RateRecord,
    pub stale: bool,
}

impl CacheEntry {
    pub fn at(record: RateRecord, ttl: Duration, now: DateTime<Utc>) -> Self {
        let stale = record.is_stale_at(ttl, now);
        Self { record, stale }
    }
}

/// Immutable view of the cache. Writers build a new one and swap it in, so
/// a reader holding a snapshot never sees a half-applied update.
#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    rates: BTreeMap<CurrencyPair, RateRecord>,
    last_refresh: Option<DateTime<Utc>>,
}

impl CacheSnapshot {
    pub fn get(&self, pair: &CurrencyPair) -> Option<&RateRecord> {
        self.rates.get(pair)
    }

    pub fn records(&self) -> impl Iterator<Item = &RateRecord> {
        self.rates.values()
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.last_refresh
    }
}

/// On-disk layout: `{ "last_refresh": ..., "rates": { "BTC_USD": {...} } }`.
#[derive(Serialize, Deserialize)]
struct CacheFile {
    last_refresh: Option<DateTime<Utc>>,
    rates: BTreeMap<String, CacheFileEntry>,
}

#[derive(Serialize, Deserialize)]
struct CacheFileEntry {
    rate: f64,
    source: RateSource,
    fetched_at: DateTime<Utc>,
}

impl From<&CacheSnapshot> for CacheFile {
    fn from(snapshot: &CacheSnapshot) -> Self {
        CacheFile {
            last_refresh: snapshot.last_refresh,
            rates: snapshot
                .rates
                .iter()
                .map(|(pair, record)| {
                    (
                        pair.storage_key(),
                        CacheFileEntry {
                            rate: record.rate(),
                            source: record.source(),
                            fetched_at: record.fetched_at(),
                        },
                    )
                })
                .collect(),
        }
    }
}

impl TryFrom<CacheFile> for CacheSnapshot {
    type Error = anyhow::Error;

    fn try_from(file: CacheFile) -> Result<Self> {
        let mut rates = BTreeMap::new();
        for (key, entry) in file.rates {
            let pair: CurrencyPair = key.parse()?;
            let record = RateRecord::new(pair.clone(), entry.rate, entry.source, entry.fetched_at)?;
            rates.insert(pair, record);
        }
        Ok(CacheSnapshot {
            rates,
            last_refresh: file.last_refresh,
        })
    }
}

/// Latest rate per pair, in memory and mirrored to a JSON file.
///
/// Staleness never evicts: `get` and `snapshot` keep returning the last
/// value forever, `get_fresh` is where the TTL is applied.
pub struct RateCache {
    path: PathBuf,
    state: RwLock<Arc<CacheSnapshot>>,
    writer: Mutex<()>,
}

impl RateCache {
    /// Opens the cache, loading `path` if it exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read rate cache: {}", path.display()))?;
            let file: CacheFile = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse rate cache: {}", path.display()))?;
            CacheSnapshot::try_from(file)
                .with_context(|| format!("Invalid record in rate cache: {}", path.display()))?
        } else {
            CacheSnapshot::default()
        };
        info!(path = %path.display(), rates = snapshot.len(), "Opened rate cache");

        Ok(Self {
            path,
            state: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn snapshot(&self) -> Arc<CacheSnapshot> {
        Arc::clone(&*self.state.read().await)
    }

    pub async fn get(&self, pair: &CurrencyPair) -> Result<RateRecord, LookupError> {
        let snapshot = self.snapshot().await;
        match snapshot.get(pair) {
            Some(record) => {
                debug!("Cache HIT for pair: {}", pair);
                Ok(record.clone())
            }
            None => {
                debug!("Cache MISS for pair: {}", pair);
                Err(LookupError::NotFound(pair.clone()))
            }
        }
    }

    pub async fn get_fresh(&self, pair: &CurrencyPair, ttl: Duration) -> Result<RateRecord, LookupError> {
        self.get_fresh_at(pair, ttl, Utc::now()).await
    }

    pub async fn get_fresh_at(
        &self,
        pair: &CurrencyPair,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<RateRecord, LookupError> {
        let record = self.get(pair).await?;
        if record.is_stale_at(ttl, now) {
            debug!("Cache entry stale for pair: {}", pair);
            return Err(LookupError::Stale {
                age: record.age_at(now),
                record,
            });
        }
        Ok(record)
    }

    /// All current records, ordered by pair.
    pub async fn records(&self) -> Vec<RateRecord> {
        self.snapshot().await.records().cloned().collect()
    }

    pub async fn entries_at(&self, ttl: Duration, now: DateTime<Utc>) -> Vec<CacheEntry> {
        self.snapshot()
            .await
            .records()
            .map(|record| CacheEntry::at(record.clone(), ttl, now))
            .collect()
    }

    /// Replaces the entries for every pair in `records`, leaving other pairs
    /// untouched. The new contents are durable before they become visible;
    /// if the write fails, neither memory nor disk changes.
    pub async fn put(&self, records: &[RateRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let _writer = self.writer.lock().await;

        let mut next = (**self.state.read().await).clone();
        for record in records {
            next.rates.insert(record.pair().clone(), record.clone());
        }
        next.last_refresh = Some(Utc::now());
        let next = Arc::new(next);

        let path = self.path.clone();
        let to_write = Arc::clone(&next);
        tokio::task::spawn_blocking(move || write_atomically(&path, &to_write))
            .await
            .context("Rate cache write task failed")??;

        *self.state.write().await = next;
        debug!("Cache PUT of {} records", records.len());
        Ok(())
    }
}

/// Writes to a temp file in the same directory, syncs it, then renames it
/// over `path`. A crash at any point leaves either the old or the new file.
fn write_atomically(path: &Path, snapshot: &CacheSnapshot) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

    let contents = serde_json::to_vec_pretty(&CacheFile::from(snapshot))?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".rates-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(&contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to replace rate cache: {}", path.display()))?;

    #[cfg(unix)]
    std::fs::File::open(dir)?.sync_all()?;

    Ok(())
}
