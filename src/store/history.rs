use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::{CurrencyPair, RateRecord};

const RECORDS_PARTITION: &str = "rate_history";
const META_PARTITION: &str = "rate_history_meta";
const NEXT_SEQ_KEY: &str = "next_seq";

/// Optional constraints for [`HistoryStore::query`]. Time bounds are
/// inclusive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryFilter {
    pub pair: Option<CurrencyPair>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl HistoryFilter {
    pub fn for_pair(pair: CurrencyPair) -> Self {
        Self {
            pair: Some(pair),
            ..Self::default()
        }
    }
}

/// Keys sort by `(fetched_at, seq)`: the timestamp in microseconds with the
/// sign bit flipped so negative values order correctly, then the append
/// sequence number, both big-endian.
fn record_key(fetched_at: DateTime<Utc>, seq: u64) -> Vec<u8> {
    let micros = (fetched_at.timestamp_micros() as u64) ^ (1 << 63);
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&micros.to_be_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn key_range(filter: &HistoryFilter) -> std::ops::RangeInclusive<Vec<u8>> {
    let lower = record_key(filter.since.unwrap_or(DateTime::<Utc>::MIN_UTC), 0);
    let upper = record_key(filter.until.unwrap_or(DateTime::<Utc>::MAX_UTC), u64::MAX);
    lower..=upper
}

fn decode_entry<K, V: AsRef<[u8]>>(item: fjall::Result<(K, V)>) -> Option<RateRecord> {
    let (_key, value) = item
        .map_err(|e| warn!(error = %e, "Failed to read history entry"))
        .ok()?;
    serde_json::from_slice::<RateRecord>(value.as_ref())
        .map_err(|e| warn!(error = %e, "Skipping malformed history entry"))
        .ok()
}

/// Append-only log of every accepted record, stored in a fjall keyspace.
///
/// Each append is one atomic batch synced to disk before returning. The
/// keyspace journal drops a torn trailing batch on recovery, so a crash can
/// lose at most the append in flight.
pub struct HistoryStore {
    keyspace: Keyspace,
    records: PartitionHandle,
    meta: PartitionHandle,
    next_seq: Arc<AtomicU64>,
    writer: Mutex<()>,
}

impl HistoryStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create history directory: {}", path.display()))?;
        let keyspace = fjall::Config::new(path)
            .open()
            .with_context(|| format!("Failed to open history store: {}", path.display()))?;
        let records = keyspace.open_partition(RECORDS_PARTITION, PartitionCreateOptions::default())?;
        let meta = keyspace.open_partition(META_PARTITION, PartitionCreateOptions::default())?;

        let next_seq = match meta.get(NEXT_SEQ_KEY)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .context("Corrupt history sequence counter")?;
                u64::from_be_bytes(raw)
            }
            None => 0,
        };
        info!(path = %path.display(), next_seq, "Opened history store");

        Ok(Self {
            keyspace,
            records,
            meta,
            next_seq: Arc::new(AtomicU64::new(next_seq)),
            writer: Mutex::new(()),
        })
    }

    /// Appends `records` as one batch. Records from concurrent callers are
    /// never interleaved.
    pub async fn append(&self, records: &[RateRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let _writer = self.writer.lock().await;

        let mut encoded = Vec::with_capacity(records.len());
        for record in records {
            encoded.push((record.fetched_at(), serde_json::to_vec(record)?));
        }

        let keyspace = self.keyspace.clone();
        let partition = self.records.clone();
        let meta = self.meta.clone();
        let next_seq = Arc::clone(&self.next_seq);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut seq = next_seq.load(Ordering::SeqCst);
            let mut batch = keyspace.batch();
            for (fetched_at, value) in encoded {
                batch.insert(&partition, record_key(fetched_at, seq), value);
                seq += 1;
            }
            batch.insert(&meta, NEXT_SEQ_KEY, seq.to_be_bytes().to_vec());
            batch.commit()?;
            keyspace.persist(PersistMode::SyncAll)?;
            next_seq.store(seq, Ordering::SeqCst);
            Ok(())
        })
        .await
        .context("History append task failed")?
        .context("Failed to append to history store")?;

        debug!("Appended {} records to history", records.len());
        Ok(())
    }

    /// Lazily yields matching records ordered by `fetched_at`, ties in
    /// append order. Entries that fail to decode are skipped with a warning.
    pub fn query(&self, filter: &HistoryFilter) -> impl Iterator<Item = RateRecord> + '_ {
        let pair = filter.pair.clone();
        self.records
            .range(key_range(filter))
            .filter_map(decode_entry)
            .filter(move |record| pair.as_ref().is_none_or(|p| record.pair() == p))
    }

    /// The last `limit` matching records, oldest first. Scans backwards from
    /// the newest key, so only the tail of the log is read.
    pub fn latest(&self, filter: &HistoryFilter, limit: usize) -> Vec<RateRecord> {
        let pair = filter.pair.clone();
        let mut records: Vec<RateRecord> = self
            .records
            .range(key_range(filter))
            .rev()
            .filter_map(decode_entry)
            .filter(|record| pair.as_ref().is_none_or(|p| record.pair() == p))
            .take(limit)
            .collect();
        records.reverse();
        records
    }

    /// Number of records appended over the store's lifetime, read from the
    /// sequence counter rather than a partition scan.
    pub fn len(&self) -> usize {
        self.next_seq.load(Ordering::SeqCst) as usize
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.records.is_empty()?)
    }

    #[cfg(test)]
    fn insert_raw(&self, fetched_at: DateTime<Utc>, value: &[u8]) -> Result<()> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.records.insert(record_key(fetched_at, seq), value.to_vec())?;
        Ok(())
    }
}
