//! Tombstone creation, migration, and garbage collection
//!
//! A tombstone stands in for a deleted row so a copy stream can tell
//! "deleted after version X" apart from "never existed". Two key
//! encodings exist. The v1 format keys a tombstone by its escaped data
//! type, a double delimiter, and the row key; cleanup must load every
//! tombstone to sort by LSN. The v2 format keys by zero-padded LSN plus
//! a per-transaction index, so key order equals non-decreasing LSN
//! order and cleanup can stream. Exactly one format is active per store
//! instance; recovery migrates rows to the configured format in bounded
//! batches.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::config::TombstoneConfig;
use crate::errors::{StoreError, StoreResult};
use crate::local_store::{LocalStore, Lsn, StoreTransaction};
use crate::metadata::{self, META_TYPE, TOMBSTONE_LOW_WATERMARK_KEY, TOMBSTONE_TYPE};
use crate::observability::Logger;

const DELIMITER: char = '|';
const DOUBLE_DELIMITER: &str = "||";

/// Value stored in every tombstone row, independent of key format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TombstoneData {
    pub data_type: String,
    pub key: String,
}

/// Highest LSN among tombstones removed by the last successful cleanup
/// pass. Copy readers below this cannot rely on tombstone presence and
/// must fall back to full copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TombstoneLowWatermarkData {
    pub lsn: Lsn,
}

/// v1 key: escaped type, double delimiter, raw key.
pub fn encode_v1_key(data_type: &str, key: &str) -> String {
    let mut out = String::with_capacity(data_type.len() + key.len() + 2);
    for c in data_type.chars() {
        if c == DELIMITER {
            out.push('\\');
        }
        out.push(c);
    }
    out.push_str(DOUBLE_DELIMITER);
    out.push_str(key);
    out
}

/// Splits a v1 key at the first unescaped double delimiter.
pub fn decode_v1_key(tombstone_key: &str) -> StoreResult<TombstoneData> {
    let bytes = tombstone_key.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            i += 2;
            continue;
        }
        if bytes[i] == b'|' && i + 1 < bytes.len() && bytes[i + 1] == b'|' {
            let escaped_type = &tombstone_key[..i];
            let key = &tombstone_key[i + 2..];
            let data_type: String = {
                let mut out = String::with_capacity(escaped_type.len());
                let mut chars = escaped_type.chars();
                while let Some(c) = chars.next() {
                    if c == '\\' {
                        if let Some(next) = chars.next() {
                            out.push(next);
                        }
                    } else {
                        out.push(c);
                    }
                }
                out
            };
            return Ok(TombstoneData {
                data_type,
                key: key.to_string(),
            });
        }
        i += 1;
    }
    Err(StoreError::InvalidOperation(format!(
        "tombstone key has no delimiter: {}",
        tombstone_key
    )))
}

/// v2 key: zero-padded LSN, dot, zero-padded per-transaction index.
pub fn encode_v2_key(lsn: Lsn, index: u32) -> String {
    format!("{:020}.{:010}", lsn, index)
}

pub fn decode_v2_key(tombstone_key: &str) -> StoreResult<(Lsn, u32)> {
    let (lsn_part, index_part) = tombstone_key.split_once('.').ok_or_else(|| {
        StoreError::InvalidOperation(format!("malformed v2 tombstone key: {}", tombstone_key))
    })?;
    let lsn = lsn_part.parse::<Lsn>().map_err(|_| {
        StoreError::InvalidOperation(format!("malformed v2 tombstone key: {}", tombstone_key))
    })?;
    let index = index_part.parse::<u32>().map_err(|_| {
        StoreError::InvalidOperation(format!("malformed v2 tombstone key: {}", tombstone_key))
    })?;
    Ok((lsn, index))
}

/// True when the key parses as the v2 format.
pub fn is_v2_key(tombstone_key: &str) -> bool {
    decode_v2_key(tombstone_key).is_ok()
}

#[derive(Debug, Default)]
struct WatermarkState {
    low_watermark: Lsn,
    active_readers: usize,
}

/// Decrements the reader count on drop.
pub struct TombstoneReaderGuard {
    manager: Arc<TombstoneManager>,
}

impl Drop for TombstoneReaderGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.manager.watermark.lock() {
            state.active_readers = state.active_readers.saturating_sub(1);
        }
    }
}

pub struct TombstoneManager {
    config: TombstoneConfig,
    /// Exact at recovery, best-effort afterwards.
    estimated_count: AtomicU64,
    cleanup_active: AtomicBool,
    watermark: Mutex<WatermarkState>,
}

impl TombstoneManager {
    pub fn new(config: TombstoneConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            estimated_count: AtomicU64::new(0),
            cleanup_active: AtomicBool::new(false),
            watermark: Mutex::new(WatermarkState::default()),
        })
    }

    pub fn estimated_count(&self) -> u64 {
        self.estimated_count.load(Ordering::SeqCst)
    }

    pub fn low_watermark(&self) -> Lsn {
        self.watermark
            .lock()
            .map(|s| s.low_watermark)
            .unwrap_or(0)
    }

    /// Marks a copy reader active. While any reader holds a guard,
    /// cleanup passes roll back instead of committing, because the reader
    /// may still need tombstones below the pass's new watermark.
    pub fn reader_guard(self: &Arc<Self>) -> StoreResult<TombstoneReaderGuard> {
        let mut state = self.lock_watermark()?;
        state.active_readers += 1;
        Ok(TombstoneReaderGuard {
            manager: Arc::clone(self),
        })
    }

    /// Full scan at open: migrates tombstones to the configured key
    /// format in bounded batches, recovers the exact count and the
    /// persisted low watermark.
    pub fn recover(&self, store: &dyn LocalStore) -> StoreResult<()> {
        let rows = {
            let tx = store.create_transaction()?;
            let rows = tx.enumerate(TOMBSTONE_TYPE, "")?;
            tx.rollback();
            rows
        };

        let mut count = 0u64;
        let mut batch: Vec<(String, String, Vec<u8>, Lsn)> = Vec::new();
        let mut next_index = 0u32;

        for row in &rows {
            let in_v2 = is_v2_key(&row.key);
            if in_v2 == self.config.use_v2_format {
                count += 1;
                continue;
            }

            let new_key = if self.config.use_v2_format {
                let key = encode_v2_key(row.lsn, next_index);
                next_index += 1;
                key
            } else {
                let data: TombstoneData = serde_json::from_slice(&row.value)
                    .map_err(|e| StoreError::serialization("decoding tombstone row", e))?;
                encode_v1_key(&data.data_type, &data.key)
            };
            // A row that sorts at or below its old key has already passed
            // the enumeration cursor and will not be visited twice.
            if new_key.as_str() <= row.key.as_str() {
                count += 1;
            }
            batch.push((row.key.clone(), new_key, row.value.clone(), row.lsn));

            if batch.len() >= self.config.migration_batch_size {
                self.apply_migration_batch(store, &mut batch)?;
            }
        }
        if !batch.is_empty() {
            self.apply_migration_batch(store, &mut batch)?;
        }

        self.estimated_count.store(count, Ordering::SeqCst);

        let tx = store.create_transaction()?;
        let watermark: Option<TombstoneLowWatermarkData> =
            metadata::read_data(tx.as_ref(), META_TYPE, TOMBSTONE_LOW_WATERMARK_KEY)?;
        tx.rollback();
        self.lock_watermark()?.low_watermark = watermark.map(|w| w.lsn).unwrap_or(0);

        Logger::info(
            "REPL_TOMBSTONE_RECOVERED",
            &[
                ("count", count.to_string().as_str()),
                ("low_watermark", self.low_watermark().to_string().as_str()),
                (
                    "format",
                    if self.config.use_v2_format { "v2" } else { "v1" },
                ),
            ],
        );
        Ok(())
    }

    fn apply_migration_batch(
        &self,
        store: &dyn LocalStore,
        batch: &mut Vec<(String, String, Vec<u8>, Lsn)>,
    ) -> StoreResult<()> {
        let mut tx = store.create_transaction()?;
        for (old_key, new_key, value, lsn) in batch.drain(..) {
            tx.delete(TOMBSTONE_TYPE, &old_key, 0)?;
            match tx.insert(TOMBSTONE_TYPE, &new_key, &value, lsn) {
                Ok(()) => {}
                // Two v1 tombstones can collapse onto one v2 slot only
                // through replays; keep the existing row.
                Err(StoreError::RecordAlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        tx.commit()
    }

    /// Writes the tombstone for one deleted row. `lsn` is the commit
    /// sequence number of the owning transaction and `index` the
    /// position of the delete within it. Returns true when a new
    /// tombstone row was created (v1 refreshes an existing one in
    /// place).
    pub fn write_tombstone(
        &self,
        tx: &mut dyn StoreTransaction,
        data_type: &str,
        key: &str,
        lsn: Lsn,
        index: u32,
    ) -> StoreResult<bool> {
        let data = TombstoneData {
            data_type: data_type.to_string(),
            key: key.to_string(),
        };
        let value = serde_json::to_vec(&data)
            .map_err(|e| StoreError::serialization("encoding tombstone row", e))?;

        if self.config.use_v2_format {
            tx.insert(TOMBSTONE_TYPE, &encode_v2_key(lsn, index), &value, lsn)?;
            return Ok(true);
        }

        let v1_key = encode_v1_key(data_type, key);
        match tx.get(TOMBSTONE_TYPE, &v1_key)? {
            None => {
                tx.insert(TOMBSTONE_TYPE, &v1_key, &value, lsn)?;
                Ok(true)
            }
            Some(existing) => {
                // LSN bumps monotonically on re-delete.
                tx.update(TOMBSTONE_TYPE, &v1_key, None, &value, lsn.max(existing.lsn))?;
                Ok(false)
            }
        }
    }

    /// Called after a transaction that wrote tombstones commits.
    pub fn note_tombstones_written(&self, created: u64) {
        if created > 0 {
            self.estimated_count.fetch_add(created, Ordering::SeqCst);
        }
    }

    /// Runs a cleanup pass when the estimated volume exceeds the
    /// configured limit. At most one pass runs at a time. Returns the
    /// number of tombstones removed.
    pub fn cleanup_if_needed(&self, store: &dyn LocalStore) -> StoreResult<u64> {
        if self.estimated_count.load(Ordering::SeqCst) <= self.config.cleanup_limit as u64 {
            return Ok(0);
        }
        if self
            .cleanup_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(0);
        }
        let result = self.run_cleanup(store);
        self.cleanup_active.store(false, Ordering::SeqCst);
        result
    }

    fn run_cleanup(&self, store: &dyn LocalStore) -> StoreResult<u64> {
        let mut tx = store.create_transaction()?;
        let rows = tx.enumerate(TOMBSTONE_TYPE, "")?;

        // The write-side estimate drifts over time; the full scan is the
        // exact count and resets it.
        let exact = rows.len() as u64;
        self.estimated_count.store(exact, Ordering::SeqCst);

        let target = (exact / 2).min(self.config.max_per_cleanup as u64) as usize;
        if target == 0 || rows.len() <= 1 {
            tx.rollback();
            return Ok(0);
        }

        let mut removed = 0u64;
        let mut highest_removed: Lsn = 0;

        if self.config.use_v2_format {
            // Key order is LSN order: delete each entry once a later one
            // has been seen, so the final (highest LSN) entry survives.
            let mut previous: Option<&str> = None;
            let mut previous_lsn: Lsn = 0;
            for row in &rows {
                if let Some(prev_key) = previous {
                    if removed as usize >= target {
                        break;
                    }
                    tx.delete(TOMBSTONE_TYPE, prev_key, 0)?;
                    removed += 1;
                    highest_removed = highest_removed.max(previous_lsn);
                }
                previous = Some(&row.key);
                previous_lsn = row.lsn;
            }
        } else {
            let mut sorted: Vec<&_> = rows.iter().collect();
            sorted.sort_by_key(|r| r.lsn);
            // The highest-LSN tombstone may be carrying current progress
            // and is never removed.
            let removable = &sorted[..sorted.len() - 1];
            for row in removable.iter().take(target) {
                tx.delete(TOMBSTONE_TYPE, &row.key, 0)?;
                removed += 1;
                highest_removed = highest_removed.max(row.lsn);
            }
        }

        if removed == 0 {
            tx.rollback();
            return Ok(0);
        }

        metadata::write_data(
            tx.as_mut(),
            META_TYPE,
            TOMBSTONE_LOW_WATERMARK_KEY,
            &TombstoneLowWatermarkData {
                lsn: highest_removed,
            },
            highest_removed,
        )?;

        {
            let mut state = self.lock_watermark()?;
            if state.active_readers > 0 {
                // A copy reader may still depend on tombstones below the
                // new watermark. Retry on a later pass.
                drop(state);
                tx.rollback();
                Logger::info(
                    "REPL_TOMBSTONE_CLEANUP_DEFERRED",
                    &[("reason", "active copy reader")],
                );
                return Ok(0);
            }
            state.low_watermark = state.low_watermark.max(highest_removed);
        }

        tx.commit()?;
        self.estimated_count
            .fetch_sub(removed.min(exact), Ordering::SeqCst);
        Logger::info(
            "REPL_TOMBSTONE_CLEANUP",
            &[
                ("removed", removed.to_string().as_str()),
                ("new_low_watermark", highest_removed.to_string().as_str()),
            ],
        );
        Ok(removed)
    }

    fn lock_watermark(&self) -> StoreResult<std::sync::MutexGuard<'_, WatermarkState>> {
        self.watermark
            .lock()
            .map_err(|_| StoreError::StoreFatal("tombstone watermark lock poisoned".into()))
    }
}
