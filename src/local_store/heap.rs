//! In-memory local store adapter
//!
//! `HeapStore` keeps rows in a BTree keyed by (type, key) so prefix
//! enumeration is key-ordered. Transactions buffer a write set and apply
//! it atomically under the core lock on commit. The same transactional
//! core backs `FileStore`, which adds persistence on commit.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use super::{
    write_rows_file, BackupFileEntry, BackupOption, LocalStore, Lsn, StoreRow, StoreTransaction,
    FULL_BACKUP_FILE, INCREMENTAL_BACKUP_FILE,
};
use crate::errors::{StoreError, StoreResult};

/// Upper bound on how long `drain()` waits for in-flight transactions.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct CoreState {
    rows: BTreeMap<(String, String), (Vec<u8>, Lsn)>,
    active_txs: usize,
    last_commit_lsn: Lsn,
}

/// Transactional row core shared by both adapters.
#[derive(Debug)]
pub(crate) struct StoreCore {
    state: Mutex<CoreState>,
    drained: Condvar,
    terminated: AtomicBool,
    backup_base_lsn: AtomicU64,
}

impl StoreCore {
    pub(crate) fn from_rows(rows: Vec<StoreRow>) -> Self {
        let mut map = BTreeMap::new();
        let mut last_lsn = 0;
        for row in rows {
            last_lsn = last_lsn.max(row.lsn);
            map.insert((row.data_type, row.key), (row.value, row.lsn));
        }
        Self {
            state: Mutex::new(CoreState {
                rows: map,
                active_txs: 0,
                last_commit_lsn: last_lsn,
            }),
            drained: Condvar::new(),
            terminated: AtomicBool::new(false),
            backup_base_lsn: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, CoreState>> {
        self.state
            .lock()
            .map_err(|_| StoreError::StoreFatal("local store state lock poisoned".into()))
    }

    pub(crate) fn begin(self: &Arc<Self>, persist_path: Option<PathBuf>) -> StoreResult<Box<dyn StoreTransaction>> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(StoreError::ObjectClosed);
        }
        self.lock()?.active_txs += 1;
        Ok(Box::new(CoreTransaction {
            core: Arc::clone(self),
            persist_path,
            writes: Vec::new(),
            finished: false,
        }))
    }

    pub(crate) fn last_change_lsn(&self) -> StoreResult<Lsn> {
        Ok(self.lock()?.last_commit_lsn)
    }

    pub(crate) fn row_count(&self) -> StoreResult<usize> {
        Ok(self.lock()?.rows.len())
    }

    pub(crate) fn snapshot(&self) -> StoreResult<Vec<StoreRow>> {
        let state = self.lock()?;
        Ok(state
            .rows
            .iter()
            .map(|((t, k), (v, lsn))| StoreRow {
                data_type: t.clone(),
                key: k.clone(),
                value: v.clone(),
                lsn: *lsn,
            })
            .collect())
    }

    pub(crate) fn backup(&self, dir: &Path, option: BackupOption) -> StoreResult<Vec<BackupFileEntry>> {
        match option {
            BackupOption::Full => {
                let rows = self.snapshot()?;
                let last = self.last_change_lsn()?;
                let crc = write_rows_file(&dir.join(FULL_BACKUP_FILE), &rows)?;
                self.backup_base_lsn.store(last, Ordering::SeqCst);
                Ok(vec![BackupFileEntry {
                    name: FULL_BACKUP_FILE.to_string(),
                    crc32: crc,
                }])
            }
            BackupOption::Incremental => {
                let base = self.backup_base_lsn.load(Ordering::SeqCst);
                let rows: Vec<StoreRow> = self
                    .snapshot()?
                    .into_iter()
                    .filter(|r| r.lsn > base)
                    .collect();
                let last = self.last_change_lsn()?;
                let crc = write_rows_file(&dir.join(INCREMENTAL_BACKUP_FILE), &rows)?;
                self.backup_base_lsn.store(last, Ordering::SeqCst);
                Ok(vec![BackupFileEntry {
                    name: INCREMENTAL_BACKUP_FILE.to_string(),
                    crc32: crc,
                }])
            }
            // Log truncation is internal to the storage engine; nothing to
            // write from here.
            BackupOption::TruncateLogsOnly => Ok(Vec::new()),
        }
    }

    pub(crate) fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    pub(crate) fn drain(&self) {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(_) => return,
        };
        while state.active_txs > 0 {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            let (next, _) = match self.drained.wait_timeout(state, deadline - now) {
                Ok(r) => r,
                Err(_) => return,
            };
            state = next;
        }
    }
}

#[derive(Debug, Clone)]
enum WriteOp {
    Put {
        data_type: String,
        key: String,
        value: Vec<u8>,
        lsn: Lsn,
    },
    Remove {
        data_type: String,
        key: String,
    },
}

struct CoreTransaction {
    core: Arc<StoreCore>,
    persist_path: Option<PathBuf>,
    writes: Vec<WriteOp>,
    finished: bool,
}

impl CoreTransaction {
    /// Committed row merged with this transaction's own writes.
    fn read_merged(&self, data_type: &str, key: &str) -> StoreResult<Option<StoreRow>> {
        let mut current = {
            let state = self.core.lock()?;
            state
                .rows
                .get(&(data_type.to_string(), key.to_string()))
                .map(|(v, lsn)| StoreRow {
                    data_type: data_type.to_string(),
                    key: key.to_string(),
                    value: v.clone(),
                    lsn: *lsn,
                })
        };

        for op in &self.writes {
            match op {
                WriteOp::Put {
                    data_type: t,
                    key: k,
                    value,
                    lsn,
                } if t == data_type && k == key => {
                    current = Some(StoreRow {
                        data_type: t.clone(),
                        key: k.clone(),
                        value: value.clone(),
                        lsn: *lsn,
                    });
                }
                WriteOp::Remove {
                    data_type: t,
                    key: k,
                } if t == data_type && k == key => {
                    current = None;
                }
                _ => {}
            }
        }
        Ok(current)
    }

    fn merged_rows(&self) -> StoreResult<BTreeMap<(String, String), (Vec<u8>, Lsn)>> {
        let mut rows = self.core.lock()?.rows.clone();
        for op in &self.writes {
            match op {
                WriteOp::Put {
                    data_type,
                    key,
                    value,
                    lsn,
                } => {
                    rows.insert((data_type.clone(), key.clone()), (value.clone(), *lsn));
                }
                WriteOp::Remove { data_type, key } => {
                    rows.remove(&(data_type.clone(), key.clone()));
                }
            }
        }
        Ok(rows)
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            if let Ok(mut state) = self.core.state.lock() {
                state.active_txs = state.active_txs.saturating_sub(1);
            }
            self.core.drained.notify_all();
        }
    }
}

impl StoreTransaction for CoreTransaction {
    fn insert(&mut self, data_type: &str, key: &str, value: &[u8], lsn: Lsn) -> StoreResult<()> {
        if self.read_merged(data_type, key)?.is_some() {
            return Err(StoreError::RecordAlreadyExists(format!(
                "{}/{}",
                data_type, key
            )));
        }
        self.writes.push(WriteOp::Put {
            data_type: data_type.to_string(),
            key: key.to_string(),
            value: value.to_vec(),
            lsn,
        });
        Ok(())
    }

    fn update(
        &mut self,
        data_type: &str,
        key: &str,
        new_key: Option<&str>,
        value: &[u8],
        lsn: Lsn,
    ) -> StoreResult<()> {
        if self.read_merged(data_type, key)?.is_none() {
            return Err(StoreError::RecordNotFound(format!("{}/{}", data_type, key)));
        }
        let target = new_key.unwrap_or(key);
        if target != key {
            self.writes.push(WriteOp::Remove {
                data_type: data_type.to_string(),
                key: key.to_string(),
            });
        }
        self.writes.push(WriteOp::Put {
            data_type: data_type.to_string(),
            key: target.to_string(),
            value: value.to_vec(),
            lsn,
        });
        Ok(())
    }

    fn delete(&mut self, data_type: &str, key: &str, expected_lsn: Lsn) -> StoreResult<()> {
        match self.read_merged(data_type, key)? {
            None => Err(StoreError::RecordNotFound(format!("{}/{}", data_type, key))),
            Some(row) => {
                if expected_lsn != 0 && row.lsn != expected_lsn {
                    return Err(StoreError::WriteConflict(format!(
                        "{}/{}: expected lsn {} found {}",
                        data_type, key, expected_lsn, row.lsn
                    )));
                }
                self.writes.push(WriteOp::Remove {
                    data_type: data_type.to_string(),
                    key: key.to_string(),
                });
                Ok(())
            }
        }
    }

    fn get(&self, data_type: &str, key: &str) -> StoreResult<Option<StoreRow>> {
        self.read_merged(data_type, key)
    }

    fn enumerate(&self, data_type: &str, key_prefix: &str) -> StoreResult<Vec<StoreRow>> {
        let rows = self.merged_rows()?;
        Ok(rows
            .into_iter()
            .filter(|((t, k), _)| t == data_type && k.starts_with(key_prefix))
            .map(|((t, k), (v, lsn))| StoreRow {
                data_type: t,
                key: k,
                value: v,
                lsn,
            })
            .collect())
    }

    fn enumerate_from_lsn(&self, from_lsn: Lsn) -> StoreResult<Vec<StoreRow>> {
        let rows = self.merged_rows()?;
        let mut out: Vec<StoreRow> = rows
            .into_iter()
            .filter(|(_, (_, lsn))| *lsn >= from_lsn)
            .map(|((t, k), (v, lsn))| StoreRow {
                data_type: t,
                key: k,
                value: v,
                lsn,
            })
            .collect();
        out.sort_by(|a, b| {
            (a.lsn, &a.data_type, &a.key).cmp(&(b.lsn, &b.data_type, &b.key))
        });
        Ok(out)
    }

    fn stamp_lsn(&mut self, lsn: Lsn) {
        for op in &mut self.writes {
            if let WriteOp::Put { lsn: l, .. } = op {
                if *l == 0 {
                    *l = lsn;
                }
            }
        }
    }

    fn commit(mut self: Box<Self>) -> StoreResult<()> {
        if self.core.terminated.load(Ordering::SeqCst) {
            self.finish();
            return Err(StoreError::ObjectClosed);
        }

        let core = Arc::clone(&self.core);
        let mut state = match core.lock() {
            Ok(s) => s,
            Err(e) => {
                self.finish();
                return Err(e);
            }
        };

        for op in &self.writes {
            match op {
                WriteOp::Put {
                    data_type,
                    key,
                    value,
                    lsn,
                } => {
                    state
                        .rows
                        .insert((data_type.clone(), key.clone()), (value.clone(), *lsn));
                    state.last_commit_lsn = state.last_commit_lsn.max(*lsn);
                }
                WriteOp::Remove { data_type, key } => {
                    state.rows.remove(&(data_type.clone(), key.clone()));
                }
            }
        }

        let persist_result = if let Some(path) = &self.persist_path {
            let rows: Vec<StoreRow> = state
                .rows
                .iter()
                .map(|((t, k), (v, lsn))| StoreRow {
                    data_type: t.clone(),
                    key: k.clone(),
                    value: v.clone(),
                    lsn: *lsn,
                })
                .collect();
            write_rows_file(path, &rows).map(|_| ())
        } else {
            Ok(())
        };

        drop(state);
        self.finish();

        // A failed persist invalidates the adapter; the replica must
        // restart rather than serve rows the file no longer reflects.
        persist_result.map_err(|e| StoreError::StoreFatal(e.to_string()))
    }

    fn rollback(mut self: Box<Self>) {
        self.writes.clear();
        self.finish();
    }
}

impl Drop for CoreTransaction {
    fn drop(&mut self) {
        self.finish();
    }
}

/// In-memory local store adapter.
pub struct HeapStore {
    core: Arc<StoreCore>,
}

impl HeapStore {
    pub fn new() -> Self {
        Self::from_rows(Vec::new())
    }

    pub fn from_rows(rows: Vec<StoreRow>) -> Self {
        Self {
            core: Arc::new(StoreCore::from_rows(rows)),
        }
    }
}

impl Default for HeapStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore for HeapStore {
    fn create_transaction(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        self.core.begin(None)
    }

    fn last_change_lsn(&self) -> StoreResult<Lsn> {
        self.core.last_change_lsn()
    }

    fn estimate_row_count(&self) -> StoreResult<usize> {
        self.core.row_count()
    }

    fn backup(&self, dir: &Path, option: BackupOption) -> StoreResult<Vec<BackupFileEntry>> {
        self.core.backup(dir, option)
    }

    fn terminate(&self) -> StoreResult<()> {
        self.core.terminate();
        Ok(())
    }

    fn drain(&self) {
        self.core.drain();
    }
}
