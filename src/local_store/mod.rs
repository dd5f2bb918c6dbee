//! Local Store Adapter Layer
//!
//! The engine never talks to a storage engine directly; it consumes the
//! `LocalStore` contract: transactional insert/update/delete, enumeration
//! by type + key prefix and by operation LSN, and backup/terminate/drain.
//! Two concrete adapters implement the contract, selected once at
//! construction:
//!
//! - `HeapStore`: in-memory rows, used by tests and by hosts that supply
//!   their own persistence.
//! - `FileStore`: rows persisted to a JSON file per commit, with lock-file
//!   detection of concurrent opens and corruption detection at open.
//!
//! Storage-engine internals (B-tree/LSM) are out of scope; these adapters
//! exist to exercise the contract.

pub mod file;
pub mod heap;

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::errors::{StoreError, StoreResult};

pub use file::FileStore;
pub use heap::HeapStore;

/// Operation sequence number. 0 is reserved for "no user data".
pub type Lsn = u64;

/// One stored row. `lsn` is the sequence number of the operation that last
/// wrote the row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreRow {
    pub data_type: String,
    pub key: String,
    pub value: Vec<u8>,
    pub lsn: Lsn,
}

/// Backup flavor requested from the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupOption {
    Full,
    Incremental,
    TruncateLogsOnly,
}

/// A file written by a backup, with its checksum for restore validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFileEntry {
    pub name: String,
    pub crc32: u32,
}

/// A transaction against the local store. Writes are buffered and applied
/// atomically on commit; reads see committed state merged with this
/// transaction's own writes.
pub trait StoreTransaction: Send {
    /// Insert a new row. Fails with `RecordAlreadyExists` if present.
    fn insert(&mut self, data_type: &str, key: &str, value: &[u8], lsn: Lsn) -> StoreResult<()>;

    /// Update an existing row, optionally renaming it to `new_key`.
    /// Fails with `RecordNotFound` if absent.
    fn update(
        &mut self,
        data_type: &str,
        key: &str,
        new_key: Option<&str>,
        value: &[u8],
        lsn: Lsn,
    ) -> StoreResult<()>;

    /// Delete a row. `expected_lsn` of 0 skips the sequence check;
    /// otherwise a mismatch fails with `WriteConflict`.
    fn delete(&mut self, data_type: &str, key: &str, expected_lsn: Lsn) -> StoreResult<()>;

    /// Read one row, or `None`.
    fn get(&self, data_type: &str, key: &str) -> StoreResult<Option<StoreRow>>;

    /// Rows of `data_type` whose key starts with `key_prefix`, key order.
    fn enumerate(&self, data_type: &str, key_prefix: &str) -> StoreResult<Vec<StoreRow>>;

    /// All rows with `lsn >= from_lsn`, ordered by (lsn, type, key).
    fn enumerate_from_lsn(&self, from_lsn: Lsn) -> StoreResult<Vec<StoreRow>>;

    /// Set the commit LSN on every row this transaction wrote with LSN 0.
    /// Called once the replication append has assigned the sequence number.
    fn stamp_lsn(&mut self, lsn: Lsn);

    fn commit(self: Box<Self>) -> StoreResult<()>;

    fn rollback(self: Box<Self>);
}

/// The local store contract consumed by the engine.
pub trait LocalStore: Send + Sync {
    fn create_transaction(&self) -> StoreResult<Box<dyn StoreTransaction>>;

    /// Highest LSN applied by any committed transaction (0 when empty).
    fn last_change_lsn(&self) -> StoreResult<Lsn>;

    fn estimate_row_count(&self) -> StoreResult<usize>;

    /// Write backup files into `dir` and return their names + checksums.
    /// `Incremental` covers rows changed since the previous backup;
    /// `TruncateLogsOnly` writes nothing here (log truncation is internal).
    fn backup(&self, dir: &Path, option: BackupOption) -> StoreResult<Vec<BackupFileEntry>>;

    /// Abort outstanding activity; subsequent transactions fail with
    /// `ObjectClosed`.
    fn terminate(&self) -> StoreResult<()>;

    /// Block until in-flight transactions have finished.
    fn drain(&self);
}

/// Local store adapter selection, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalStoreKind {
    Heap,
    File,
}

/// Open (or create) a local store of the configured kind.
pub fn open_local_store(kind: LocalStoreKind, data_dir: &Path) -> StoreResult<Arc<dyn LocalStore>> {
    match kind {
        LocalStoreKind::Heap => Ok(Arc::new(HeapStore::new())),
        LocalStoreKind::File => Ok(Arc::new(FileStore::open(data_dir)?)),
    }
}

/// Create a brand-new local store of the configured kind, refusing a
/// data directory that already holds store data.
pub fn create_local_store(
    kind: LocalStoreKind,
    data_dir: &Path,
) -> StoreResult<Arc<dyn LocalStore>> {
    match kind {
        LocalStoreKind::Heap => Ok(Arc::new(HeapStore::new())),
        LocalStoreKind::File => Ok(Arc::new(FileStore::create_new(data_dir)?)),
    }
}

/// Build a local store of the configured kind pre-populated with `rows`
/// (full-copy install, restore).
pub fn store_from_rows(
    kind: LocalStoreKind,
    data_dir: &Path,
    rows: Vec<StoreRow>,
) -> StoreResult<Arc<dyn LocalStore>> {
    match kind {
        LocalStoreKind::Heap => Ok(Arc::new(HeapStore::from_rows(rows))),
        LocalStoreKind::File => Ok(Arc::new(FileStore::create_with_rows(data_dir, rows)?)),
    }
}

/// Shared handle to the swappable local store. Readers (transactions,
/// queries, backup) take the read side; swap/release (full copy install,
/// restore, terminate) takes the write side.
#[derive(Clone)]
pub struct LocalStoreHandle {
    inner: Arc<RwLock<Option<Arc<dyn LocalStore>>>>,
}

impl LocalStoreHandle {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(store))),
        }
    }

    pub fn empty() -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
        }
    }

    /// Acquire the current store, or `ObjectClosed` if released.
    pub fn acquire(&self) -> StoreResult<Arc<dyn LocalStore>> {
        self.inner
            .read()
            .map_err(|_| StoreError::StoreFatal("local store lock poisoned".into()))?
            .clone()
            .ok_or(StoreError::ObjectClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.read().map(|g| g.is_none()).unwrap_or(true)
    }

    /// Swap in a replacement store, returning the previous one.
    pub fn replace(&self, store: Arc<dyn LocalStore>) -> Option<Arc<dyn LocalStore>> {
        match self.inner.write() {
            Ok(mut guard) => guard.replace(store),
            Err(_) => None,
        }
    }

    /// Release the store entirely (close path).
    pub fn take(&self) -> Option<Arc<dyn LocalStore>> {
        match self.inner.write() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        }
    }
}

/// Serialize rows to a backup file, fsync it, and return its checksum.
pub fn write_rows_file(path: &Path, rows: &[StoreRow]) -> StoreResult<u32> {
    let json = serde_json::to_vec(rows).map_err(|e| StoreError::serialization("dump rows", e))?;

    let mut file = File::create(path)
        .map_err(|e| StoreError::io(format!("create {}", path.display()), e))?;
    file.write_all(&json)
        .map_err(|e| StoreError::io(format!("write {}", path.display()), e))?;
    file.sync_all()
        .map_err(|e| StoreError::io(format!("fsync {}", path.display()), e))?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&json);
    Ok(hasher.finalize())
}

/// Read rows back from a backup file.
pub fn read_rows_file(path: &Path) -> StoreResult<Vec<StoreRow>> {
    let mut contents = Vec::new();
    File::open(path)
        .and_then(|mut f| f.read_to_end(&mut contents))
        .map_err(|e| StoreError::io(format!("read {}", path.display()), e))?;

    serde_json::from_slice(&contents)
        .map_err(|e| StoreError::serialization(format!("parse {}", path.display()), e))
}

/// Checksum a file on disk (restore validation).
pub fn file_crc32(path: &Path) -> StoreResult<u32> {
    let mut contents = Vec::new();
    File::open(path)
        .and_then(|mut f| f.read_to_end(&mut contents))
        .map_err(|e| StoreError::io(format!("read {}", path.display()), e))?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&contents);
    Ok(hasher.finalize())
}

/// Name of the full-backup row file inside a backup directory.
pub const FULL_BACKUP_FILE: &str = "store_full.json";

/// Name of the incremental-backup row file inside a backup directory.
pub const INCREMENTAL_BACKUP_FILE: &str = "store_incr.json";

/// Paths helper used by `FileStore`.
pub(crate) fn store_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join("store.json")
}

pub(crate) fn lock_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join(".lock")
}
