//! File-backed local store adapter
//!
//! Same transactional core as `HeapStore`, plus durability: the full row
//! set is rewritten to `store.json` on every commit, and a lock file
//! guards against two replicas opening the same data directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::heap::StoreCore;
use super::{
    lock_file_path, read_rows_file, store_file_path, write_rows_file, BackupFileEntry,
    BackupOption, LocalStore, Lsn, StoreRow, StoreTransaction,
};
use crate::errors::{StoreError, StoreResult};

/// File-backed local store adapter.
pub struct FileStore {
    core: Arc<StoreCore>,
    data_dir: PathBuf,
}

impl FileStore {
    /// Opens the store in `data_dir`, recovering rows from a previous run.
    ///
    /// Fails with `StoreInUse` when another instance holds the lock file
    /// and with `DatabaseFilesCorrupted` when the row file cannot be
    /// parsed. Both are repair-eligible.
    pub fn open(data_dir: &Path) -> StoreResult<Self> {
        fs::create_dir_all(data_dir)
            .map_err(|e| StoreError::io("creating local store directory", e))?;

        let lock_path = lock_file_path(data_dir);
        if lock_path.exists() {
            return Err(StoreError::StoreInUse(format!(
                "lock file present at {}",
                lock_path.display()
            )));
        }

        let rows_path = store_file_path(data_dir);
        let rows = if rows_path.exists() {
            match read_rows_file(&rows_path) {
                Ok(rows) => rows,
                Err(StoreError::Serialization(msg)) => {
                    return Err(StoreError::DatabaseFilesCorrupted(format!(
                        "{}: {}",
                        rows_path.display(),
                        msg
                    )))
                }
                Err(e) => return Err(e),
            }
        } else {
            Vec::new()
        };

        fs::write(&lock_path, std::process::id().to_string())
            .map_err(|e| StoreError::io("writing local store lock file", e))?;

        Ok(Self {
            core: Arc::new(StoreCore::from_rows(rows)),
            data_dir: data_dir.to_path_buf(),
        })
    }

    /// Creates a brand-new empty store in `data_dir`, refusing to touch
    /// a directory that already holds store data.
    pub fn create_new(data_dir: &Path) -> StoreResult<Self> {
        fs::create_dir_all(data_dir)
            .map_err(|e| StoreError::io("creating local store directory", e))?;

        let rows_path = store_file_path(data_dir);
        if rows_path.exists() {
            return Err(StoreError::InvalidOperation(format!(
                "store data already present at {}",
                rows_path.display()
            )));
        }
        Self::create_with_rows(data_dir, Vec::new())
    }

    /// Creates a store in `data_dir` seeded with `rows`, replacing any
    /// existing row file. Used when installing restored or copied state.
    pub fn create_with_rows(data_dir: &Path, rows: Vec<StoreRow>) -> StoreResult<Self> {
        fs::create_dir_all(data_dir)
            .map_err(|e| StoreError::io("creating local store directory", e))?;

        let lock_path = lock_file_path(data_dir);
        if lock_path.exists() {
            return Err(StoreError::StoreInUse(format!(
                "lock file present at {}",
                lock_path.display()
            )));
        }

        write_rows_file(&store_file_path(data_dir), &rows)?;
        fs::write(&lock_path, std::process::id().to_string())
            .map_err(|e| StoreError::io("writing local store lock file", e))?;

        Ok(Self {
            core: Arc::new(StoreCore::from_rows(rows)),
            data_dir: data_dir.to_path_buf(),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

impl LocalStore for FileStore {
    fn create_transaction(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        self.core.begin(Some(store_file_path(&self.data_dir)))
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
        let lock_path = lock_file_path(&self.data_dir);
        if lock_path.exists() {
            fs::remove_file(&lock_path)
                .map_err(|e| StoreError::io("removing local store lock file", e))?;
        }
        Ok(())
    }

    fn drain(&self) {
        self.core.drain();
    }
}
