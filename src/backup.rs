//! Backup creation and backup-chain validation
//!
//! Every backup directory carries a `restore.dat` metadata file naming
//! the backup kind, its chain id, its index within the chain, and the
//! files that belong to it (with checksums). A backup chain is a parent
//! directory with one subdirectory per backup; a valid chain has
//! exactly one Full entry at index 0 followed by a contiguous run of
//! Incremental entries sharing the chain id. Chain violations are hard
//! restore failures and name the offending index.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tar::{Archive, Builder};
use uuid::Uuid;

use crate::errors::{StoreError, StoreResult};
use crate::local_store::{
    file_crc32, read_rows_file, BackupFileEntry, BackupOption, LocalStore, Lsn, StoreRow,
    FULL_BACKUP_FILE, INCREMENTAL_BACKUP_FILE,
};
use crate::metadata::{self, BACKUP_CHAIN_KEY, META_TYPE, TOMBSTONE_TYPE};
use crate::observability::Logger;
use crate::tombstone::TombstoneData;

/// Metadata file present in every backup directory.
pub const RESTORE_METADATA_FILE: &str = "restore.dat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupKind {
    Full,
    Incremental,
}

/// Serialized into `restore.dat` alongside the backup files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRestoreData {
    pub kind: BackupKind,
    /// Identifies the chain this backup belongs to.
    pub chain_id: Uuid,
    /// 0 for the Full backup, previous + 1 for each Incremental.
    pub index: u64,
    /// Partition the backup was taken from.
    pub partition_id: Uuid,
    pub created_at: String,
    /// Files belonging to this backup, with checksums.
    pub files: Vec<BackupFileEntry>,
}

impl BackupRestoreData {
    pub fn write_to(&self, dir: &Path) -> StoreResult<()> {
        let path = dir.join(RESTORE_METADATA_FILE);
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| StoreError::serialization("encoding restore metadata", e))?;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| StoreError::io("creating restore metadata", e))?;
        file.write_all(&json)
            .map_err(|e| StoreError::io("writing restore metadata", e))?;
        file.sync_all()
            .map_err(|e| StoreError::io("syncing restore metadata", e))?;
        Ok(())
    }

    pub fn read_from(dir: &Path) -> StoreResult<Self> {
        let path = dir.join(RESTORE_METADATA_FILE);
        let mut json = String::new();
        File::open(&path)
            .map_err(|e| StoreError::io("opening restore metadata", e))?
            .read_to_string(&mut json)
            .map_err(|e| StoreError::io("reading restore metadata", e))?;
        serde_json::from_str(&json).map_err(|e| {
            StoreError::InvalidRestoreData(format!("{}: {}", path.display(), e))
        })
    }
}

/// Persisted arming state for incremental backups. Written by a Full
/// backup; absent until one has been taken for the current chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct BackupChainState {
    chain_id: Uuid,
    next_index: u64,
}

/// Drives backups for one replica.
pub struct BackupManager {
    partition_id: Uuid,
}

impl BackupManager {
    pub fn new(partition_id: Uuid) -> Self {
        Self { partition_id }
    }

    /// Takes a backup into `dir`. Returns the written metadata, or
    /// `None` for `TruncateLogsOnly`, which writes no restore metadata
    /// at all.
    pub fn backup(
        &self,
        store: &dyn LocalStore,
        dir: &Path,
        option: BackupOption,
    ) -> StoreResult<Option<BackupRestoreData>> {
        fs::create_dir_all(dir).map_err(|e| StoreError::io("creating backup directory", e))?;

        if option == BackupOption::Incremental && self.chain_state(store)?.is_none() {
            return Err(StoreError::MissingFullBackup);
        }

        let files = store.backup(dir, option)?;
        let data = match option {
            BackupOption::TruncateLogsOnly => return Ok(None),
            BackupOption::Full => {
                let chain_id = Uuid::new_v4();
                self.persist_chain_state(
                    store,
                    BackupChainState {
                        chain_id,
                        next_index: 1,
                    },
                )?;
                BackupRestoreData {
                    kind: BackupKind::Full,
                    chain_id,
                    index: 0,
                    partition_id: self.partition_id,
                    created_at: Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
                    files,
                }
            }
            BackupOption::Incremental => {
                // Checked non-None above.
                let state = self.chain_state(store)?.ok_or(StoreError::MissingFullBackup)?;
                self.persist_chain_state(
                    store,
                    BackupChainState {
                        chain_id: state.chain_id,
                        next_index: state.next_index + 1,
                    },
                )?;
                BackupRestoreData {
                    kind: BackupKind::Incremental,
                    chain_id: state.chain_id,
                    index: state.next_index,
                    partition_id: self.partition_id,
                    created_at: Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
                    files,
                }
            }
        };

        data.write_to(dir)?;
        Logger::info(
            "REPL_BACKUP_CREATED",
            &[
                (
                    "kind",
                    match data.kind {
                        BackupKind::Full => "full",
                        BackupKind::Incremental => "incremental",
                    },
                ),
                ("index", data.index.to_string().as_str()),
                ("chain", data.chain_id.to_string().as_str()),
            ],
        );
        Ok(Some(data))
    }

    fn chain_state(&self, store: &dyn LocalStore) -> StoreResult<Option<BackupChainState>> {
        let tx = store.create_transaction()?;
        let state = metadata::read_data(tx.as_ref(), META_TYPE, BACKUP_CHAIN_KEY)?;
        tx.rollback();
        Ok(state)
    }

    fn persist_chain_state(
        &self,
        store: &dyn LocalStore,
        state: BackupChainState,
    ) -> StoreResult<()> {
        let lsn = store.last_change_lsn()?;
        let mut tx = store.create_transaction()?;
        metadata::write_data(tx.as_mut(), META_TYPE, BACKUP_CHAIN_KEY, &state, lsn)?;
        tx.commit()
    }
}

/// A validated backup chain, entries ordered by index.
#[derive(Debug)]
pub struct BackupChain {
    pub entries: Vec<(PathBuf, BackupRestoreData)>,
}

impl BackupChain {
    pub fn chain_id(&self) -> Uuid {
        self.entries[0].1.chain_id
    }
}

/// Discovers and validates the backup layout under `dir`: either a
/// single merged backup (`restore.dat` directly present) or a chain of
/// subdirectories.
pub fn discover_and_validate(dir: &Path) -> StoreResult<BackupChain> {
    if dir.join(RESTORE_METADATA_FILE).exists() {
        let data = BackupRestoreData::read_from(dir)?;
        if data.kind != BackupKind::Full || data.index != 0 {
            return Err(StoreError::InvalidBackupChain(format!(
                "merged backup at {} is not a full backup at index 0",
                dir.display()
            )));
        }
        return Ok(BackupChain {
            entries: vec![(dir.to_path_buf(), data)],
        });
    }

    let mut entries: Vec<(PathBuf, BackupRestoreData)> = Vec::new();
    let read_dir =
        fs::read_dir(dir).map_err(|e| StoreError::io("reading backup chain directory", e))?;
    for entry in read_dir {
        let entry = entry.map_err(|e| StoreError::io("reading backup chain directory", e))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if !path.join(RESTORE_METADATA_FILE).exists() {
            return Err(StoreError::InvalidRestoreData(format!(
                "{} has no restore metadata",
                path.display()
            )));
        }
        let data = BackupRestoreData::read_from(&path)?;
        entries.push((path, data));
    }

    if entries.is_empty() {
        return Err(StoreError::InvalidRestoreData(format!(
            "{} contains no backups",
            dir.display()
        )));
    }

    entries.sort_by_key(|(_, d)| d.index);
    validate_chain(&entries)?;
    Ok(BackupChain { entries })
}

fn validate_chain(entries: &[(PathBuf, BackupRestoreData)]) -> StoreResult<()> {
    let chain_id = entries[0].1.chain_id;
    let mut expected = 0u64;
    for (path, data) in entries {
        if data.chain_id != chain_id {
            return Err(StoreError::InvalidBackupChain(format!(
                "chain id mismatch at index {} ({})",
                data.index,
                path.display()
            )));
        }
        if data.index < expected {
            return Err(StoreError::DuplicateBackups(format!(
                "two backups claim index {}",
                data.index
            )));
        }
        if data.index > expected {
            return Err(StoreError::InvalidBackupChain(format!(
                "missing backup index {}",
                expected
            )));
        }
        let expected_kind = if data.index == 0 {
            BackupKind::Full
        } else {
            BackupKind::Incremental
        };
        if data.kind != expected_kind {
            return Err(StoreError::InvalidBackupChain(format!(
                "index {} has the wrong backup kind",
                data.index
            )));
        }
        expected += 1;
    }
    Ok(())
}

/// Materializes the chain into a row set: checksums every listed file,
/// loads the full backup, then applies each incremental in order.
/// Tombstone rows in an incremental also remove the user row they stand
/// in for.
pub fn load_chain_rows(chain: &BackupChain) -> StoreResult<Vec<StoreRow>> {
    let mut merged: BTreeMap<(String, String), StoreRow> = BTreeMap::new();

    for (dir, data) in &chain.entries {
        for file in &data.files {
            let path = dir.join(&file.name);
            let actual = file_crc32(&path)?;
            if actual != file.crc32 {
                return Err(StoreError::InvalidRestoreData(format!(
                    "checksum mismatch for {}",
                    path.display()
                )));
            }
        }

        let file_name = match data.kind {
            BackupKind::Full => FULL_BACKUP_FILE,
            BackupKind::Incremental => INCREMENTAL_BACKUP_FILE,
        };
        let rows = read_rows_file(&dir.join(file_name))?;
        for row in rows {
            if row.data_type == TOMBSTONE_TYPE {
                let tombstone: TombstoneData = serde_json::from_slice(&row.value)
                    .map_err(|e| StoreError::serialization("decoding backup tombstone", e))?;
                merged.remove(&(tombstone.data_type, tombstone.key));
            }
            merged.insert((row.data_type.clone(), row.key.clone()), row);
        }
    }

    Ok(merged.into_values().collect())
}

/// Highest LSN contained in a restored row set.
pub fn restored_progress(rows: &[StoreRow]) -> Lsn {
    rows.iter().map(|r| r.lsn).max().unwrap_or(0)
}

/// Packs a backup directory into a single tar archive, files in
/// deterministic name order, fsynced before return.
pub fn pack_backup(dir: &Path, archive_path: &Path) -> StoreResult<()> {
    let file = File::create(archive_path)
        .map_err(|e| StoreError::io("creating backup archive", e))?;
    let mut builder = Builder::new(file);

    let mut names: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| StoreError::io("reading backup directory", e))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    names.sort();

    for path in names {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut file =
            File::open(&path).map_err(|e| StoreError::io("opening backup file", e))?;
        builder
            .append_file(&name, &mut file)
            .map_err(|e| StoreError::io("adding file to backup archive", e))?;
    }

    let file = builder
        .into_inner()
        .map_err(|e| StoreError::io("finishing backup archive", e))?;
    file.sync_all()
        .map_err(|e| StoreError::io("syncing backup archive", e))?;
    Ok(())
}

/// Unpacks a tar archive created by [`pack_backup`].
pub fn unpack_backup(archive_path: &Path, dir: &Path) -> StoreResult<()> {
    fs::create_dir_all(dir).map_err(|e| StoreError::io("creating unpack directory", e))?;
    let file =
        File::open(archive_path).map_err(|e| StoreError::io("opening backup archive", e))?;
    Archive::new(file)
        .unpack(dir)
        .map_err(|e| StoreError::io("unpacking backup archive", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_store::HeapStore;

    fn seed(store: &HeapStore, keys: &[(&str, Lsn)]) {
        let mut tx = store.create_transaction().unwrap();
        for (key, lsn) in keys {
            tx.insert("user", key, b"v", *lsn).unwrap();
        }
        tx.commit().unwrap();
    }

    fn manager() -> BackupManager {
        BackupManager::new(Uuid::new_v4())
    }

    #[test]
    fn test_full_backup_starts_chain_at_index_zero() {
        let temp = tempfile::TempDir::new().unwrap();
        let store = HeapStore::new();
        seed(&store, &[("a", 1)]);

        let data = manager()
            .backup(&store, &temp.path().join("b0"), BackupOption::Full)
            .unwrap()
            .unwrap();
        assert_eq!(data.kind, BackupKind::Full);
        assert_eq!(data.index, 0);
        assert!(temp.path().join("b0").join(RESTORE_METADATA_FILE).exists());
    }

    #[test]
    fn test_incremental_requires_arming() {
        let temp = tempfile::TempDir::new().unwrap();
        let store = HeapStore::new();
        seed(&store, &[("a", 1)]);

        let err = manager()
            .backup(&store, temp.path(), BackupOption::Incremental)
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingFullBackup));
    }

    #[test]
    fn test_incremental_indices_increase() {
        let temp = tempfile::TempDir::new().unwrap();
        let store = HeapStore::new();
        seed(&store, &[("a", 1)]);
        let mgr = manager();

        let full = mgr
            .backup(&store, &temp.path().join("b0"), BackupOption::Full)
            .unwrap()
            .unwrap();
        seed(&store, &[("b", 2)]);
        let inc1 = mgr
            .backup(&store, &temp.path().join("b1"), BackupOption::Incremental)
            .unwrap()
            .unwrap();
        seed(&store, &[("c", 3)]);
        let inc2 = mgr
            .backup(&store, &temp.path().join("b2"), BackupOption::Incremental)
            .unwrap()
            .unwrap();

        assert_eq!((inc1.index, inc2.index), (1, 2));
        assert_eq!(inc1.chain_id, full.chain_id);
        assert_eq!(inc2.chain_id, full.chain_id);
    }

    #[test]
    fn test_truncate_logs_only_writes_no_metadata() {
        let temp = tempfile::TempDir::new().unwrap();
        let store = HeapStore::new();
        seed(&store, &[("a", 1)]);

        let data = manager()
            .backup(&store, temp.path(), BackupOption::TruncateLogsOnly)
            .unwrap();
        assert!(data.is_none());
        assert!(!temp.path().join(RESTORE_METADATA_FILE).exists());
    }

    fn build_chain(temp: &tempfile::TempDir) -> HeapStore {
        let store = HeapStore::new();
        let mgr = manager();
        seed(&store, &[("a", 1)]);
        mgr.backup(&store, &temp.path().join("b0"), BackupOption::Full)
            .unwrap();
        seed(&store, &[("b", 2)]);
        mgr.backup(&store, &temp.path().join("b1"), BackupOption::Incremental)
            .unwrap();
        seed(&store, &[("c", 3)]);
        mgr.backup(&store, &temp.path().join("b2"), BackupOption::Incremental)
            .unwrap();
        store
    }

    #[test]
    fn test_valid_chain_discovers_in_order() {
        let temp = tempfile::TempDir::new().unwrap();
        build_chain(&temp);

        let chain = discover_and_validate(temp.path()).unwrap();
        let indices: Vec<u64> = chain.entries.iter().map(|(_, d)| d.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_chain_gap_detected() {
        let temp = tempfile::TempDir::new().unwrap();
        build_chain(&temp);
        fs::remove_dir_all(temp.path().join("b1")).unwrap();

        let err = discover_and_validate(temp.path()).unwrap_err();
        match err {
            StoreError::InvalidBackupChain(msg) => assert!(msg.contains("missing backup index 1")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_index_detected() {
        let temp = tempfile::TempDir::new().unwrap();
        build_chain(&temp);
        // Duplicate index 0 by copying b0's metadata into a new directory.
        let dup = temp.path().join("b0_copy");
        fs::create_dir_all(&dup).unwrap();
        fs::copy(
            temp.path().join("b0").join(RESTORE_METADATA_FILE),
            dup.join(RESTORE_METADATA_FILE),
        )
        .unwrap();

        let err = discover_and_validate(temp.path()).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateBackups(_)));
    }

    #[test]
    fn test_foreign_chain_id_detected() {
        let temp = tempfile::TempDir::new().unwrap();
        build_chain(&temp);

        let mut data = BackupRestoreData::read_from(&temp.path().join("b2")).unwrap();
        data.chain_id = Uuid::new_v4();
        data.write_to(&temp.path().join("b2")).unwrap();

        let err = discover_and_validate(temp.path()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidBackupChain(_)));
    }

    #[test]
    fn test_load_chain_rows_merges_incrementals() {
        let temp = tempfile::TempDir::new().unwrap();
        build_chain(&temp);

        let chain = discover_and_validate(temp.path()).unwrap();
        let rows = load_chain_rows(&chain).unwrap();
        let mut keys: Vec<&str> = rows
            .iter()
            .filter(|r| r.data_type == "user")
            .map(|r| r.key.as_str())
            .collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(restored_progress(&rows), 3);
    }

    #[test]
    fn test_checksum_mismatch_rejected() {
        let temp = tempfile::TempDir::new().unwrap();
        let store = HeapStore::new();
        seed(&store, &[("a", 1)]);
        manager()
            .backup(&store, &temp.path().join("b0"), BackupOption::Full)
            .unwrap();

        fs::write(temp.path().join("b0").join(FULL_BACKUP_FILE), b"[]").unwrap();
        let chain = discover_and_validate(temp.path()).unwrap();
        let err = load_chain_rows(&chain).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRestoreData(_)));
    }

    #[test]
    fn test_pack_unpack_roundtrip() {
        let temp = tempfile::TempDir::new().unwrap();
        let store = HeapStore::new();
        seed(&store, &[("a", 1)]);
        let backup_dir = temp.path().join("b0");
        manager()
            .backup(&store, &backup_dir, BackupOption::Full)
            .unwrap();

        let archive = temp.path().join("backup.tar");
        pack_backup(&backup_dir, &archive).unwrap();

        let out = temp.path().join("unpacked");
        unpack_backup(&archive, &out).unwrap();
        let data = BackupRestoreData::read_from(&out).unwrap();
        assert_eq!(data.index, 0);
        assert!(out.join(FULL_BACKUP_FILE).exists());
    }
}
