//! Safe restore from a validated backup chain
//!
//! Restore never touches the live store until the backup has survived a
//! validation pass: the chain is validated, its row set is materialized
//! into a disposable store instance, and (when requested) the restored
//! progress is checked against the store's current progress so a stale
//! backup cannot silently roll data back. Only then is the live store
//! torn down and rebuilt. Progress-vector history is deleted from the
//! restored rows so secondaries are forced onto a full copy instead of
//! trusting a restored-but-foreign epoch history.

use std::path::Path;

use crate::backup::{discover_and_validate, load_chain_rows, restored_progress};
use crate::epoch::scrub_progress_rows;
use crate::errors::{StoreError, StoreResult};
use crate::local_store::{store_from_rows, LocalStoreHandle, LocalStoreKind, Lsn};
use crate::observability::Logger;
use crate::transport::{FaultKind, FaultLatch};

#[derive(Debug, Clone, Copy)]
pub struct RestoreSettings {
    /// Refuse a backup whose progress is behind the store's current
    /// progress.
    pub enforce_lsn_check: bool,
    /// Reopen the rebuilt store in place instead of reporting a
    /// transient fault and letting the platform restart the replica.
    pub inline_reopen: bool,
}

impl Default for RestoreSettings {
    fn default() -> Self {
        Self {
            enforce_lsn_check: true,
            inline_reopen: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RestoreOutcome {
    /// Highest LSN in the restored data.
    pub restored_progress: Lsn,
    /// True when the store was swapped in without a replica restart.
    pub reopened_inline: bool,
}

/// Restores `backup_dir` (a single merged backup or a chain directory)
/// over the store behind `handle`.
pub fn restore_from_backup(
    handle: &LocalStoreHandle,
    kind: LocalStoreKind,
    data_dir: &Path,
    backup_dir: &Path,
    current_progress: Lsn,
    settings: RestoreSettings,
    fault: &FaultLatch,
) -> StoreResult<RestoreOutcome> {
    let chain = discover_and_validate(backup_dir)?;
    let mut rows = load_chain_rows(&chain)?;
    let progress = restored_progress(&rows);

    // Validation restore: prove the chain materializes into a readable
    // store before anything live is touched.
    {
        let disposable = store_from_rows(LocalStoreKind::Heap, data_dir, rows.clone())?;
        let tx = disposable.create_transaction()?;
        let readable = tx.enumerate_from_lsn(0)?.len();
        tx.rollback();
        if readable != rows.len() {
            return Err(StoreError::InvalidRestoreData(
                "validation restore lost rows".into(),
            ));
        }
        if disposable.last_change_lsn()? != progress {
            return Err(StoreError::InvalidRestoreData(
                "validation restore disagrees with chain progress".into(),
            ));
        }
        disposable.terminate()?;
    }

    if settings.enforce_lsn_check && progress < current_progress {
        return Err(StoreError::RestoreSafeCheckFailed(format!(
            "backup progress {} is behind current progress {}",
            progress, current_progress
        )));
    }

    scrub_progress_rows(&mut rows);

    if let Some(old) = handle.take() {
        old.terminate()?;
        old.drain();
    }

    let fresh = store_from_rows(kind, data_dir, rows)?;
    let reopened_inline = if settings.inline_reopen {
        handle.replace(fresh);
        true
    } else {
        // Data is on disk; the replica restarts and reopens from it.
        fresh.terminate()?;
        fault.report(FaultKind::Transient);
        false
    };

    Logger::info(
        "REPL_RESTORE_COMPLETED",
        &[
            ("progress", progress.to_string().as_str()),
            ("inline", if reopened_inline { "true" } else { "false" }),
        ],
    );
    Ok(RestoreOutcome {
        restored_progress: progress,
        reopened_inline,
    })
}
