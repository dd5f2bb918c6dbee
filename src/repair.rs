//! Repair policy for corrupt or locked store files at open
//!
//! Repair-eligible open failures (`DatabaseFilesCorrupted`, `StoreInUse`)
//! are intercepted exactly once, at open, before the generic fault path
//! sees them. A configured policy decides whether to drop the local data
//! and permanent-fault the replica so the platform rebuilds it, or to
//! restart the process for external repair. Without a configured and
//! enabled policy the original error is surfaced unmodified.

use std::fs;
use std::path::Path;

use chrono::Utc;

use crate::backup::pack_backup;
use crate::errors::StoreError;
use crate::observability::Logger;
use crate::transport::{FaultKind, FaultLatch};

/// What to do about a repair-eligible open failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairAction {
    /// Back up the damaged files best-effort, delete the data directory,
    /// and report a permanent fault so the replica is rebuilt fresh.
    DropDatabase,
    /// Report a transient fault so the hosting process restarts and
    /// retries the open after external repair.
    TerminateProcess,
    /// Leave the files alone and surface the original error.
    None,
}

/// Host-supplied decision on repair-eligible open failures.
pub trait RepairPolicy: Send + Sync {
    fn decide(&self, error: &StoreError) -> RepairAction;
}

/// A policy that always returns the same action (tests, simple hosts).
pub struct FixedRepairPolicy(pub RepairAction);

impl RepairPolicy for FixedRepairPolicy {
    fn decide(&self, _error: &StoreError) -> RepairAction {
        self.0
    }
}

/// Runs the configured policy against an open failure and returns the
/// error to surface to the caller. Non-eligible errors pass through
/// untouched, as do all errors when no policy applies.
pub fn handle_open_failure(
    policy: Option<&dyn RepairPolicy>,
    enabled: bool,
    error: StoreError,
    data_dir: &Path,
    repair_backup_dir: Option<&Path>,
    fault: &FaultLatch,
) -> StoreError {
    if !error.is_repair_eligible() {
        return error;
    }
    let policy = match policy {
        Some(p) if enabled => p,
        _ => return error,
    };

    match policy.decide(&error) {
        RepairAction::None => error,
        RepairAction::TerminateProcess => {
            Logger::warn(
                "REPL_REPAIR_RESTART",
                &[("error", error.to_string().as_str())],
            );
            fault.report(FaultKind::Transient);
            error
        }
        RepairAction::DropDatabase => {
            if let Some(backup_dir) = repair_backup_dir {
                salvage_files(data_dir, backup_dir);
            }
            if let Err(e) = fs::remove_dir_all(data_dir) {
                Logger::warn(
                    "REPL_REPAIR_DROP_FAILED",
                    &[("error", e.to_string().as_str())],
                );
            }
            Logger::warn(
                "REPL_REPAIR_DROPPED",
                &[("error", error.to_string().as_str())],
            );
            fault.report(FaultKind::Permanent);
            error
        }
    }
}

/// Best-effort archive of the damaged files before they are dropped.
/// Failures here are logged and ignored; repair proceeds either way.
fn salvage_files(data_dir: &Path, backup_dir: &Path) {
    if let Err(e) = fs::create_dir_all(backup_dir) {
        Logger::warn(
            "REPL_REPAIR_SALVAGE_FAILED",
            &[("error", e.to_string().as_str())],
        );
        return;
    }
    let archive = backup_dir.join(format!("salvage-{}.tar", Utc::now().timestamp()));
    match pack_backup(data_dir, &archive) {
        Ok(()) => Logger::info(
            "REPL_REPAIR_SALVAGED",
            &[("archive", archive.display().to_string().as_str())],
        ),
        Err(e) => Logger::warn(
            "REPL_REPAIR_SALVAGE_FAILED",
            &[("error", e.to_string().as_str())],
        ),
    }
}
