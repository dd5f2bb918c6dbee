//! Engine Configuration
//!
//! One configuration struct built at open and threaded through component
//! constructors. Nothing in the engine consults global mutable state.
//!
//! The numeric values here are operational tuning constants, not
//! correctness invariants; tests that exercise thresholds set small values
//! explicitly.

use std::path::PathBuf;
use std::time::Duration;

use crate::local_store::LocalStoreKind;

/// Commit batching configuration.
#[derive(Debug, Clone)]
pub struct GroupCommitConfig {
    /// Whether batched (grouped) transactions are available. When false,
    /// `create_simple_transaction` falls back to an ungrouped transaction.
    pub enabled: bool,

    /// Pending-transaction count above which new simple transactions are
    /// diverted into the current group.
    pub low_watermark: usize,

    /// Pending-transaction count above which a timer-driven close is
    /// extended instead of closing, trading latency for batch efficiency.
    pub high_watermark: usize,

    /// Byte size at which the current group is force-closed.
    pub size_limit_bytes: usize,

    /// Interval after which a non-empty group is closed by the timer.
    pub close_interval: Duration,
}

impl Default for GroupCommitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            low_watermark: 8,
            high_watermark: 64,
            size_limit_bytes: 4 * 1024 * 1024,
            close_interval: Duration::from_millis(100),
        }
    }
}

/// Tombstone garbage-collection configuration.
#[derive(Debug, Clone)]
pub struct TombstoneConfig {
    /// Tombstone volume at or below which cleanup passes are skipped.
    pub cleanup_limit: usize,

    /// Cap on tombstones removed in a single cleanup pass.
    pub max_per_cleanup: usize,

    /// Use the version 2 key format (zero-padded LSN keys, streaming
    /// cleanup). When false, the version 1 format (type + key) is used.
    /// Exactly one format is active per store instance; recovery migrates
    /// lazily.
    pub use_v2_format: bool,

    /// Batch size for tombstone migration transactions during recovery.
    pub migration_batch_size: usize,
}

impl Default for TombstoneConfig {
    fn default() -> Self {
        Self {
            cleanup_limit: 500_000,
            max_per_cleanup: 100_000,
            use_v2_format: true,
            migration_batch_size: 1024,
        }
    }
}

/// Engine configuration, constructed once per open.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Which local store adapter to construct. Selected once here; no
    /// runtime type inspection elsewhere.
    pub local_store_kind: LocalStoreKind,

    /// Data directory for file-backed local stores and staged rebuilds.
    pub data_dir: PathBuf,

    /// Commit batching tunables.
    pub group_commit: GroupCommitConfig,

    /// Tombstone GC tunables.
    pub tombstones: TombstoneConfig,

    /// Byte budget per copy-state page.
    pub copy_batch_size_bytes: usize,

    /// Whether `close()` releases the underlying local store. The
    /// backward-compatible behavior of leaving the inner store open for a
    /// demotion sequence is opt-in, never implicit.
    pub close_releases_local_store: bool,

    /// Whether the repair policy (if one is configured) may act on
    /// repair-eligible open failures.
    pub repair_enabled: bool,

    /// Directory for the best-effort backup taken before a repair drop.
    pub repair_backup_dir: Option<PathBuf>,
}

impl StoreConfig {
    /// In-memory configuration rooted at `data_dir` (used by tests and by
    /// hosts that supply their own persistence).
    pub fn in_memory(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            local_store_kind: LocalStoreKind::Heap,
            data_dir: data_dir.into(),
            group_commit: GroupCommitConfig::default(),
            tombstones: TombstoneConfig::default(),
            copy_batch_size_bytes: 1024 * 1024,
            close_releases_local_store: true,
            repair_enabled: false,
            repair_backup_dir: None,
        }
    }

    /// File-backed configuration rooted at `data_dir`.
    pub fn file_backed(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            local_store_kind: LocalStoreKind::File,
            ..Self::in_memory(data_dir)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_group_commit_enabled() {
        let config = GroupCommitConfig::default();
        assert!(config.enabled);
        assert!(config.low_watermark < config.high_watermark);
    }

    #[test]
    fn test_in_memory_defaults() {
        let config = StoreConfig::in_memory("/tmp/replistore");
        assert_eq!(config.local_store_kind, LocalStoreKind::Heap);
        assert!(config.close_releases_local_store);
        assert!(!config.repair_enabled);
    }

    #[test]
    fn test_file_backed_kind() {
        let config = StoreConfig::file_backed("/tmp/replistore");
        assert_eq!(config.local_store_kind, LocalStoreKind::File);
    }
}
