//! Epoch and progress vector tracking
//!
//! An epoch identifies a leadership generation. The progress vector is
//! the ordered history of `(epoch, last LSN in that epoch)` entries and
//! is the reference used to validate copy and restore safety. The
//! current epoch is cached in memory because it is read on the hot path
//! far more often than it changes.

use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::errors::{StoreError, StoreResult};
use crate::local_store::{LocalStore, Lsn, StoreTransaction};
use crate::metadata::{self, CURRENT_EPOCH_KEY, META_TYPE, PROGRESS_VECTOR_KEY};

/// Leadership generation identifier. Ordering is lexicographic on
/// `(data_loss_number, configuration_number)` and must never decrease
/// across the progress vector.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Epoch {
    pub data_loss_number: u64,
    pub configuration_number: u64,
}

impl Epoch {
    pub const ZERO: Epoch = Epoch {
        data_loss_number: 0,
        configuration_number: 0,
    };

    pub fn new(data_loss_number: u64, configuration_number: u64) -> Self {
        Self {
            data_loss_number,
            configuration_number,
        }
    }
}

impl std::fmt::Display for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.data_loss_number, self.configuration_number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressVectorEntry {
    pub epoch: Epoch,
    pub last_lsn_in_epoch: Lsn,
}

#[derive(Debug, Default)]
struct EpochCache {
    current: Epoch,
    vector: Vec<ProgressVectorEntry>,
}

/// Caches the current epoch and persists the progress vector as a
/// metadata row. The cache survives open/close cycles of the engine
/// instance and is re-derived from persisted metadata on each open.
#[derive(Debug, Default)]
pub struct EpochTracker {
    cache: RwLock<EpochCache>,
}

impl EpochTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reloads the cache from the persisted epoch rows. The vector holds
    /// only closed-out epochs, so the current epoch lives in its own row;
    /// stores written before that row existed fall back to the vector
    /// tail.
    pub fn recover(&self, tx: &dyn StoreTransaction) -> StoreResult<()> {
        let vector: Vec<ProgressVectorEntry> =
            metadata::read_data(tx, META_TYPE, PROGRESS_VECTOR_KEY)?.unwrap_or_default();
        let current = match metadata::read_data::<Epoch>(tx, META_TYPE, CURRENT_EPOCH_KEY)? {
            Some(epoch) => epoch,
            None => vector.last().map(|e| e.epoch).unwrap_or(Epoch::ZERO),
        };
        let mut cache = self.write_cache()?;
        cache.current = current;
        cache.vector = vector;
        Ok(())
    }

    /// Records a leadership change: closes out the current epoch at
    /// `previous_epoch_last_lsn`, durably persists the extended vector
    /// and the new current epoch, and only then switches the cache to
    /// `new_epoch`. A failed commit leaves the cache untouched.
    pub fn update_epoch(
        &self,
        store: &dyn LocalStore,
        new_epoch: Epoch,
        previous_epoch_last_lsn: Lsn,
    ) -> StoreResult<()> {
        let mut cache = self.write_cache()?;
        if new_epoch < cache.current {
            return Err(StoreError::InvalidOperation(format!(
                "epoch moved backwards: {} -> {}",
                cache.current, new_epoch
            )));
        }
        if new_epoch == cache.current {
            return Ok(());
        }

        let entry = ProgressVectorEntry {
            epoch: cache.current,
            last_lsn_in_epoch: previous_epoch_last_lsn,
        };
        let mut vector = cache.vector.clone();
        // The entry for the closing epoch replaces any stale record of it.
        vector.retain(|e| e.epoch != entry.epoch);
        vector.push(entry);

        let mut tx = store.create_transaction()?;
        metadata::write_data(
            tx.as_mut(),
            META_TYPE,
            PROGRESS_VECTOR_KEY,
            &vector,
            previous_epoch_last_lsn,
        )?;
        metadata::write_data(
            tx.as_mut(),
            META_TYPE,
            CURRENT_EPOCH_KEY,
            &new_epoch,
            previous_epoch_last_lsn,
        )?;
        tx.commit()?;

        cache.vector = vector;
        cache.current = new_epoch;
        Ok(())
    }

    /// Persists the vector extended with a provisional entry closing the
    /// current epoch at `up_to_lsn`, without switching epochs. Copy
    /// state must never be streamed for an LSN range that has not first
    /// been durably reflected in the progress vector.
    pub fn persist_progress(
        &self,
        tx: &mut dyn StoreTransaction,
        up_to_lsn: Lsn,
    ) -> StoreResult<()> {
        let mut cache = self.write_cache()?;
        let mut vector = cache.vector.clone();
        vector.retain(|e| e.epoch != cache.current);
        vector.push(ProgressVectorEntry {
            epoch: cache.current,
            last_lsn_in_epoch: up_to_lsn,
        });
        metadata::write_data(tx, META_TYPE, PROGRESS_VECTOR_KEY, &vector, up_to_lsn)?;
        cache.vector = vector;
        Ok(())
    }

    pub fn current_epoch(&self) -> Epoch {
        self.cache.read().map(|c| c.current).unwrap_or(Epoch::ZERO)
    }

    pub fn progress_vector(&self) -> Vec<ProgressVectorEntry> {
        self.cache
            .read()
            .map(|c| c.vector.clone())
            .unwrap_or_default()
    }

    /// Highest LSN closed out by any recorded epoch.
    pub fn last_recorded_progress(&self) -> Lsn {
        self.cache
            .read()
            .map(|c| c.vector.iter().map(|e| e.last_lsn_in_epoch).max().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Clears both cache and persisted history. Restored data must not
    /// carry a foreign epoch history, and a freshly installed full copy
    /// starts over from the stream's own progress.
    pub fn reset(&self, tx: &mut dyn StoreTransaction) -> StoreResult<()> {
        metadata::delete_data(tx, META_TYPE, PROGRESS_VECTOR_KEY)?;
        metadata::delete_data(tx, META_TYPE, CURRENT_EPOCH_KEY)?;
        let mut cache = self.write_cache()?;
        cache.current = Epoch::ZERO;
        cache.vector.clear();
        Ok(())
    }

    fn write_cache(&self) -> StoreResult<std::sync::RwLockWriteGuard<'_, EpochCache>> {
        self.cache
            .write()
            .map_err(|_| StoreError::StoreFatal("epoch cache lock poisoned".into()))
    }
}

/// Removes progress vector entries from restored rows so secondaries of
/// the restored replica are forced onto a full copy instead of trusting
/// the backup's epoch history.
pub fn scrub_progress_rows(rows: &mut Vec<crate::local_store::StoreRow>) {
    rows.retain(|r| {
        !(r.data_type == META_TYPE
            && (r.key == PROGRESS_VECTOR_KEY || r.key == CURRENT_EPOCH_KEY))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_store::{HeapStore, LocalStore};

    #[test]
    fn test_epoch_ordering() {
        assert!(Epoch::new(1, 0) > Epoch::new(0, 9));
        assert!(Epoch::new(1, 2) > Epoch::new(1, 1));
        assert_eq!(Epoch::new(1, 1), Epoch::new(1, 1));
    }

    #[test]
    fn test_update_epoch_persists_and_recovers() {
        let store = HeapStore::new();
        let tracker = EpochTracker::new();

        tracker.update_epoch(&store, Epoch::new(0, 1), 0).unwrap();
        tracker.update_epoch(&store, Epoch::new(0, 2), 17).unwrap();

        assert_eq!(tracker.current_epoch(), Epoch::new(0, 2));

        // A fresh tracker derives the same state from the metadata rows,
        // including the open epoch the vector does not yet close out.
        let other = EpochTracker::new();
        let tx = store.create_transaction().unwrap();
        other.recover(tx.as_ref()).unwrap();
        assert_eq!(other.current_epoch(), Epoch::new(0, 2));
        assert_eq!(other.last_recorded_progress(), 17);
        assert_eq!(other.progress_vector().len(), 2);
    }

    #[test]
    fn test_epoch_cannot_move_backwards() {
        let store = HeapStore::new();
        let tracker = EpochTracker::new();

        tracker.update_epoch(&store, Epoch::new(2, 0), 5).unwrap();
        let err = tracker
            .update_epoch(&store, Epoch::new(1, 9), 6)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidOperation(_)));
    }

    #[test]
    fn test_same_epoch_is_noop() {
        let store = HeapStore::new();
        let tracker = EpochTracker::new();

        tracker.update_epoch(&store, Epoch::new(0, 1), 0).unwrap();
        tracker.update_epoch(&store, Epoch::new(0, 1), 9).unwrap();

        assert_eq!(tracker.progress_vector().len(), 1);
    }

    #[test]
    fn test_failed_commit_leaves_cache_unchanged() {
        let temp = tempfile::TempDir::new().unwrap();
        let dir = temp.path().join("store");
        let store = crate::local_store::FileStore::open(&dir).unwrap();
        let tracker = EpochTracker::new();

        // Commit cannot rewrite the row file once the directory is gone.
        std::fs::remove_dir_all(&dir).unwrap();
        let err = tracker
            .update_epoch(&store, Epoch::new(0, 1), 0)
            .unwrap_err();
        assert!(matches!(err, StoreError::StoreFatal(_)));
        assert_eq!(tracker.current_epoch(), Epoch::ZERO);
        assert!(tracker.progress_vector().is_empty());
    }

    #[test]
    fn test_reset_clears_history() {
        let store = HeapStore::new();
        let tracker = EpochTracker::new();

        tracker.update_epoch(&store, Epoch::new(0, 1), 3).unwrap();
        let mut tx = store.create_transaction().unwrap();
        tracker.reset(tx.as_mut()).unwrap();
        tx.commit().unwrap();

        assert_eq!(tracker.current_epoch(), Epoch::ZERO);

        let other = EpochTracker::new();
        let tx = store.create_transaction().unwrap();
        other.recover(tx.as_ref()).unwrap();
        assert!(other.progress_vector().is_empty());
        assert_eq!(other.current_epoch(), Epoch::ZERO);
    }
}
