//! The replicated store engine
//!
//! `ReplicatedStore` wires the pieces together: the local store behind a
//! swappable handle, the replica-role state machine, the transaction
//! engine with commit batching, tombstone bookkeeping, the epoch tracker,
//! and the backup manager. Role changes, copy installs, restore, and
//! close all run through here so that the ordering rules between them
//! (pump before promotion, drained transactions before demotion, group
//! close before either) live in one place.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::backup::{BackupManager, BackupRestoreData};
use crate::config::StoreConfig;
use crate::copy::{
    self, CopyMode, CopyStatePage, SecondaryPump,
};
use crate::epoch::{Epoch, EpochTracker, ProgressVectorEntry};
use crate::errors::{StoreError, StoreResult};
use crate::local_store::{
    create_local_store, open_local_store, BackupOption, LocalStoreHandle, Lsn, StoreRow,
};
use crate::observability::Logger;
use crate::repair::{self, RepairPolicy};
use crate::restore::{restore_from_backup, RestoreOutcome, RestoreSettings};
use crate::state_machine::{
    OpenMode, ReplicaRole, ReplicaState, ReplicaStateMachine, StoreEvent,
};
use crate::transport::{FaultLatch, PartitionHandle, ReplicationTransport};
use crate::txn::{EngineTransaction, Transaction, TransactionEngine, WriteContext};

/// A replica of one partition: local store plus replication plumbing.
pub struct ReplicatedStore {
    config: StoreConfig,
    ctx: Arc<WriteContext>,
    txns: TransactionEngine,
    epoch: EpochTracker,
    backups: BackupManager,
    repair_policy: Option<Box<dyn RepairPolicy>>,
    pump: Mutex<Option<SecondaryPump>>,
}

impl ReplicatedStore {
    /// Opens a replica. The store always opens in the secondary role;
    /// the platform promotes it separately.
    pub fn open(
        config: StoreConfig,
        partition_id: Uuid,
        partition: Arc<dyn PartitionHandle>,
        transport: Arc<dyn ReplicationTransport>,
        mode: OpenMode,
        repair_policy: Option<Box<dyn RepairPolicy>>,
    ) -> StoreResult<Self> {
        let fault = FaultLatch::new(partition.clone());

        let store = match Self::open_inner(&config, mode) {
            Ok(store) => store,
            Err(err) => {
                return Err(repair::handle_open_failure(
                    repair_policy.as_deref(),
                    config.repair_enabled,
                    err,
                    &config.data_dir,
                    config.repair_backup_dir.as_deref(),
                    &fault,
                ));
            }
        };

        let tombstones = crate::tombstone::TombstoneManager::new(config.tombstones.clone());
        tombstones.recover(store.as_ref())?;

        let epoch = EpochTracker::new();
        {
            let tx = store.create_transaction()?;
            epoch.recover(tx.as_ref())?;
            tx.rollback();
        }

        let state_machine = Arc::new(ReplicaStateMachine::new());
        state_machine.post_event(StoreEvent::Open(mode))?.wait()?;

        let ctx = Arc::new(WriteContext {
            store: LocalStoreHandle::new(store),
            transport,
            partition,
            state_machine,
            tombstones,
            fault,
            read_only: AtomicBool::new(false),
        });
        let txns = TransactionEngine::new(ctx.clone(), config.group_commit.clone());

        Logger::info(
            "REPL_OPENED",
            &[
                ("partition", partition_id.to_string().as_str()),
                ("mode", &format!("{:?}", mode)),
            ],
        );
        Ok(Self {
            config,
            ctx,
            txns,
            epoch,
            backups: BackupManager::new(partition_id),
            repair_policy,
            pump: Mutex::new(None),
        })
    }

    fn open_inner(
        config: &StoreConfig,
        mode: OpenMode,
    ) -> StoreResult<Arc<dyn crate::local_store::LocalStore>> {
        let store = match mode {
            OpenMode::CreateNew => create_local_store(config.local_store_kind, &config.data_dir)?,
            OpenMode::OpenExisting => {
                open_local_store(config.local_store_kind, &config.data_dir)?
            }
        };
        // A replay that crashed between its markers cannot be served.
        copy::check_partial_copy_markers(store.as_ref())?;
        Ok(store)
    }

    pub fn current_state(&self) -> ReplicaState {
        self.ctx.state_machine.current_state()
    }

    pub fn current_epoch(&self) -> Epoch {
        self.epoch.current_epoch()
    }

    pub fn progress_vector(&self) -> Vec<ProgressVectorEntry> {
        self.epoch.progress_vector()
    }

    /// Highest LSN applied by any committed transaction.
    pub fn last_committed_sequence_number(&self) -> StoreResult<Lsn> {
        self.ctx.store.acquire()?.last_change_lsn()
    }

    /// Drives the replica to `role`. Promotion waits for the replication
    /// pump to detach; demotion waits for outstanding transactions.
    pub fn change_role(&self, role: ReplicaRole) -> StoreResult<ReplicaState> {
        let state = match role {
            ReplicaRole::None => self
                .ctx
                .state_machine
                .post_event(StoreEvent::ChangeRole(ReplicaRole::None))?
                .wait()?,
            ReplicaRole::Primary => {
                let outcome = self
                    .ctx
                    .state_machine
                    .post_event(StoreEvent::ChangeRole(ReplicaRole::Primary))?;
                // Detaching the pump posts CopyPumpClosed, which unparks
                // the promotion if it had to wait.
                self.stop_pump();
                outcome.wait()?
            }
            ReplicaRole::Secondary => {
                self.txns.close_current_group();
                let state = self
                    .ctx
                    .state_machine
                    .post_event(StoreEvent::ChangeRole(ReplicaRole::Secondary))?
                    .wait()?;
                if state == ReplicaState::SecondaryActive {
                    self.start_pump()?;
                }
                state
            }
        };
        Logger::info(
            "REPL_ROLE_CHANGED",
            &[
                ("role", &format!("{:?}", role)),
                ("state", &format!("{:?}", state)),
            ],
        );
        Ok(state)
    }

    fn start_pump(&self) -> StoreResult<()> {
        let mut slot = match self.pump.lock() {
            Ok(slot) => slot,
            Err(_) => return Err(StoreError::StoreFatal("pump lock poisoned".into())),
        };
        if slot.is_none() {
            *slot = Some(SecondaryPump::start(self.ctx.clone())?);
        }
        Ok(())
    }

    fn stop_pump(&self) {
        let taken = self.pump.lock().ok().and_then(|mut slot| slot.take());
        if let Some(mut pump) = taken {
            pump.stop();
        }
    }

    /// Closes the replica: pump detached, the open commit group flushed,
    /// outstanding transactions drained. Whether the local store itself
    /// is released is a configuration choice.
    pub fn close(&self) -> StoreResult<()> {
        self.stop_pump();
        self.txns.close_current_group();
        self.ctx.state_machine.post_event(StoreEvent::Close)?.wait()?;

        if self.config.close_releases_local_store {
            if let Some(store) = self.ctx.store.take() {
                store.terminate()?;
                store.drain();
            }
        } else if let Ok(store) = self.ctx.store.acquire() {
            store.drain();
        }
        Logger::info("REPL_CLOSED", &[]);
        Ok(())
    }

    // ---- transactions ------------------------------------------------

    /// An ungrouped read-write transaction.
    pub fn create_transaction(&self) -> StoreResult<Transaction> {
        self.txns.create_transaction()
    }

    /// A transaction eligible for commit batching.
    pub fn create_simple_transaction(&self) -> StoreResult<EngineTransaction> {
        self.txns.create_simple_transaction()
    }

    /// Pressure-routed transaction creation: grouped under load,
    /// ungrouped when idle. Pair each success with
    /// [`ReplicatedStore::note_finished`].
    pub fn begin(&self) -> StoreResult<EngineTransaction> {
        self.txns.begin()
    }

    pub fn note_finished(&self) {
        self.txns.note_finished()
    }

    // ---- epoch -------------------------------------------------------

    /// Records a leadership change. `previous_epoch_last_lsn` closes the
    /// outgoing epoch in the progress vector.
    pub fn update_epoch(&self, new_epoch: Epoch, previous_epoch_last_lsn: Lsn) -> StoreResult<()> {
        let store = self.ctx.store.acquire()?;
        self.epoch
            .update_epoch(store.as_ref(), new_epoch, previous_epoch_last_lsn)
    }

    // ---- copy --------------------------------------------------------

    /// Primary side: which copy flavor a secondary at `secondary_progress`
    /// needs. Progress behind the tombstone low watermark forces a full
    /// copy because the deletes it is missing are already collected.
    pub fn copy_mode_for(&self, secondary_progress: Lsn) -> CopyMode {
        copy::decide_copy_mode(secondary_progress, self.ctx.tombstones.low_watermark())
    }

    /// Primary side: size-bounded copy pages covering `(from_lsn, up_to_lsn]`.
    pub fn build_copy_pages(&self, from_lsn: Lsn, up_to_lsn: Lsn) -> StoreResult<Vec<CopyStatePage>> {
        let store = self.ctx.store.acquire()?;
        copy::build_copy_pages(
            store.as_ref(),
            &self.ctx.tombstones,
            &self.epoch,
            from_lsn,
            up_to_lsn,
            self.config.copy_batch_size_bytes,
        )
    }

    /// Secondary side: replace the local store with the copied state.
    pub fn install_full_copy(&self, pages: Vec<CopyStatePage>) -> StoreResult<()> {
        copy::install_full_copy(
            &self.ctx.store,
            self.config.local_store_kind,
            &self.config.data_dir,
            pages,
            &self.epoch,
        )
    }

    /// Secondary side: replay copied operations against the live store.
    pub fn replay_partial_copy(&self, pages: Vec<CopyStatePage>) -> StoreResult<()> {
        let store = self.ctx.store.acquire()?;
        copy::replay_partial_copy(store.as_ref(), &self.ctx.tombstones, pages)
    }

    /// Secondary side, file-stream flavor. The rebuild variant holds the
    /// replica read-only while it streams rows into a fresh store.
    pub fn file_stream_install(&self, rows: Vec<StoreRow>, rebuild: bool) -> StoreResult<()> {
        if !rebuild {
            return copy::file_stream_install_in_place(
                &self.ctx.store,
                self.config.local_store_kind,
                &self.config.data_dir,
                rows,
                &self.epoch,
            );
        }
        self.ctx
            .read_only
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let result = copy::file_stream_rebuild(
            &self.ctx.store,
            self.config.local_store_kind,
            &self.config.data_dir,
            rows,
            self.config.copy_batch_size_bytes,
            &self.epoch,
        );
        self.ctx
            .read_only
            .store(false, std::sync::atomic::Ordering::SeqCst);
        result
    }

    // ---- backup / restore --------------------------------------------

    pub fn backup(&self, dir: &Path, option: BackupOption) -> StoreResult<Option<BackupRestoreData>> {
        let store = self.ctx.store.acquire()?;
        self.backups.backup(store.as_ref(), dir, option)
    }

    /// Restores from a backup chain at `backup_dir`. The in-memory epoch
    /// cache survives the restore; the persisted progress history does
    /// not travel with the restored rows.
    pub fn restore(&self, backup_dir: &Path, settings: RestoreSettings) -> StoreResult<RestoreOutcome> {
        self.stop_pump();
        self.txns.close_current_group();
        let current = self.ctx.store.acquire()?.last_change_lsn()?;
        restore_from_backup(
            &self.ctx.store,
            self.config.local_store_kind,
            &self.config.data_dir,
            backup_dir,
            current,
            settings,
            &self.ctx.fault,
        )
    }

    pub fn repair_policy_configured(&self) -> bool {
        self.repair_policy.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InProcessTransport, StaticPartition};
    use std::time::{Duration, Instant};

    fn open_replica(
        dir: &Path,
        transport: Arc<InProcessTransport>,
    ) -> (ReplicatedStore, Arc<StaticPartition>) {
        let partition = StaticPartition::granted();
        let store = ReplicatedStore::open(
            StoreConfig::in_memory(dir),
            Uuid::new_v4(),
            partition.clone(),
            Arc::new(transport),
            OpenMode::CreateNew,
            None,
        )
        .unwrap();
        (store, partition)
    }

    fn wait_for_lsn(store: &ReplicatedStore, lsn: Lsn) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while store.last_committed_sequence_number().unwrap() < lsn {
            assert!(Instant::now() < deadline, "secondary never caught up");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_open_promote_write_read() {
        let temp = tempfile::TempDir::new().unwrap();
        let (store, _) = open_replica(temp.path(), InProcessTransport::new());
        assert_eq!(store.current_state(), ReplicaState::SecondaryPassive);

        store.change_role(ReplicaRole::Primary).unwrap();
        assert_eq!(store.current_state(), ReplicaState::PrimaryPassive);

        let mut tx = store.create_transaction().unwrap();
        tx.insert("user", "a", b"1").unwrap();
        let lsn = tx.commit().unwrap();
        assert_eq!(lsn, 1);

        let tx = store.create_transaction().unwrap();
        assert_eq!(tx.get("user", "a").unwrap().unwrap(), b"1".to_vec());
        tx.rollback();
        store.close().unwrap();
    }

    #[test]
    fn test_writes_rejected_on_secondary() {
        let temp = tempfile::TempDir::new().unwrap();
        let (store, _) = open_replica(temp.path(), InProcessTransport::new());
        let err = store.create_transaction().err().unwrap();
        assert!(matches!(err, StoreError::NotPrimary));
        store.close().unwrap();
    }

    #[test]
    fn test_secondary_pump_applies_primary_writes() {
        let temp_a = tempfile::TempDir::new().unwrap();
        let temp_b = tempfile::TempDir::new().unwrap();
        let transport = InProcessTransport::new();

        let (primary, _) = open_replica(temp_a.path(), transport.clone());
        primary.change_role(ReplicaRole::Primary).unwrap();
        let (secondary, _) = open_replica(temp_b.path(), transport);
        secondary.change_role(ReplicaRole::Secondary).unwrap();
        assert_eq!(secondary.current_state(), ReplicaState::SecondaryActive);

        let mut tx = primary.create_transaction().unwrap();
        tx.insert("user", "a", b"1").unwrap();
        tx.insert("user", "b", b"2").unwrap();
        let lsn = tx.commit().unwrap();

        wait_for_lsn(&secondary, lsn);
        secondary.close().unwrap();

        primary.close().unwrap();
    }

    #[test]
    fn test_promotion_detaches_pump() {
        let temp = tempfile::TempDir::new().unwrap();
        let (store, _) = open_replica(temp.path(), InProcessTransport::new());
        store.change_role(ReplicaRole::Secondary).unwrap();
        assert_eq!(store.current_state(), ReplicaState::SecondaryActive);

        store.change_role(ReplicaRole::Primary).unwrap();
        assert_eq!(store.current_state(), ReplicaState::PrimaryPassive);

        let mut tx = store.create_transaction().unwrap();
        tx.insert("user", "a", b"1").unwrap();
        tx.commit().unwrap();
        store.close().unwrap();
    }

    #[test]
    fn test_close_releases_store() {
        let temp = tempfile::TempDir::new().unwrap();
        let (store, _) = open_replica(temp.path(), InProcessTransport::new());
        store.change_role(ReplicaRole::Primary).unwrap();
        store.close().unwrap();

        assert_eq!(store.current_state(), ReplicaState::Closed);
        let err = store.last_committed_sequence_number().unwrap_err();
        assert!(matches!(err, StoreError::ObjectClosed));
    }

    #[test]
    fn test_update_epoch_and_vector() {
        let temp = tempfile::TempDir::new().unwrap();
        let (store, _) = open_replica(temp.path(), InProcessTransport::new());
        store.change_role(ReplicaRole::Primary).unwrap();

        let mut tx = store.create_transaction().unwrap();
        tx.insert("user", "a", b"1").unwrap();
        let lsn = tx.commit().unwrap();

        store.update_epoch(Epoch::new(0, 2), lsn).unwrap();
        assert_eq!(store.current_epoch(), Epoch::new(0, 2));
        let vector = store.progress_vector();
        assert_eq!(vector.last().unwrap().last_lsn_in_epoch, lsn);
        store.close().unwrap();
    }

    #[test]
    fn test_full_copy_between_replicas() {
        let temp_a = tempfile::TempDir::new().unwrap();
        let temp_b = tempfile::TempDir::new().unwrap();
        let transport = InProcessTransport::new();

        let (primary, _) = open_replica(temp_a.path(), transport.clone());
        primary.change_role(ReplicaRole::Primary).unwrap();
        let mut tx = primary.create_transaction().unwrap();
        tx.insert("user", "a", b"1").unwrap();
        tx.insert("user", "b", b"2").unwrap();
        let lsn = tx.commit().unwrap();

        let (secondary, _) = open_replica(temp_b.path(), transport);
        assert_eq!(secondary.copy_mode_for(0), CopyMode::Full);
        let pages = primary.build_copy_pages(0, lsn).unwrap();
        secondary.install_full_copy(pages).unwrap();
        assert_eq!(secondary.last_committed_sequence_number().unwrap(), lsn);

        primary.close().unwrap();
        secondary.close().unwrap();
    }

    #[test]
    fn test_restore_roundtrip_through_engine() {
        let temp = tempfile::TempDir::new().unwrap();
        let (store, _) = open_replica(temp.path(), InProcessTransport::new());
        store.change_role(ReplicaRole::Primary).unwrap();

        let mut tx = store.create_transaction().unwrap();
        tx.insert("user", "a", b"1").unwrap();
        let lsn = tx.commit().unwrap();
        store.update_epoch(Epoch::new(1, 1), lsn).unwrap();

        let backup_dir = temp.path().join("backup");
        store
            .backup(&backup_dir, BackupOption::Full)
            .unwrap()
            .unwrap();

        let outcome = store
            .restore(
                &backup_dir,
                RestoreSettings {
                    enforce_lsn_check: true,
                    inline_reopen: true,
                },
            )
            .unwrap();
        assert_eq!(outcome.restored_progress, lsn);
        assert_eq!(store.last_committed_sequence_number().unwrap(), lsn);
        // The epoch cache survives the restore even though the persisted
        // progress history does not travel with the restored rows.
        assert_eq!(store.current_epoch(), Epoch::new(1, 1));
        store.close().unwrap();
    }

    #[test]
    fn test_create_new_refuses_existing_data_dir() {
        let temp = tempfile::TempDir::new().unwrap();
        let data_dir = temp.path().join("data");
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::write(data_dir.join("store.json"), b"[]").unwrap();

        let err = ReplicatedStore::open(
            StoreConfig::file_backed(&data_dir),
            Uuid::new_v4(),
            StaticPartition::granted(),
            Arc::new(InProcessTransport::new()),
            OpenMode::CreateNew,
            None,
        )
        .err()
        .unwrap();
        assert!(matches!(err, StoreError::InvalidOperation(_)));
        // The existing row file survived the refused create.
        assert_eq!(std::fs::read(data_dir.join("store.json")).unwrap(), b"[]");
    }

    #[test]
    fn test_repair_policy_intercepts_corrupt_open() {
        use crate::repair::{FixedRepairPolicy, RepairAction};
        use crate::transport::FaultKind;

        let temp = tempfile::TempDir::new().unwrap();
        let data_dir = temp.path().join("data");
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::write(data_dir.join("store.json"), b"not json").unwrap();

        let partition = StaticPartition::granted();
        let mut config = StoreConfig::file_backed(&data_dir);
        config.repair_enabled = true;
        config.repair_backup_dir = Some(temp.path().join("salvage"));

        let err = ReplicatedStore::open(
            config,
            Uuid::new_v4(),
            partition.clone(),
            Arc::new(InProcessTransport::new()),
            OpenMode::OpenExisting,
            Some(Box::new(FixedRepairPolicy(RepairAction::DropDatabase))),
        )
        .err()
        .unwrap();
        assert!(matches!(err, StoreError::DatabaseFilesCorrupted(_)));
        assert_eq!(partition.reported_faults(), vec![FaultKind::Permanent]);
        assert!(!data_dir.exists());
    }
}
