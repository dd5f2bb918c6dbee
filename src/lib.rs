//! replistore - the replicated store core of a partitioned key-value
//! platform
//!
//! One `ReplicatedStore` is one replica of one partition. It owns a
//! local store (in-memory or file-backed), applies writes through a
//! replication transport that assigns sequence numbers, batches commits
//! under load, tracks deletes as tombstones with background collection,
//! brings lagging secondaries up to date over the copy protocol, and
//! records leadership changes in an epoch progress vector. Backup
//! chains (one full plus contiguous incrementals) and validated restore
//! round out the durability story.

pub mod backup;
pub mod config;
pub mod copy;
pub mod engine;
pub mod epoch;
pub mod errors;
pub mod local_store;
pub mod metadata;
pub mod observability;
pub mod operation;
pub mod repair;
pub mod restore;
pub mod state_machine;
pub mod tombstone;
pub mod transport;
pub mod txn;

pub use config::{GroupCommitConfig, StoreConfig, TombstoneConfig};
pub use engine::ReplicatedStore;
pub use epoch::{Epoch, EpochTracker, ProgressVectorEntry};
pub use errors::{FaultClass, StoreError, StoreResult};
pub use local_store::{BackupOption, LocalStoreKind, Lsn};
pub use repair::{RepairAction, RepairPolicy};
pub use restore::{RestoreOutcome, RestoreSettings};
pub use state_machine::{OpenMode, ReplicaRole, ReplicaState};
pub use transport::{
    AccessStatus, FaultKind, PartitionHandle, ReplicationTransport,
};
