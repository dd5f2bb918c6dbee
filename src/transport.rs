//! Replication transport and partition boundary
//!
//! The engine consumes an ordered-log replication transport and a
//! partition handle as external collaborators. Both are traits here so
//! the engine can be driven by an in-process implementation in tests
//! and by a real transport in production. The transport owns quorum
//! acknowledgement; the engine only appends.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::errors::{StoreError, StoreResult};
use crate::local_store::Lsn;

/// Answer of the partition's read/write status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStatus {
    Granted,
    ReconfigurationPending,
    NotPrimary,
    NoWriteQuorum,
}

impl AccessStatus {
    /// Error to surface to the caller, `None` when access is granted.
    pub fn to_error(self) -> Option<StoreError> {
        match self {
            AccessStatus::Granted => None,
            AccessStatus::ReconfigurationPending => Some(StoreError::ReconfigurationPending),
            AccessStatus::NotPrimary => Some(StoreError::NotPrimary),
            AccessStatus::NoWriteQuorum => Some(StoreError::NoWriteQuorum),
        }
    }
}

/// Fault severity reported to the platform owning this replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Replica restart; data is not considered lost.
    Transient,
    /// Replica rebuild from scratch.
    Permanent,
}

/// Handle to the partition hosting this replica.
pub trait PartitionHandle: Send + Sync {
    fn read_status(&self) -> AccessStatus;
    fn write_status(&self) -> AccessStatus;
    fn report_fault(&self, kind: FaultKind);
}

/// One record of the replication log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub payload: Vec<u8>,
}

/// Pull cursor over an ordered stream of log records. `Ok(None)` means
/// no record is currently available, not end of stream.
pub trait OperationStream: Send {
    fn next(&mut self) -> StoreResult<Option<LogRecord>>;
}

/// Knobs forwarded to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicatorSettings {
    pub max_pending_bytes: usize,
}

impl Default for ReplicatorSettings {
    fn default() -> Self {
        Self {
            max_pending_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Ordered-log replication transport consumed by the engine.
pub trait ReplicationTransport: Send + Sync {
    /// Appends an encoded operation batch and returns its sequence
    /// number. Success means accepted, not quorum-acknowledged.
    fn replicate(&self, payload: &[u8]) -> StoreResult<Lsn>;

    /// Stream of committed records for a secondary to pump, starting
    /// after `from_lsn`.
    fn replication_stream(&self, from_lsn: Lsn) -> StoreResult<Box<dyn OperationStream>>;

    fn update_settings(&self, settings: ReplicatorSettings) -> StoreResult<()>;

    /// Highest sequence number the transport has handed out.
    fn last_sequence_number(&self) -> Lsn;
}

/// In-process transport backed by a shared vector. Used by tests and by
/// single-process primary/secondary pairs.
pub struct InProcessTransport {
    log: Mutex<Vec<LogRecord>>,
    next_lsn: AtomicU64,
    settings: Mutex<ReplicatorSettings>,
    closed: AtomicBool,
}

impl InProcessTransport {
    pub fn new() -> Arc<Self> {
        Self::starting_at(1)
    }

    /// Starts handing out sequence numbers at `first_lsn`. Used when a
    /// replica reopens with existing progress.
    pub fn starting_at(first_lsn: Lsn) -> Arc<Self> {
        Arc::new(Self {
            log: Mutex::new(Vec::new()),
            next_lsn: AtomicU64::new(first_lsn.max(1)),
            settings: Mutex::new(ReplicatorSettings::default()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl ReplicationTransport for Arc<InProcessTransport> {
    fn replicate(&self, payload: &[u8]) -> StoreResult<Lsn> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::ObjectClosed);
        }
        let lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
        let mut log = self
            .log
            .lock()
            .map_err(|_| StoreError::StoreFatal("replication log lock poisoned".into()))?;
        log.push(LogRecord {
            lsn,
            payload: payload.to_vec(),
        });
        Ok(lsn)
    }

    fn replication_stream(&self, from_lsn: Lsn) -> StoreResult<Box<dyn OperationStream>> {
        Ok(Box::new(InProcessStream {
            transport: Arc::clone(self),
            after_lsn: from_lsn,
        }))
    }

    fn update_settings(&self, settings: ReplicatorSettings) -> StoreResult<()> {
        let mut current = self
            .settings
            .lock()
            .map_err(|_| StoreError::StoreFatal("replicator settings lock poisoned".into()))?;
        *current = settings;
        Ok(())
    }

    fn last_sequence_number(&self) -> Lsn {
        self.next_lsn.load(Ordering::SeqCst).saturating_sub(1)
    }
}

struct InProcessStream {
    transport: Arc<InProcessTransport>,
    after_lsn: Lsn,
}

impl OperationStream for InProcessStream {
    fn next(&mut self) -> StoreResult<Option<LogRecord>> {
        if self.transport.closed.load(Ordering::SeqCst) {
            return Err(StoreError::ObjectClosed);
        }
        let log = self
            .transport
            .log
            .lock()
            .map_err(|_| StoreError::StoreFatal("replication log lock poisoned".into()))?;
        let record = log.iter().find(|r| r.lsn > self.after_lsn).cloned();
        if let Some(ref record) = record {
            self.after_lsn = record.lsn;
        }
        Ok(record)
    }
}

/// First-fault-wins latch over a partition handle. Once any component
/// reports a fault, later reports are dropped so the platform sees a
/// single cause per replica incident.
pub struct FaultLatch {
    partition: Arc<dyn PartitionHandle>,
    fired: AtomicBool,
}

impl FaultLatch {
    pub fn new(partition: Arc<dyn PartitionHandle>) -> Arc<Self> {
        Arc::new(Self {
            partition,
            fired: AtomicBool::new(false),
        })
    }

    /// Reports the fault if none was reported before. Returns true when
    /// this call won the latch.
    pub fn report(&self, kind: FaultKind) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.partition.report_fault(kind);
            true
        } else {
            false
        }
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// Partition handle with externally settable statuses, recording every
/// reported fault.
pub struct StaticPartition {
    read: Mutex<AccessStatus>,
    write: Mutex<AccessStatus>,
    faults: Mutex<Vec<FaultKind>>,
}

impl StaticPartition {
    pub fn granted() -> Arc<Self> {
        Arc::new(Self {
            read: Mutex::new(AccessStatus::Granted),
            write: Mutex::new(AccessStatus::Granted),
            faults: Mutex::new(Vec::new()),
        })
    }

    pub fn set_write_status(&self, status: AccessStatus) {
        if let Ok(mut write) = self.write.lock() {
            *write = status;
        }
    }

    pub fn set_read_status(&self, status: AccessStatus) {
        if let Ok(mut read) = self.read.lock() {
            *read = status;
        }
    }

    pub fn reported_faults(&self) -> Vec<FaultKind> {
        self.faults.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

impl PartitionHandle for StaticPartition {
    fn read_status(&self) -> AccessStatus {
        self.read.lock().map(|s| *s).unwrap_or(AccessStatus::Granted)
    }

    fn write_status(&self) -> AccessStatus {
        self.write
            .lock()
            .map(|s| *s)
            .unwrap_or(AccessStatus::Granted)
    }

    fn report_fault(&self, kind: FaultKind) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.push(kind);
        }
    }
}
