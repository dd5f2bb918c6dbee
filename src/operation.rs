//! Replication Operations
//!
//! One `ReplicationOperation` is produced per successful local write and
//! appended (batched per transaction) to the replication stream. Secondaries
//! apply batches through the same write path as local transactions, so a
//! batch is the atomicity unit: secondaries never observe part of one.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::errors::{StoreError, StoreResult};

/// Kind of replicated write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

/// A single replicated write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationOperation {
    pub kind: OperationKind,

    /// Logical row type.
    pub data_type: String,

    /// Row key.
    pub key: String,

    /// Replacement key for a rename-on-update; `None` otherwise.
    pub new_key: Option<String>,

    /// Row value; `None` for deletes.
    pub value: Option<Vec<u8>>,

    /// Primary wall-clock timestamp (RFC3339). Informational only; ordering
    /// comes from the sequence number assigned by the transport.
    pub primary_timestamp: String,
}

impl ReplicationOperation {
    pub fn insert(data_type: impl Into<String>, key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            kind: OperationKind::Insert,
            data_type: data_type.into(),
            key: key.into(),
            new_key: None,
            value: Some(value),
            primary_timestamp: now_rfc3339(),
        }
    }

    pub fn update(
        data_type: impl Into<String>,
        key: impl Into<String>,
        new_key: Option<String>,
        value: Vec<u8>,
    ) -> Self {
        Self {
            kind: OperationKind::Update,
            data_type: data_type.into(),
            key: key.into(),
            new_key,
            value: Some(value),
            primary_timestamp: now_rfc3339(),
        }
    }

    pub fn delete(data_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::Delete,
            data_type: data_type.into(),
            key: key.into(),
            new_key: None,
            value: None,
            primary_timestamp: now_rfc3339(),
        }
    }

    /// Effective key after this operation (the rename target for updates).
    pub fn effective_key(&self) -> &str {
        self.new_key.as_deref().unwrap_or(&self.key)
    }
}

fn now_rfc3339() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// The unit appended to the replication stream: all operations of one
/// committed transaction (or one closed commit group), in issue order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReplicationBatch {
    pub operations: Vec<ReplicationOperation>,
}

impl ReplicationBatch {
    pub fn new(operations: Vec<ReplicationOperation>) -> Self {
        Self { operations }
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| StoreError::serialization("encode batch", e))
    }

    pub fn decode(bytes: &[u8]) -> StoreResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::serialization("decode batch", e))
    }

    /// Approximate wire size, used for group close decisions.
    pub fn approximate_size(&self) -> usize {
        self.operations
            .iter()
            .map(|op| {
                op.data_type.len()
                    + op.key.len()
                    + op.new_key.as_ref().map_or(0, |k| k.len())
                    + op.value.as_ref().map_or(0, |v| v.len())
                    + 64
            })
            .sum()
    }
}
