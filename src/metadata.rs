//! Reserved metadata row families
//!
//! The engine stores its own bookkeeping in the same local store as user
//! data, under reserved data types. Metadata rows are written with real
//! LSNs so they replicate and survive backup, but they are excluded from
//! user enumeration and from tombstone accounting.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::{StoreError, StoreResult};
use crate::local_store::{Lsn, StoreTransaction};

/// Data type for tombstone rows.
pub const TOMBSTONE_TYPE: &str = "__tombstone";
/// Data type for singleton engine metadata rows (epoch history, markers).
pub const META_TYPE: &str = "__meta";
/// Data type for persisted copy progress on an idle secondary.
pub const COPY_STATE_TYPE: &str = "__copy_state";

/// Key of the progress vector row under [`META_TYPE`].
pub const PROGRESS_VECTOR_KEY: &str = "progress_vector";
/// Key of the current epoch row under [`META_TYPE`].
pub const CURRENT_EPOCH_KEY: &str = "current_epoch";
/// Key of the tombstone low watermark row under [`META_TYPE`].
pub const TOMBSTONE_LOW_WATERMARK_KEY: &str = "tombstone_low_watermark";
/// Key of the partial copy in-progress marker under [`META_TYPE`].
pub const PARTIAL_COPY_IN_PROGRESS_KEY: &str = "partial_copy_in_progress";
/// Key of the partial copy completion marker under [`META_TYPE`].
pub const PARTIAL_COPY_COMPLETED_KEY: &str = "partial_copy_completed";
/// Key of the incremental backup arming row under [`META_TYPE`].
pub const BACKUP_CHAIN_KEY: &str = "backup_chain";

/// True for data types reserved by the engine.
pub fn is_metadata_type(data_type: &str) -> bool {
    data_type.starts_with("__")
}

/// Reads and deserializes a metadata row, `None` when absent.
pub fn read_data<T: DeserializeOwned>(
    tx: &dyn StoreTransaction,
    data_type: &str,
    key: &str,
) -> StoreResult<Option<T>> {
    match tx.get(data_type, key)? {
        None => Ok(None),
        Some(row) => {
            let value = serde_json::from_slice(&row.value)
                .map_err(|e| StoreError::serialization("decoding metadata row", e))?;
            Ok(Some(value))
        }
    }
}

/// Serializes and upserts a metadata row at the given LSN.
pub fn write_data<T: Serialize>(
    tx: &mut dyn StoreTransaction,
    data_type: &str,
    key: &str,
    value: &T,
    lsn: Lsn,
) -> StoreResult<()> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| StoreError::serialization("encoding metadata row", e))?;
    if tx.get(data_type, key)?.is_some() {
        tx.update(data_type, key, None, &bytes, lsn)
    } else {
        tx.insert(data_type, key, &bytes, lsn)
    }
}

/// Deletes a metadata row if present.
pub fn delete_data(tx: &mut dyn StoreTransaction, data_type: &str, key: &str) -> StoreResult<()> {
    if tx.get(data_type, key)?.is_some() {
        tx.delete(data_type, key, 0)?;
    }
    Ok(())
}
