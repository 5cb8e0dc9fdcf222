//! IndexWriter implementation for SQLite.
//!
//! Index rewrites run inside an immediate transaction: the precondition
//! check, hash restamp, and row replacement commit together or not at all.
//! The record's `version`, `last_modified`, and payload are never touched.

use async_trait::async_trait;
use rusqlite::{params, Connection, TransactionBehavior};

use crate::core::{IndexUpdate, IndexWriter};
use crate::error::{ConcurrencyError, RecordError, StoreResult};
use crate::types::{dedup_entries, StoredRecord};

use super::store::{read_record_columns, record_from_row, RECORD_COLUMNS};
use super::{map_sqlite_err, SqliteBackend};

/// Checks the target and applies one rewrite. Caller owns the transaction.
fn apply_update(tx: &Connection, update: &IndexUpdate) -> StoreResult<()> {
    let target = tx.query_row(
        "SELECT version, is_deleted FROM records
         WHERE resource_type = ?1 AND logical_id = ?2",
        params![update.resource_type, update.logical_id],
        |row| {
            let version: i64 = row.get(0)?;
            let is_deleted: i64 = row.get(1)?;
            Ok((version as u64, is_deleted != 0))
        },
    );
    let (version, is_deleted) = match target {
        Ok(v) => v,
        Err(rusqlite::Error::QueryReturnedNoRows) => {
            return Err(RecordError::NotFound {
                resource_type: update.resource_type.clone(),
                logical_id: update.logical_id.clone(),
            }
            .into());
        }
        Err(e) => return Err(map_sqlite_err(e)),
    };
    if is_deleted {
        return Err(RecordError::NotFound {
            resource_type: update.resource_type.clone(),
            logical_id: update.logical_id.clone(),
        }
        .into());
    }
    if version != update.expected_version {
        return Err(ConcurrencyError::PreconditionFailed {
            resource_type: update.resource_type.clone(),
            logical_id: update.logical_id.clone(),
            expected: update.expected_version,
            actual: version,
        }
        .into());
    }

    tx.execute(
        "UPDATE records SET search_param_hash = ?1, row_version = row_version + 1
         WHERE resource_type = ?2 AND logical_id = ?3",
        params![
            update.search_param_hash,
            update.resource_type,
            update.logical_id
        ],
    )
    .map_err(map_sqlite_err)?;

    super::store::delete_index_rows(tx, &update.resource_type, &update.logical_id)?;
    let entries = dedup_entries(update.entries.clone());
    super::store::write_index_rows_for(
        tx,
        &update.resource_type,
        &update.logical_id,
        version,
        &entries,
    )?;
    Ok(())
}

#[async_trait]
impl IndexWriter for SqliteBackend {
    async fn update_index(&self, update: IndexUpdate) -> StoreResult<StoredRecord> {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sqlite_err)?;
        apply_update(&tx, &update)?;

        let row = tx
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM records
                     WHERE resource_type = ?1 AND logical_id = ?2"
                ),
                params![update.resource_type, update.logical_id],
                read_record_columns,
            )
            .map_err(map_sqlite_err)?;
        let record = record_from_row(&update.resource_type, &update.logical_id, row)?;
        tx.commit().map_err(map_sqlite_err)?;
        Ok(record)
    }

    async fn update_indices_batch(&self, updates: Vec<IndexUpdate>) -> StoreResult<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sqlite_err)?;
        for update in &updates {
            // Any failure drops the transaction and rolls the batch back.
            apply_update(&tx, update)?;
        }
        tx.commit().map_err(map_sqlite_err)?;
        tracing::debug!(count = updates.len(), "rewrote index batch");
        Ok(())
    }
}
