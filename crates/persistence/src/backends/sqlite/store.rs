//! VersionedStore and RecordScan implementations for SQLite.
//!
//! The upsert follows the two-attempt optimistic path: a blind insert when
//! the caller is unconditional and create is allowed, falling through to a
//! conditional-replace loop keyed on the `row_version` column. No
//! application-level lock serializes writers; the guarded UPDATE does.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, TransactionBehavior};

use crate::core::{DeleteMode, RecordPage, RecordScan, UpsertOptions, VersionedStore};
use crate::error::{ConcurrencyError, RecordError, StoreResult};
use crate::types::{
    IndexEntry, IndexValue, RecordDraft, RecordKey, RecordMethod, StoredRecord, UpsertOutcome,
};

use super::{internal, is_unique_violation, map_sqlite_err, SqliteBackend};

/// The current row's concurrency-relevant fields.
struct CurrentMeta {
    version: u64,
    row_version: u64,
    is_deleted: bool,
}

pub(super) const RECORD_COLUMNS: &str =
    "version, raw, last_modified, method, is_deleted, meta_embedded, search_param_hash";

fn parse_ts(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| internal(format!("failed to parse timestamp: {}", e)))
}

pub(super) type RecordRow = (i64, Vec<u8>, String, Option<String>, i64, i64, Option<String>);

pub(super) fn record_from_row(
    resource_type: &str,
    logical_id: &str,
    row: RecordRow,
) -> StoreResult<StoredRecord> {
    let (version, raw, last_modified, method, is_deleted, meta_embedded, hash) = row;
    Ok(StoredRecord::from_storage(
        resource_type,
        logical_id,
        version as u64,
        is_deleted != 0,
        parse_ts(&last_modified)?,
        method.as_deref().and_then(RecordMethod::parse),
        raw,
        meta_embedded != 0,
        hash.filter(|h| !h.is_empty()),
    ))
}

pub(super) fn read_record_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

impl SqliteBackend {
    fn read_current_meta(
        &self,
        conn: &Connection,
        resource_type: &str,
        logical_id: &str,
    ) -> StoreResult<Option<CurrentMeta>> {
        let result = conn.query_row(
            "SELECT version, row_version, is_deleted FROM records
             WHERE resource_type = ?1 AND logical_id = ?2",
            params![resource_type, logical_id],
            |row| {
                let version: i64 = row.get(0)?;
                let row_version: i64 = row.get(1)?;
                let is_deleted: i64 = row.get(2)?;
                Ok(CurrentMeta {
                    version: version as u64,
                    row_version: row_version as u64,
                    is_deleted: is_deleted != 0,
                })
            },
        );
        match result {
            Ok(meta) => Ok(Some(meta)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(map_sqlite_err(e)),
        }
    }

    /// Blind insert at version 1. Returns `None` on a primary-key collision
    /// so the caller can fall through to the conditional-replace loop.
    fn try_create(&self, draft: &RecordDraft) -> StoreResult<Option<UpsertOutcome>> {
        let record = crate::backends::materialize_draft(self.extractor(), draft, 1);
        let mut conn = self.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sqlite_err)?;

        let inserted = tx.execute(
            "INSERT INTO records
             (resource_type, logical_id, version, row_version, raw, last_modified,
              method, is_deleted, meta_embedded, search_param_hash)
             VALUES (?1, ?2, 1, 1, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.resource_type(),
                record.logical_id(),
                record.raw(),
                record.last_modified().to_rfc3339(),
                record.method().map(|m| m.as_str()),
                record.is_deleted() as i64,
                record.meta_embedded() as i64,
                record.search_param_hash(),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => return Ok(None),
            Err(e) => return Err(map_sqlite_err(e)),
        }

        insert_history(&tx, &record)?;
        if !record.is_deleted() {
            let entries = self
                .extractor()
                .extract(record.resource_type(), record.raw());
            write_index_rows(&tx, &record, &entries)?;
        }
        tx.commit().map_err(map_sqlite_err)?;
        let last_modified = record.last_modified();
        tracing::debug!(key = %record.key(), "created record");
        Ok(Some(UpsertOutcome::created(1, last_modified)))
    }

    /// Conditional replace guarded by `row_version`. Returns `None` when the
    /// guard misses (a concurrent writer got there first).
    fn try_replace(
        &self,
        draft: &RecordDraft,
        options: &UpsertOptions,
        current: &CurrentMeta,
    ) -> StoreResult<Option<UpsertOutcome>> {
        let new_version = current.version + 1;
        let record = crate::backends::materialize_draft(self.extractor(), draft, new_version);
        let mut conn = self.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sqlite_err)?;

        let changed = tx
            .execute(
                "UPDATE records SET version = ?1, row_version = row_version + 1, raw = ?2,
                     last_modified = ?3, method = ?4, is_deleted = ?5, meta_embedded = ?6,
                     search_param_hash = ?7
                 WHERE resource_type = ?8 AND logical_id = ?9 AND row_version = ?10",
                params![
                    new_version as i64,
                    record.raw(),
                    record.last_modified().to_rfc3339(),
                    record.method().map(|m| m.as_str()),
                    record.is_deleted() as i64,
                    record.meta_embedded() as i64,
                    record.search_param_hash(),
                    record.resource_type(),
                    record.logical_id(),
                    current.row_version as i64,
                ],
            )
            .map_err(map_sqlite_err)?;
        if changed == 0 {
            return Ok(None);
        }

        if !options.keep_history {
            tx.execute(
                "DELETE FROM record_history
                 WHERE resource_type = ?1 AND logical_id = ?2 AND version <= ?3",
                params![
                    record.resource_type(),
                    record.logical_id(),
                    current.version as i64
                ],
            )
            .map_err(map_sqlite_err)?;
        }
        insert_history(&tx, &record)?;

        delete_index_rows(&tx, record.resource_type(), record.logical_id())?;
        if !record.is_deleted() {
            let entries = self
                .extractor()
                .extract(record.resource_type(), record.raw());
            write_index_rows(&tx, &record, &entries)?;
        }
        tx.commit().map_err(map_sqlite_err)?;
        Ok(Some(UpsertOutcome::updated(
            new_version,
            record.last_modified(),
        )))
    }
}

pub(crate) fn insert_history(conn: &Connection, record: &StoredRecord) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO record_history
         (resource_type, logical_id, version, raw, last_modified, method,
          is_deleted, meta_embedded, search_param_hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            record.resource_type(),
            record.logical_id(),
            record.version() as i64,
            record.raw(),
            record.last_modified().to_rfc3339(),
            record.method().map(|m| m.as_str()),
            record.is_deleted() as i64,
            record.meta_embedded() as i64,
            record.search_param_hash(),
        ],
    )
    .map_err(map_sqlite_err)?;
    Ok(())
}

pub(crate) fn delete_index_rows(
    conn: &Connection,
    resource_type: &str,
    logical_id: &str,
) -> StoreResult<()> {
    conn.execute(
        "DELETE FROM search_index WHERE resource_type = ?1 AND logical_id = ?2",
        params![resource_type, logical_id],
    )
    .map_err(map_sqlite_err)?;
    Ok(())
}

pub(crate) fn write_index_rows(
    conn: &Connection,
    record: &StoredRecord,
    entries: &[IndexEntry],
) -> StoreResult<()> {
    write_index_rows_for(
        conn,
        record.resource_type(),
        record.logical_id(),
        record.version(),
        entries,
    )
}

pub(super) fn write_index_rows_for(
    conn: &Connection,
    resource_type: &str,
    logical_id: &str,
    version: u64,
    entries: &[IndexEntry],
) -> StoreResult<()> {
    for entry in entries {
        write_index_row(conn, resource_type, logical_id, version, entry)?;
    }
    Ok(())
}

fn write_index_row(
    conn: &Connection,
    resource_type: &str,
    logical_id: &str,
    version: u64,
    entry: &IndexEntry,
) -> StoreResult<()> {
    let kind = entry.value.kind().as_str();
    let sql = "INSERT INTO search_index
        (resource_type, logical_id, version, param_code, param_url, value_kind,
         value_string, value_token_system, value_token_code, value_reference,
         value_date, value_number, value_quantity_value, value_quantity_system,
         value_quantity_code, value_uri, composite_group)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)";

    let mut value_string: Option<&str> = None;
    let mut token_system: Option<&str> = None;
    let mut token_code: Option<&str> = None;
    let mut reference: Option<&str> = None;
    let mut date: Option<&str> = None;
    let mut number: Option<f64> = None;
    let mut quantity_value: Option<f64> = None;
    let mut quantity_system: Option<&str> = None;
    let mut quantity_code: Option<&str> = None;
    let mut uri: Option<&str> = None;

    match &entry.value {
        IndexValue::String { value } => value_string = Some(value),
        IndexValue::Token { system, code } => {
            token_system = system.as_deref();
            token_code = Some(code);
        }
        IndexValue::Reference { reference: r } => reference = Some(r),
        IndexValue::Date { value } => date = Some(value),
        IndexValue::Number { value } => number = Some(*value),
        IndexValue::Quantity {
            value,
            system,
            code,
        } => {
            quantity_value = Some(*value);
            quantity_system = system.as_deref();
            quantity_code = code.as_deref();
        }
        IndexValue::Uri { value } => uri = Some(value),
    }

    conn.execute(
        sql,
        params![
            resource_type,
            logical_id,
            version as i64,
            entry.param_code,
            entry.param_url,
            kind,
            value_string,
            token_system,
            token_code,
            reference,
            date,
            number,
            quantity_value,
            quantity_system,
            quantity_code,
            uri,
            entry.composite_group,
        ],
    )
    .map_err(map_sqlite_err)?;
    Ok(())
}

#[async_trait]
impl VersionedStore for SqliteBackend {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn upsert(
        &self,
        draft: RecordDraft,
        options: &UpsertOptions,
    ) -> StoreResult<UpsertOutcome> {
        if options.if_match.is_none() && options.allow_create && !draft.is_deleted {
            if let Some(outcome) = self.try_create(&draft)? {
                return Ok(outcome);
            }
        }

        loop {
            let conn = self.connection()?;
            let current =
                self.read_current_meta(&conn, &draft.resource_type, &draft.logical_id)?;
            drop(conn);

            match current {
                None => {
                    if options.if_match.is_some() {
                        return Err(RecordError::NotFound {
                            resource_type: draft.resource_type,
                            logical_id: draft.logical_id,
                        }
                        .into());
                    }
                    if !options.allow_create {
                        return Err(RecordError::MethodNotAllowed {
                            reason: format!("create is not allowed for {}", draft.resource_type),
                        }
                        .into());
                    }
                    if let Some(outcome) = self.try_create(&draft)? {
                        return Ok(outcome);
                    }
                    // Lost the create race; re-read and verify against the winner.
                }
                Some(current) => {
                    if let Some(expected) = options.if_match {
                        if expected != current.version {
                            return Err(ConcurrencyError::PreconditionFailed {
                                resource_type: draft.resource_type,
                                logical_id: draft.logical_id,
                                expected,
                                actual: current.version,
                            }
                            .into());
                        }
                    }
                    if current.is_deleted && draft.is_deleted {
                        return Ok(UpsertOutcome::noop(Utc::now()));
                    }
                    if let Some(outcome) = self.try_replace(&draft, options, &current)? {
                        return Ok(outcome);
                    }
                    // Guard missed; re-read and retry.
                }
            }
        }
    }

    async fn get(&self, key: &RecordKey) -> StoreResult<StoredRecord> {
        let conn = self.connection()?;
        match key.version {
            Some(version) => {
                let result = conn.query_row(
                    &format!(
                        "SELECT {RECORD_COLUMNS} FROM record_history
                         WHERE resource_type = ?1 AND logical_id = ?2 AND version = ?3"
                    ),
                    params![key.resource_type, key.logical_id, version as i64],
                    read_record_columns,
                );
                match result {
                    Ok(row) => {
                        let record =
                            record_from_row(&key.resource_type, &key.logical_id, row)?;
                        Ok(record.with_embedded_meta())
                    }
                    Err(rusqlite::Error::QueryReturnedNoRows) => {
                        Err(RecordError::VersionNotFound {
                            resource_type: key.resource_type.clone(),
                            logical_id: key.logical_id.clone(),
                            version,
                        }
                        .into())
                    }
                    Err(e) => Err(map_sqlite_err(e)),
                }
            }
            None => {
                let result = conn.query_row(
                    &format!(
                        "SELECT {RECORD_COLUMNS} FROM records
                         WHERE resource_type = ?1 AND logical_id = ?2"
                    ),
                    params![key.resource_type, key.logical_id],
                    read_record_columns,
                );
                match result {
                    Ok(row) => {
                        let record =
                            record_from_row(&key.resource_type, &key.logical_id, row)?;
                        if record.is_deleted() {
                            return Err(RecordError::Gone {
                                resource_type: key.resource_type.clone(),
                                logical_id: key.logical_id.clone(),
                                deleted_at: Some(record.last_modified()),
                            }
                            .into());
                        }
                        Ok(record.with_embedded_meta())
                    }
                    Err(rusqlite::Error::QueryReturnedNoRows) => Err(RecordError::NotFound {
                        resource_type: key.resource_type.clone(),
                        logical_id: key.logical_id.clone(),
                    }
                    .into()),
                    Err(e) => Err(map_sqlite_err(e)),
                }
            }
        }
    }

    async fn delete(&self, key: &RecordKey, mode: DeleteMode) -> StoreResult<Option<u64>> {
        if key.version.is_some() {
            return Err(RecordError::MethodNotAllowed {
                reason: "cannot delete a specific version".to_string(),
            }
            .into());
        }

        match mode {
            DeleteMode::Hard => {
                let mut conn = self.connection()?;
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(map_sqlite_err)?;
                tx.execute(
                    "DELETE FROM records WHERE resource_type = ?1 AND logical_id = ?2",
                    params![key.resource_type, key.logical_id],
                )
                .map_err(map_sqlite_err)?;
                tx.execute(
                    "DELETE FROM record_history WHERE resource_type = ?1 AND logical_id = ?2",
                    params![key.resource_type, key.logical_id],
                )
                .map_err(map_sqlite_err)?;
                delete_index_rows(&tx, &key.resource_type, &key.logical_id)?;
                tx.commit().map_err(map_sqlite_err)?;
                tracing::debug!(key = %key, "hard-deleted record");
                Ok(None)
            }
            DeleteMode::Soft => loop {
                let conn = self.connection()?;
                let current =
                    self.read_current_meta(&conn, &key.resource_type, &key.logical_id)?;
                drop(conn);

                let Some(current) = current else {
                    return Ok(None);
                };
                if current.is_deleted {
                    return Ok(None);
                }

                let draft = RecordDraft::tombstone(&key.resource_type, &key.logical_id);
                let options = UpsertOptions::unconditional();
                if let Some(outcome) = self.try_replace(&draft, &options, &current)? {
                    return Ok(outcome.version);
                }
            },
        }
    }

    async fn list_versions(
        &self,
        resource_type: &str,
        logical_id: &str,
    ) -> StoreResult<Vec<u64>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT version FROM record_history
                 WHERE resource_type = ?1 AND logical_id = ?2
                 ORDER BY version ASC",
            )
            .map_err(map_sqlite_err)?;
        let versions = stmt
            .query_map(params![resource_type, logical_id], |row| {
                row.get::<_, i64>(0)
            })
            .map_err(map_sqlite_err)?
            .filter_map(|r| r.ok())
            .map(|v| v as u64)
            .collect();
        Ok(versions)
    }
}

#[async_trait]
impl RecordScan for SqliteBackend {
    async fn page_records(
        &self,
        resource_type: &str,
        after: Option<&str>,
        limit: usize,
    ) -> StoreResult<RecordPage> {
        let conn = self.connection()?;
        let fetch = (limit + 1) as i64;

        let mut rows: Vec<(String, RecordRow)> = Vec::new();
        if let Some(after) = after {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT logical_id, {RECORD_COLUMNS} FROM records
                     WHERE resource_type = ?1 AND is_deleted = 0 AND logical_id > ?2
                     ORDER BY logical_id ASC LIMIT ?3"
                ))
                .map_err(map_sqlite_err)?;
            let mapped = stmt
                .query_map(params![resource_type, after, fetch], |row| {
                    let id: String = row.get(0)?;
                    let data: RecordRow = (
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    );
                    Ok((id, data))
                })
                .map_err(map_sqlite_err)?;
            for row in mapped {
                rows.push(row.map_err(map_sqlite_err)?);
            }
        } else {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT logical_id, {RECORD_COLUMNS} FROM records
                     WHERE resource_type = ?1 AND is_deleted = 0
                     ORDER BY logical_id ASC LIMIT ?2"
                ))
                .map_err(map_sqlite_err)?;
            let mapped = stmt
                .query_map(params![resource_type, fetch], |row| {
                    let id: String = row.get(0)?;
                    let data: RecordRow = (
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    );
                    Ok((id, data))
                })
                .map_err(map_sqlite_err)?;
            for row in mapped {
                rows.push(row.map_err(map_sqlite_err)?);
            }
        }

        let has_more = rows.len() > limit;
        rows.truncate(limit);
        let mut records = Vec::with_capacity(rows.len());
        for (id, data) in rows {
            records.push(record_from_row(resource_type, &id, data)?);
        }
        let next = if has_more {
            records.last().map(|r| r.logical_id().to_string())
        } else {
            None
        };
        Ok(RecordPage { records, next })
    }

    async fn count_records(&self, resource_type: &str) -> StoreResult<u64> {
        let conn = self.connection()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM records WHERE resource_type = ?1 AND is_deleted = 0",
                params![resource_type],
                |row| row.get(0),
            )
            .map_err(map_sqlite_err)?;
        Ok(count as u64)
    }
}
