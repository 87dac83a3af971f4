// src/ingest/recovery.rs
//! Durable staging area for records between emit and ack.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{IngestError, Result};
use crate::ingest::types::{PendingRecord, RecordId};

/// Durable id -> record map. A record is only ever deleted by `remove`.
#[async_trait]
pub trait RecoveryStore: Send + Sync {
    async fn stage(&self, record: &PendingRecord) -> Result<()>;
    /// Returns whether the id was staged. Removing an unknown id is a no-op.
    async fn remove(&self, id: &RecordId) -> Result<bool>;
    async fn lookup(&self, id: &RecordId) -> Result<Option<PendingRecord>>;
    /// Every staged record, oldest first.
    async fn pending(&self) -> Result<Vec<PendingRecord>>;
}

/// SQLite-file recovery store (WAL, synchronous=FULL).
///
/// Statements run on the blocking pool; each commit waits for an fsync.
pub struct SqliteRecoveryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRecoveryStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    IngestError::Recovery(format!("creating {}: {e}", parent.display()))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS pending_records (
                seq        INTEGER PRIMARY KEY AUTOINCREMENT,
                record_id  TEXT NOT NULL UNIQUE,
                source_id  TEXT NOT NULL,
                timestamp  INTEGER NOT NULL,
                payload    TEXT NOT NULL
            )
            "#,
            [],
        )?;
        tracing::debug!(path = %path.display(), "recovery store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || -> Result<T> {
            let conn = conn
                .lock()
                .map_err(|_| IngestError::Recovery("recovery store mutex poisoned".into()))?;
            Ok(f(&conn)?)
        })
        .await
        .map_err(|e| IngestError::Recovery(format!("recovery store task: {e}")))?
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, PendingRecord)> {
    let id: String = row.get(0)?;
    Ok((
        id,
        PendingRecord {
            record_id: RecordId::nil(),
            source_id: row.get(1)?,
            timestamp: row.get(2)?,
            payload: row.get(3)?,
        },
    ))
}

fn with_parsed_id((id, mut rec): (String, PendingRecord)) -> Result<PendingRecord> {
    rec.record_id = id
        .parse()
        .map_err(|e| IngestError::Recovery(format!("bad record id '{id}': {e}")))?;
    Ok(rec)
}

#[async_trait]
impl RecoveryStore for SqliteRecoveryStore {
    async fn stage(&self, record: &PendingRecord) -> Result<()> {
        let record = record.clone();
        self.with_conn(move |c| {
            c.execute(
                "INSERT OR REPLACE INTO pending_records (record_id, source_id, timestamp, payload)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.record_id.to_string(),
                    record.source_id,
                    record.timestamp,
                    record.payload
                ],
            )
            .map(|_| ())
        })
        .await
    }

    async fn remove(&self, id: &RecordId) -> Result<bool> {
        let id = id.to_string();
        self.with_conn(move |c| {
            c.execute("DELETE FROM pending_records WHERE record_id = ?1", params![id])
                .map(|n| n > 0)
        })
        .await
    }

    async fn lookup(&self, id: &RecordId) -> Result<Option<PendingRecord>> {
        let id = id.to_string();
        let row = self
            .with_conn(move |c| {
                c.query_row(
                    "SELECT record_id, source_id, timestamp, payload
                     FROM pending_records WHERE record_id = ?1",
                    params![id],
                    row_to_record,
                )
                .optional()
            })
            .await?;
        row.map(with_parsed_id).transpose()
    }

    async fn pending(&self) -> Result<Vec<PendingRecord>> {
        let rows = self
            .with_conn(|c| {
                let mut stmt = c.prepare(
                    "SELECT record_id, source_id, timestamp, payload
                     FROM pending_records ORDER BY seq",
                )?;
                let rows = stmt
                    .query_map([], row_to_record)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(with_parsed_id).collect()
    }
}

/// Non-durable store for tests and dry runs.
#[derive(Default)]
pub struct MemoryRecoveryStore {
    records: Mutex<Vec<PendingRecord>>,
}

impl MemoryRecoveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, Vec<PendingRecord>>> {
        self.records
            .lock()
            .map_err(|_| IngestError::Recovery("memory store mutex poisoned".into()))
    }
}

#[async_trait]
impl RecoveryStore for MemoryRecoveryStore {
    async fn stage(&self, record: &PendingRecord) -> Result<()> {
        let mut v = self.guard()?;
        v.retain(|r| r.record_id != record.record_id);
        v.push(record.clone());
        Ok(())
    }

    async fn remove(&self, id: &RecordId) -> Result<bool> {
        let mut v = self.guard()?;
        let before = v.len();
        v.retain(|r| &r.record_id != id);
        Ok(v.len() < before)
    }

    async fn lookup(&self, id: &RecordId) -> Result<Option<PendingRecord>> {
        Ok(self.guard()?.iter().find(|r| &r.record_id == id).cloned())
    }

    async fn pending(&self) -> Result<Vec<PendingRecord>> {
        Ok(self.guard()?.clone())
    }
}

/// Staged record count per source, for startup logging.
pub fn count_by_source(records: &[PendingRecord]) -> HashMap<&str, usize> {
    let mut out = HashMap::new();
    for r in records {
        *out.entry(r.source_id.as_str()).or_insert(0) += 1;
    }
    out
}
