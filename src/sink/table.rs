// src/sink/table.rs
//! One table per source in a SQLite database.
//!
//! Rows are keyed by the record timestamp and hold a single version, so a
//! replayed record overwrites itself.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use rusqlite::{params, Connection};
use tokio_util::sync::CancellationToken;

use crate::error::{IngestError, Result};
use crate::ingest::types::{PendingRecord, SourceConfig};
use crate::resource_cache::{KeyedResourceCache, ResourceHandler};
use crate::sink::Sink;

/// Table name for a source id: ASCII alphanumerics and `_`, never starting with a digit.
pub fn sanitize_table_name(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, 't');
        out.insert(1, '_');
    }
    out
}

/// Table a source writes into: its `table` setting or its id, sanitized.
pub fn source_table(source: &SourceConfig) -> String {
    sanitize_table_name(source.table.as_deref().unwrap_or(&source.id))
}

pub struct TableConnection {
    conn: Arc<Mutex<Connection>>,
    table: String,
}

impl TableConnection {
    pub fn table(&self) -> &str {
        &self.table
    }
}

pub struct TableHandler {
    database: PathBuf,
    tables: HashMap<String, String>,
}

impl TableHandler {
    pub fn new(database: impl Into<PathBuf>, sources: &[SourceConfig]) -> Self {
        let tables = sources
            .iter()
            .map(|s| (s.id.clone(), source_table(s)))
            .collect();
        Self {
            database: database.into(),
            tables,
        }
    }

    pub fn table_for(&self, source_id: &str) -> String {
        self.tables
            .get(source_id)
            .cloned()
            .unwrap_or_else(|| sanitize_table_name(source_id))
    }
}

/// Create the table if it does not exist yet.
pub fn ensure_table_exists(conn: &Connection, table: &str) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            r#"CREATE TABLE IF NOT EXISTS "{table}" (
                ts      INTEGER PRIMARY KEY,
                content TEXT NOT NULL
            )"#
        ),
        [],
    )?;
    Ok(())
}

fn open_table(database: &Path, table: &str) -> anyhow::Result<Connection> {
    if let Some(parent) = database.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    let conn = Connection::open(database)
        .with_context(|| format!("opening {}", database.display()))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    ensure_table_exists(&conn, table).with_context(|| format!("creating table {table}"))?;
    Ok(conn)
}

fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(|p| p.into_inner())
}

#[async_trait]
impl ResourceHandler for TableHandler {
    type Key = String;
    type Handle = TableConnection;
    type Item = PendingRecord;

    async fn open(&self, source_id: &String) -> anyhow::Result<TableConnection> {
        let table = self.table_for(source_id);
        let conn = tokio::task::spawn_blocking({
            let database = self.database.clone();
            let table = table.clone();
            move || open_table(&database, &table)
        })
        .await
        .context("table open task")??;
        tracing::info!(source = %source_id, table = %table, "table connection ready");
        Ok(TableConnection {
            conn: Arc::new(Mutex::new(conn)),
            table,
        })
    }

    async fn append(
        &self,
        _source_id: &String,
        handle: &mut TableConnection,
        item: &PendingRecord,
    ) -> anyhow::Result<()> {
        tokio::task::spawn_blocking({
            let conn = Arc::clone(&handle.conn);
            let table = handle.table.clone();
            let (ts, content) = (item.timestamp, item.payload.clone());
            move || {
                lock(&conn)
                    .execute(
                        &format!(r#"INSERT OR REPLACE INTO "{table}" (ts, content) VALUES (?1, ?2)"#),
                        params![ts, content],
                    )
                    .with_context(|| format!("inserting into {table}"))
            }
        })
        .await
        .context("table append task")??;
        Ok(())
    }

    async fn close(&self, _source_id: &String, handle: TableConnection) -> anyhow::Result<()> {
        let TableConnection { conn, table } = handle;
        let Ok(conn) = Arc::try_unwrap(conn) else {
            // an append task still holds it; the connection closes when that ends
            return Ok(());
        };
        let conn = conn.into_inner().unwrap_or_else(|p| p.into_inner());
        tokio::task::spawn_blocking(move || {
            conn.close()
                .map_err(|(_, e)| anyhow::anyhow!("closing connection for {table}: {e}"))
        })
        .await
        .context("table close task")?
    }
}

/// Writes each record into the table for its source.
pub struct TableSink {
    cache: Arc<KeyedResourceCache<TableHandler>>,
}

impl TableSink {
    pub fn new(handler: TableHandler, idle_ttl: Duration) -> Self {
        Self {
            cache: Arc::new(KeyedResourceCache::new("table", Arc::new(handler), idle_ttl)),
        }
    }

    pub fn cache(&self) -> &Arc<KeyedResourceCache<TableHandler>> {
        &self.cache
    }
}

#[async_trait]
impl Sink for TableSink {
    fn name(&self) -> &'static str {
        "table"
    }

    async fn write(&self, record: &PendingRecord) -> Result<()> {
        self.cache
            .append(&record.source_id, record)
            .await
            .map_err(|e| IngestError::Sink {
                sink: self.name().into(),
                message: e.to_string(),
            })
    }

    async fn shutdown(&self) {
        self.cache.shutdown().await;
    }

    fn spawn_maintenance(
        &self,
        every: Duration,
        ct: CancellationToken,
    ) -> Option<tokio::task::JoinHandle<()>> {
        Some(self.cache.spawn_sweeper(every, ct))
    }
}
