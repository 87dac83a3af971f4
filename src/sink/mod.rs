// src/sink/mod.rs
//! Terminal steps that persist accepted records.

pub mod bucket;
pub mod file;
pub mod table;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{IngestError, Result};
use crate::ingest::types::PendingRecord;

/// A downstream writer. Writes must be idempotent: a record may be written
/// again after a replay.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn write(&self, record: &PendingRecord) -> Result<()>;

    /// Close every open handle. Called once on shutdown.
    async fn shutdown(&self);

    /// Start background maintenance (idle eviction). Default: nothing.
    fn spawn_maintenance(
        &self,
        _every: std::time::Duration,
        _ct: tokio_util::sync::CancellationToken,
    ) -> Option<tokio::task::JoinHandle<()>> {
        None
    }
}

/// Where emitted records go; `Ok` acks, `Err` fails.
#[async_trait]
pub trait Downstream: Send + Sync {
    async fn deliver(&self, record: &PendingRecord) -> Result<()>;
}

/// Writes each record to every sink. The record succeeds only if all do.
#[derive(Clone, Default)]
pub struct SinkSet {
    sinks: Vec<Arc<dyn Sink>>,
}

impl SinkSet {
    pub fn new(sinks: Vec<Arc<dyn Sink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn Sink>) {
        self.sinks.push(sink);
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn sinks(&self) -> &[Arc<dyn Sink>] {
        &self.sinks
    }

    pub async fn shutdown(&self) {
        for s in &self.sinks {
            s.shutdown().await;
        }
    }
}

#[async_trait]
impl Downstream for SinkSet {
    async fn deliver(&self, record: &PendingRecord) -> Result<()> {
        let mut failures = Vec::new();
        for s in &self.sinks {
            if let Err(e) = s.write(record).await {
                tracing::error!(
                    sink = s.name(),
                    source = %record.source_id,
                    timestamp = record.timestamp,
                    record_id = %record.record_id,
                    error = %e,
                    "sink write failed"
                );
                failures.push(format!("{}: {e}", s.name()));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(IngestError::Sink {
                sink: "fanout".into(),
                message: failures.join("; "),
            })
        }
    }
}
