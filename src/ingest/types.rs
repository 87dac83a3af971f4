// src/ingest/types.rs
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque id tagging a staged record from stage until ack.
pub type RecordId = Uuid;

/// Immutable per-source configuration, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub id: String,
    pub url: String,
    pub refresh_rate_seconds: f64,
    pub retries: u32,
    pub timestamp_parser: String,
    /// Sub-directory under the file sink root; defaults to `id`.
    #[serde(default)]
    pub directory: Option<String>,
    /// Table name for the table sink; defaults to a sanitized `id`.
    #[serde(default)]
    pub table: Option<String>,
}

impl SourceConfig {
    /// Refresh rate in whole milliseconds, rounded.
    pub fn refresh_rate_ms(&self) -> u64 {
        (self.refresh_rate_seconds * 1000.0).round().max(0.0) as u64
    }
}

/// A record that has passed dedup and is tracked by the recovery store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingRecord {
    pub record_id: RecordId,
    pub source_id: String,
    /// POSIX seconds extracted from the payload.
    pub timestamp: i64,
    pub payload: String,
}

impl PendingRecord {
    pub fn new(source_id: impl Into<String>, timestamp: i64, payload: impl Into<String>) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            source_id: source_id.into(),
            timestamp,
            payload: payload.into(),
        }
    }
}
