// src/sink/file.rs
//! Per-(source, bucket) container files.
//!
//! Layout: `<root>/<source dir>/<bucket>.jsonl`, one JSON object per line with
//! `timestamp` and `content`. Existing files are appended to. Every append is
//! flushed to the OS; fsync runs every `sync_interval` records and on close.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::{IngestError, Result};
use crate::ingest::types::{PendingRecord, SourceConfig};
use crate::resource_cache::{KeyedResourceCache, ResourceHandler};
use crate::sink::bucket::BucketGranularity;
use crate::sink::Sink;

pub const FILE_EXTENSION: &str = "jsonl";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceBucket {
    pub source_id: String,
    pub bucket: String,
}

impl fmt::Display for SourceBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source_id, self.bucket)
    }
}

/// One stored line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredRecord {
    pub timestamp: i64,
    pub content: String,
}

pub struct BucketFile {
    path: PathBuf,
    file: File,
    /// Length up to the last complete line.
    len: u64,
    unsynced: usize,
}

impl BucketFile {
    /// Drop a partially written line so the file ends on a record boundary.
    async fn truncate_to_last_line(&mut self) {
        if let Err(e) = self.file.set_len(self.len).await {
            tracing::error!(
                path = %self.path.display(),
                len = self.len,
                error = %e,
                "could not truncate partial write"
            );
        }
    }
}

/// Directory under the file sink root that holds a source's buckets.
pub fn source_directory(source: &SourceConfig) -> &str {
    source.directory.as_deref().unwrap_or(&source.id)
}

pub struct BucketFileHandler {
    root: PathBuf,
    directories: HashMap<String, String>,
    sync_interval: usize,
}

impl BucketFileHandler {
    pub fn new(root: impl Into<PathBuf>, sources: &[SourceConfig], sync_interval: usize) -> Self {
        let directories = sources
            .iter()
            .map(|s| (s.id.clone(), source_directory(s).to_string()))
            .collect();
        Self {
            root: root.into(),
            directories,
            sync_interval: sync_interval.max(1),
        }
    }

    pub fn path_for(&self, key: &SourceBucket) -> PathBuf {
        let dir = self
            .directories
            .get(&key.source_id)
            .map(String::as_str)
            .unwrap_or(key.source_id.as_str());
        self.root
            .join(dir)
            .join(format!("{}.{FILE_EXTENSION}", key.bucket))
    }
}

#[async_trait]
impl ResourceHandler for BucketFileHandler {
    type Key = SourceBucket;
    type Handle = BucketFile;
    type Item = PendingRecord;

    async fn open(&self, key: &SourceBucket) -> anyhow::Result<BucketFile> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let existed = fs::try_exists(&path).await.unwrap_or(false);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        if existed {
            tracing::info!(path = %path.display(), "appending to existing file");
        } else {
            tracing::info!(
                path = %path.display(),
                source = %key.source_id,
                bucket = %key.bucket,
                "creating new file"
            );
        }
        let len = file
            .metadata()
            .await
            .with_context(|| format!("stat {}", path.display()))?
            .len();
        Ok(BucketFile {
            path,
            file,
            len,
            unsynced: 0,
        })
    }

    /// The line is handed to the OS before returning, so an acked record
    /// survives a process crash. `sync_interval` only sets the fsync cadence.
    async fn append(
        &self,
        _key: &SourceBucket,
        handle: &mut BucketFile,
        item: &PendingRecord,
    ) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(&StoredRecord {
            timestamp: item.timestamp,
            content: item.payload.clone(),
        })?;
        line.push(b'\n');
        let written = async {
            handle.file.write_all(&line).await?;
            handle.file.flush().await
        }
        .await;
        if let Err(e) = written {
            handle.truncate_to_last_line().await;
            return Err(e).with_context(|| format!("writing {}", handle.path.display()));
        }
        handle.len += line.len() as u64;
        handle.unsynced += 1;
        if handle.unsynced >= self.sync_interval {
            handle
                .file
                .sync_data()
                .await
                .with_context(|| format!("syncing {}", handle.path.display()))?;
            handle.unsynced = 0;
        }
        Ok(())
    }

    async fn close(&self, _key: &SourceBucket, mut handle: BucketFile) -> anyhow::Result<()> {
        handle.file.flush().await?;
        handle
            .file
            .sync_all()
            .await
            .with_context(|| format!("syncing {}", handle.path.display()))?;
        Ok(())
    }
}

/// Writes each record to the file for its source and calendar bucket.
pub struct FileSink {
    granularity: BucketGranularity,
    cache: Arc<KeyedResourceCache<BucketFileHandler>>,
}

impl FileSink {
    pub fn new(handler: BucketFileHandler, granularity: BucketGranularity, idle_ttl: Duration) -> Self {
        Self {
            granularity,
            cache: Arc::new(KeyedResourceCache::new("file", Arc::new(handler), idle_ttl)),
        }
    }

    pub fn key_for(&self, record: &PendingRecord) -> SourceBucket {
        SourceBucket {
            source_id: record.source_id.clone(),
            bucket: self.granularity.bucket_for(record.timestamp),
        }
    }

    pub fn cache(&self) -> &Arc<KeyedResourceCache<BucketFileHandler>> {
        &self.cache
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn write(&self, record: &PendingRecord) -> Result<()> {
        let key = self.key_for(record);
        self.cache
            .append(&key, record)
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

/// Read every record back from a bucket file.
pub async fn read_bucket_file(path: &Path) -> anyhow::Result<Vec<StoredRecord>> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).context("parsing stored record"))
        .collect()
}
