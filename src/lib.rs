// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod config;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod metrics;
pub mod resource_cache;
pub mod sink;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::ingest::extractor::ExtractorRegistry;
use crate::ingest::fetcher::{HttpTransport, SourceFetcher};
use crate::ingest::recovery::SqliteRecoveryStore;
use crate::ingest::IngestionCoordinator;
use crate::sink::file::{BucketFileHandler, FileSink};
use crate::sink::table::{TableHandler, TableSink};
use crate::sink::{Sink, SinkSet};

pub use crate::error::{IngestError, Result as IngestResult};

/// Sinks described by the config, over the sources this instance owns.
pub fn build_sinks(cfg: &AppConfig, sources: &[ingest::SourceConfig]) -> SinkSet {
    let mut sinks = SinkSet::default();
    if let Some(fc) = &cfg.file_sink {
        let handler = BucketFileHandler::new(&fc.root, sources, fc.sync_interval);
        sinks.push(Arc::new(FileSink::new(handler, fc.granularity, fc.idle_ttl())));
    }
    if let Some(tc) = &cfg.table_sink {
        let handler = TableHandler::new(&tc.database, sources);
        sinks.push(Arc::new(TableSink::new(handler, tc.idle_ttl())));
    }
    sinks
}

/// Wire everything from config and run until `ct` is cancelled, then close
/// every sink handle.
pub async fn run(cfg: AppConfig, ct: CancellationToken) -> Result<()> {
    let registry = ExtractorRegistry::with_builtins();
    cfg.validate(&registry)?;
    let sources = cfg.owned_sources()?;

    let store = Arc::new(SqliteRecoveryStore::open(&cfg.recovery_db).context("opening recovery store")?);
    let transport = Arc::new(HttpTransport::new(cfg.http_timeout())?);
    let sinks = build_sinks(&cfg, &sources);

    let coordinator = Arc::new(
        IngestionCoordinator::new(
            sources,
            &registry,
            SourceFetcher::new(transport),
            store,
            Arc::new(sinks.clone()),
            cfg.coordinator_options(),
        )
        .context("setting up sources")?,
    );

    let sweep_ct = ct.child_token();
    let sweepers: Vec<_> = sinks
        .sinks()
        .iter()
        .filter_map(|s: &Arc<dyn Sink>| s.spawn_maintenance(cfg.sweep_interval(), sweep_ct.clone()))
        .collect();

    let res = coordinator.run(ct).await;

    sweep_ct.cancel();
    for s in sweepers {
        let _ = s.await;
    }
    sinks.shutdown().await;
    res.map_err(Into::into)
}
