// src/ingest/coordinator.rs
//! Poll -> extract -> dedup -> stage -> emit -> ack/fail, per owned source.
//!
//! Every accepted payload is staged in the [`RecoveryStore`] before it is
//! emitted, and only removed on ack. Failed records are queued for replay and
//! re-emitted from the store until they are acked.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{IngestError, Result};
use crate::ingest::dedup::DedupState;
use crate::ingest::extractor::{ExtractorRegistry, TimestampExtractor};
use crate::ingest::fetcher::SourceFetcher;
use crate::ingest::recovery::{count_by_source, RecoveryStore};
use crate::ingest::scheduler::{spawn_ticker, tick_interval, SourceClock};
use crate::ingest::types::{PendingRecord, RecordId, SourceConfig};
use crate::sink::Downstream;

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorOptions {
    /// Pause before re-emitting a failed record.
    pub replay_delay: Duration,
    /// How long in-flight work may run after shutdown is requested.
    pub shutdown_grace: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            replay_delay: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Mutable state of one source, owned by exactly one task.
pub struct SourceRuntime {
    pub config: SourceConfig,
    pub clock: SourceClock,
    pub dedup: DedupState,
    extractor: Arc<dyn TimestampExtractor>,
}

impl SourceRuntime {
    pub fn new(config: SourceConfig, extractor: Arc<dyn TimestampExtractor>) -> Self {
        let clock = SourceClock::new(Duration::from_millis(config.refresh_rate_ms()));
        Self {
            config,
            clock,
            dedup: DedupState::new(),
            extractor,
        }
    }
}

/// What happened to one emitted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Acked(RecordId),
    /// Queued for replay.
    Failed(RecordId),
}

/// Result of polling one source once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    FetchFailed,
    NoTimestamp,
    Duplicate(i64),
    /// The record could not be staged; nothing was emitted.
    StageFailed,
    Emitted(Delivery),
}

pub struct IngestionCoordinator {
    sources: Vec<SourceConfig>,
    extractors: HashMap<String, Arc<dyn TimestampExtractor>>,
    fetcher: SourceFetcher,
    store: Arc<dyn RecoveryStore>,
    downstream: Arc<dyn Downstream>,
    options: CoordinatorOptions,
    tick: Duration,
    replay_tx: mpsc::UnboundedSender<RecordId>,
    replay_rx: Mutex<Option<mpsc::UnboundedReceiver<RecordId>>>,
}

impl IngestionCoordinator {
    /// Validates the source set and resolves every extractor up front.
    pub fn new(
        sources: Vec<SourceConfig>,
        registry: &ExtractorRegistry,
        fetcher: SourceFetcher,
        store: Arc<dyn RecoveryStore>,
        downstream: Arc<dyn Downstream>,
        options: CoordinatorOptions,
    ) -> Result<Self> {
        if sources.is_empty() {
            return Err(IngestError::Config("no sources assigned to this instance".into()));
        }
        let mut seen = HashSet::new();
        let mut extractors = HashMap::new();
        for s in &sources {
            if !seen.insert(s.id.as_str()) {
                return Err(IngestError::Config(format!("duplicate source id '{}'", s.id)));
            }
            let ex = registry.resolve(&s.timestamp_parser).map_err(|e| {
                IngestError::Config(format!("source '{}': {e}", s.id))
            })?;
            extractors.insert(s.id.clone(), ex);
        }
        let tick = tick_interval(&sources).ok_or_else(|| {
            IngestError::Config("refresh rates must round to at least 1ms".into())
        })?;
        let (replay_tx, replay_rx) = mpsc::unbounded_channel();
        Ok(Self {
            sources,
            extractors,
            fetcher,
            store,
            downstream,
            options,
            tick,
            replay_tx,
            replay_rx: Mutex::new(Some(replay_rx)),
        })
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick
    }

    pub fn sources(&self) -> &[SourceConfig] {
        &self.sources
    }

    /// Fresh runtime state for every owned source.
    pub fn runtimes(&self) -> Vec<SourceRuntime> {
        self.sources
            .iter()
            .filter_map(|s| {
                let ex = self.extractors.get(&s.id)?.clone();
                Some(SourceRuntime::new(s.clone(), ex))
            })
            .collect()
    }

    /// Fetch, extract, dedup, stage and emit one snapshot for `rt`.
    pub async fn poll_once(&self, rt: &mut SourceRuntime) -> PollOutcome {
        let source = &rt.config;
        let payload = match self.fetcher.fetch(source).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(
                    target: "ingest",
                    source = %source.id,
                    error = %e,
                    retry_in_secs = source.refresh_rate_seconds,
                    "failed to download source, will retry next poll"
                );
                return PollOutcome::FetchFailed;
            }
        };

        let Some(timestamp) = rt.extractor.extract(&payload) else {
            counter!("ingest_parse_failures_total").increment(1);
            tracing::warn!(target: "ingest", source = %source.id, "could not parse timestamp");
            return PollOutcome::NoTimestamp;
        };

        // Dedup state only advances once the record is safely staged.
        if !rt.dedup.is_new(timestamp) {
            counter!("ingest_duplicates_total").increment(1);
            tracing::info!(
                target: "ingest",
                source = %source.id,
                timestamp,
                "skipping payload with repeated timestamp"
            );
            return PollOutcome::Duplicate(timestamp);
        }

        let record = PendingRecord::new(source.id.clone(), timestamp, payload);
        if let Err(e) = self.store.stage(&record).await {
            tracing::error!(
                target: "ingest",
                source = %source.id,
                timestamp,
                error = %e,
                "could not stage record, dropping until next poll"
            );
            return PollOutcome::StageFailed;
        }
        rt.dedup.accept(timestamp);
        counter!("ingest_staged_total").increment(1);

        PollOutcome::Emitted(self.emit(&record).await)
    }

    /// Hand a staged record downstream and ack or fail it.
    pub async fn emit(&self, record: &PendingRecord) -> Delivery {
        match self.downstream.deliver(record).await {
            Ok(()) => {
                self.ack(&record.record_id).await;
                Delivery::Acked(record.record_id)
            }
            Err(e) => {
                tracing::warn!(
                    target: "ingest",
                    source = %record.source_id,
                    record_id = %record.record_id,
                    error = %e,
                    "failed to process record, will retry"
                );
                self.fail(record.record_id);
                Delivery::Failed(record.record_id)
            }
        }
    }

    /// Remove an acked record from the store. Returns whether it was staged;
    /// unknown ids are a no-op.
    pub async fn ack(&self, id: &RecordId) -> bool {
        match self.store.remove(id).await {
            Ok(true) => {
                counter!("ingest_acked_total").increment(1);
                tracing::debug!(target: "ingest", record_id = %id, "finished processing record");
                true
            }
            Ok(false) => {
                tracing::debug!(target: "ingest", record_id = %id, "ack for a record that is not staged");
                false
            }
            Err(e) => {
                // The record stays staged and is replayed after restart.
                tracing::error!(target: "ingest", record_id = %id, error = %e, "could not remove acked record");
                false
            }
        }
    }

    /// Queue a record for replay.
    pub fn fail(&self, id: RecordId) {
        counter!("ingest_failed_total").increment(1);
        if self.replay_tx.send(id).is_err() {
            tracing::warn!(target: "ingest", record_id = %id, "replay queue closed, record stays staged");
        }
    }

    /// Re-emit a failed record from the store.
    ///
    /// Returns `None` when the id is no longer staged (already acked).
    pub async fn replay(&self, id: &RecordId) -> Result<Option<Delivery>> {
        let Some(record) = self.store.lookup(id).await? else {
            tracing::debug!(target: "ingest", record_id = %id, "record already acked, nothing to replay");
            return Ok(None);
        };
        counter!("ingest_replayed_total").increment(1);
        tracing::info!(
            target: "ingest",
            source = %record.source_id,
            record_id = %id,
            timestamp = record.timestamp,
            "replaying record"
        );
        Ok(Some(self.emit(&record).await))
    }

    /// Replay every queued failure once, without waiting. Returns how many were
    /// taken from the queue.
    pub async fn replay_queued(&self) -> usize {
        let mut ids = Vec::new();
        if let Ok(mut guard) = self.replay_rx.lock() {
            if let Some(rx) = guard.as_mut() {
                while let Ok(id) = rx.try_recv() {
                    ids.push(id);
                }
            }
        }
        for id in &ids {
            if let Err(e) = self.replay(id).await {
                tracing::error!(target: "ingest", record_id = %id, error = %e, "replay lookup failed");
                self.fail(*id);
            }
        }
        ids.len()
    }

    /// Emit every record left in the store by a previous run, once.
    pub async fn recover_pending(&self) -> Result<usize> {
        let pending = self.store.pending().await?;
        if pending.is_empty() {
            return Ok(0);
        }
        for (source, n) in count_by_source(&pending) {
            tracing::info!(target: "ingest", source, pending = n, "replaying records staged before restart");
        }
        for record in &pending {
            counter!("ingest_replayed_total").increment(1);
            self.emit(record).await;
        }
        Ok(pending.len())
    }

    async fn run_source(
        self: Arc<Self>,
        mut rt: SourceRuntime,
        mut ticks: watch::Receiver<u64>,
        ct: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = ct.cancelled() => break,
                changed = ticks.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if rt.clock.check_due(Instant::now()) {
                let outcome = self.poll_once(&mut rt).await;
                tracing::trace!(target: "ingest", source = %rt.config.id, ?outcome, "poll finished");
            }
        }
    }

    async fn run_replays(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<RecordId>,
        ct: CancellationToken,
    ) {
        loop {
            let id = tokio::select! {
                _ = ct.cancelled() => break,
                next = rx.recv() => match next {
                    Some(id) => id,
                    None => break,
                },
            };
            tokio::select! {
                _ = ct.cancelled() => break,
                _ = tokio::time::sleep(self.options.replay_delay) => {}
            }
            if let Err(e) = self.replay(&id).await {
                tracing::error!(target: "ingest", record_id = %id, error = %e, "replay lookup failed");
                self.fail(id);
            }
        }
    }

    /// Run until `ct` is cancelled.
    ///
    /// Records left in the store are replayed before the first tick. After
    /// cancellation, in-flight polls and replays get the configured grace
    /// period and are then aborted; their records stay staged.
    pub async fn run(self: Arc<Self>, ct: CancellationToken) -> Result<()> {
        let rx = self
            .replay_rx
            .lock()
            .ok()
            .and_then(|mut g| g.take())
            .ok_or_else(|| IngestError::Config("coordinator is already running".into()))?;

        let recovered = self.recover_pending().await?;
        tracing::info!(
            target: "ingest",
            sources = self.sources.len(),
            tick_ms = self.tick.as_millis() as u64,
            recovered,
            "ingestion coordinator started"
        );

        let (ticks, ticker) = spawn_ticker(self.tick, ct.clone());
        let mut tasks = JoinSet::new();
        tasks.spawn(self.clone().run_replays(rx, ct.clone()));
        for rt in self.runtimes() {
            tasks.spawn(self.clone().run_source(rt, ticks.clone(), ct.clone()));
        }

        ct.cancelled().await;
        tracing::info!(target: "ingest", "shutdown requested, waiting for in-flight work");
        let drained = tokio::time::timeout(self.options.shutdown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                target: "ingest",
                grace_secs = self.options.shutdown_grace.as_secs(),
                "grace period elapsed, abandoning in-flight work"
            );
            tasks.shutdown().await;
        }
        let _ = ticker.await;
        tracing::info!(target: "ingest", "ingestion coordinator stopped");
        Ok(())
    }
}
