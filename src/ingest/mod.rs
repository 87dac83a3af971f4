// src/ingest/mod.rs
pub mod coordinator;
pub mod dedup;
pub mod extractor;
pub mod fetcher;
pub mod recovery;
pub mod scheduler;
pub mod types;

use metrics::{describe_counter, describe_gauge};
use once_cell::sync::OnceCell;

pub use coordinator::{CoordinatorOptions, Delivery, IngestionCoordinator, PollOutcome, SourceRuntime};
pub use types::{PendingRecord, RecordId, SourceConfig};

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_ticks_total", "Shared scheduler ticks.");
        describe_counter!("ingest_fetch_attempts_total", "Source download attempts.");
        describe_counter!(
            "ingest_fetch_failures_total",
            "Polls where every download attempt failed."
        );
        describe_counter!(
            "ingest_parse_failures_total",
            "Payloads without a recognizable timestamp."
        );
        describe_counter!(
            "ingest_duplicates_total",
            "Payloads dropped for a repeated timestamp."
        );
        describe_counter!("ingest_staged_total", "Records staged in the recovery store.");
        describe_counter!("ingest_acked_total", "Records acked by every sink.");
        describe_counter!("ingest_failed_total", "Record deliveries that failed.");
        describe_counter!("ingest_replayed_total", "Records re-emitted from the recovery store.");
        describe_counter!("resource_cache_opens_total", "Resource handles opened.");
        describe_counter!("resource_cache_evictions_total", "Resource handles closed.");
        describe_gauge!("ingest_last_tick_ts", "Unix ts of the last scheduler tick.");
    });
}
