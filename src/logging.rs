// src/logging.rs
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const ENV_LOG_FORMAT: &str = "INGEST_LOG_FORMAT";
const DEFAULT_FILTER: &str = "snapshot_ingest=info,ingest=info,warn";

/// Install the global subscriber. Filter from `RUST_LOG`, JSON output when
/// `INGEST_LOG_FORMAT=json`, compact text otherwise.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let json = std::env::var(ENV_LOG_FORMAT)
        .ok()
        .is_some_and(|v| v.eq_ignore_ascii_case("json"));

    let res = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_current_span(false))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .try_init()
    };
    if res.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
