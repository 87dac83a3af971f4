// tests/run_e2e.rs
//
// Full wiring from config: local HTTP sources -> coordinator -> file + table
// sinks, then a clean shutdown.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use snapshot_ingest::config::AppConfig;
use snapshot_ingest::ingest::recovery::{RecoveryStore, SqliteRecoveryStore};
use snapshot_ingest::sink::file::read_bucket_file;
use tokio_util::sync::CancellationToken;

const BASE_TS: i64 = 1_704_067_200; // 2024-01-01T00:00:00Z

async fn spawn_sources() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let counter = Arc::new(AtomicI64::new(0));
    let app = Router::new()
        .route(
            "/live.json",
            get(move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { format!(r#"{{"timestamp": {}, "n": {n}}}"#, BASE_TS + n * 60) }
            }),
        )
        .route(
            "/stale.xml",
            get(|| async {
                "<stations><updatetime><![CDATA[1704067200]]></updatetime></stations>"
            }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, server)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn polls_dedups_and_persists_until_cancelled() {
    let (addr, server) = spawn_sources().await;
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().display().to_string();

    let cfg = AppConfig::parse(&format!(
        r#"
recovery_db = "{root}/state/recovery.db"
replay_delay_ms = 20
shutdown_grace_secs = 2

[file_sink]
root = "{root}/data"
sync_interval = 1

[table_sink]
database = "{root}/state/tables.db"

[[sources]]
id = "live"
url = "http://{addr}/live.json"
refresh_rate_seconds = 0.05
retries = 2
timestamp_parser = "json_timestamp"

[[sources]]
id = "stale"
url = "http://{addr}/stale.xml"
refresh_rate_seconds = 0.1
retries = 2
timestamp_parser = "updatetime_cdata"
"#
    ))
    .unwrap();

    let ct = CancellationToken::new();
    let run = tokio::spawn(snapshot_ingest::run(cfg, ct.clone()));
    tokio::time::sleep(Duration::from_millis(600)).await;
    ct.cancel();
    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run stops after cancellation")
        .unwrap()
        .unwrap();
    server.abort();

    let live = read_bucket_file(&dir.path().join("data/live/2024-01.jsonl")).await.unwrap();
    assert!(live.len() >= 2, "expected several live snapshots, got {}", live.len());
    assert!(live.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

    // the stale source never changes, so it is stored exactly once
    let stale = read_bucket_file(&dir.path().join("data/stale/2024-01.jsonl")).await.unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].timestamp, BASE_TS);

    let conn = rusqlite::Connection::open(dir.path().join("state/tables.db")).unwrap();
    let rows: i64 = conn
        .query_row(r#"SELECT COUNT(*) FROM "live""#, [], |r| r.get(0))
        .unwrap();
    assert_eq!(rows as usize, live.len());

    let store = SqliteRecoveryStore::open(&dir.path().join("state/recovery.db")).unwrap();
    assert!(store.pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn run_refuses_invalid_config() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().display().to_string();
    let mut cfg = AppConfig::parse(&format!(
        r#"
recovery_db = "{root}/recovery.db"

[file_sink]
root = "{root}/data"

[[sources]]
id = "a"
url = "http://127.0.0.1:9/a"
refresh_rate_seconds = 1
retries = 1
timestamp_parser = "json_timestamp"
"#
    ))
    .unwrap();
    cfg.sources[0].timestamp_parser = "unknown".into();

    let err = snapshot_ingest::run(cfg, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("unknown timestamp_parser"));
}
