//! Snapshot ingestion service, binary entrypoint.
//! Loads config, starts the admin endpoints (optional) and runs the
//! coordinator until Ctrl-C.

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use snapshot_ingest::{config, logging, metrics::Metrics};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    logging::init();

    let cfg = match config::load_default() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "there was an error loading configuration, stopping");
            return Err(e);
        }
    };
    let metrics = Metrics::init()?;

    let ct = CancellationToken::new();
    {
        let ct = ct.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("ctrl-c received");
            }
            ct.cancel();
        });
    }

    let admin = cfg.admin_addr.map(|addr| {
        let ct = ct.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics.serve(addr, ct).await {
                tracing::error!(error = %format!("{e:#}"), "admin server failed");
            }
        })
    });

    let res = snapshot_ingest::run(cfg, ct.clone()).await;
    ct.cancel();
    if let Some(h) = admin {
        let _ = h.await;
    }
    if let Err(e) = &res {
        tracing::error!(error = %format!("{e:#}"), "ingestion stopped with error");
    }
    res
}
