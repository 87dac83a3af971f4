use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio_util::sync::CancellationToken;

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder and describe the ingest series.
    pub fn init() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;
        crate::ingest::ensure_metrics_described();
        Ok(Self { handle })
    }

    /// Returns a router exposing `/health` and `/metrics` (Prometheus exposition format).
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new()
            .route("/health", get(|| async { "OK" }))
            .route(
                "/metrics",
                get(move || {
                    let h = handle.clone();
                    async move { h.render() }
                }),
            )
    }

    /// Serve the admin router on `addr` until `ct` is cancelled.
    pub async fn serve(&self, addr: SocketAddr, ct: CancellationToken) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding admin listener on {addr}"))?;
        tracing::info!(%addr, "admin endpoints listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { ct.cancelled().await })
            .await
            .context("admin server")
    }
}
