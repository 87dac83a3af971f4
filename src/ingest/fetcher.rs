// src/ingest/fetcher.rs
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use metrics::counter;

use crate::error::FetchError;
use crate::ingest::types::SourceConfig;

/// Raw single-shot GET against a source.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str) -> Result<String>;
}

/// reqwest-backed transport. Non-2xx responses are errors.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("snapshot-ingest/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building http client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str) -> Result<String> {
        let resp = self.client.get(url).send().await.context("http get")?;
        let resp = resp.error_for_status().context("http status")?;
        resp.text().await.context("reading http body")
    }
}

/// Fetches a source with up to `retries` immediate attempts.
#[derive(Clone)]
pub struct SourceFetcher {
    transport: Arc<dyn Transport>,
}

impl SourceFetcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub async fn fetch(&self, source: &SourceConfig) -> std::result::Result<String, FetchError> {
        let attempts = source.retries.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            counter!("ingest_fetch_attempts_total").increment(1);
            match self.transport.get(&source.url).await {
                Ok(body) => return Ok(body),
                Err(e) => {
                    tracing::warn!(
                        target: "ingest",
                        source = %source.id,
                        attempt,
                        attempts,
                        error = %format!("{e:#}"),
                        "error downloading source"
                    );
                    last_error = format!("{e:#}");
                }
            }
        }
        counter!("ingest_fetch_failures_total").increment(1);
        Err(FetchError::Exhausted {
            source_id: source.id.clone(),
            attempts,
            last_error,
        })
    }
}
