// src/config.rs
use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

use crate::ingest::extractor::ExtractorRegistry;
use crate::ingest::types::SourceConfig;
use crate::ingest::CoordinatorOptions;
use crate::sink::bucket::BucketGranularity;
use crate::sink::file::source_directory;
use crate::sink::table::source_table;

pub const ENV_CONFIG_PATH: &str = "INGEST_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/ingest.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub recovery_db: PathBuf,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_replay_delay_ms")]
    pub replay_delay_ms: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default)]
    pub admin_addr: Option<SocketAddr>,
    #[serde(default)]
    pub shard: Option<ShardConfig>,
    #[serde(default)]
    pub file_sink: Option<FileSinkConfig>,
    #[serde(default)]
    pub table_sink: Option<TableSinkConfig>,
    pub sources: Vec<SourceConfig>,
}

/// Static split of the source list across instances.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ShardConfig {
    pub index: usize,
    pub count: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileSinkConfig {
    pub root: PathBuf,
    #[serde(default)]
    pub granularity: BucketGranularity,
    #[serde(default = "default_file_idle_minutes")]
    pub idle_eviction_minutes: u64,
    #[serde(default = "default_sync_interval")]
    pub sync_interval: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableSinkConfig {
    pub database: PathBuf,
    #[serde(default = "default_table_idle_minutes")]
    pub idle_eviction_minutes: u64,
}

fn default_sweep_interval_secs() -> u64 {
    30
}
fn default_shutdown_grace_secs() -> u64 {
    10
}
fn default_replay_delay_ms() -> u64 {
    1000
}
fn default_http_timeout_secs() -> u64 {
    30
}
fn default_file_idle_minutes() -> u64 {
    3
}
fn default_table_idle_minutes() -> u64 {
    10
}
fn default_sync_interval() -> usize {
    100
}

impl FileSinkConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_eviction_minutes * 60)
    }
}

impl TableSinkConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_eviction_minutes * 60)
    }
}

impl AppConfig {
    pub fn parse(s: &str) -> Result<Self> {
        let cfg: AppConfig = toml::from_str(s).context("parsing ingest config")?;
        cfg.validate(&ExtractorRegistry::with_builtins())?;
        Ok(cfg)
    }

    /// Startup checks; any failure here is fatal.
    pub fn validate(&self, registry: &ExtractorRegistry) -> Result<()> {
        if self.sources.is_empty() {
            bail!("no sources configured");
        }
        if self.file_sink.is_none() && self.table_sink.is_none() {
            bail!("at least one of [file_sink] or [table_sink] must be configured");
        }
        let mut ids = HashSet::new();
        for s in &self.sources {
            if s.id.trim().is_empty() {
                bail!("source with empty id");
            }
            if !ids.insert(s.id.as_str()) {
                bail!("found duplicated configuration for source [{}]", s.id);
            }
            if !(s.refresh_rate_seconds.is_finite() && s.refresh_rate_ms() > 0) {
                bail!("source [{}]: refresh_rate_seconds must be positive", s.id);
            }
            if s.retries == 0 {
                bail!("source [{}]: retries must be at least 1", s.id);
            }
            if !registry.contains(&s.timestamp_parser) {
                bail!(
                    "source [{}]: unknown timestamp_parser '{}'",
                    s.id,
                    s.timestamp_parser
                );
            }
        }
        if self.file_sink.is_some() {
            check_distinct(&self.sources, "directory", |s| source_directory(s).to_string())?;
        }
        if self.table_sink.is_some() {
            check_distinct(&self.sources, "table", source_table)?;
        }
        if let Some(shard) = self.shard {
            if shard.count == 0 || shard.index >= shard.count {
                bail!(
                    "invalid shard index {} for count {}",
                    shard.index,
                    shard.count
                );
            }
        }
        Ok(())
    }

    /// Sources owned by this instance.
    ///
    /// With sharding, sources are ordered by id and instance `i` of `n` takes
    /// every source at position `p` with `p % n == i`.
    pub fn owned_sources(&self) -> Result<Vec<SourceConfig>> {
        let Some(shard) = self.shard else {
            return Ok(self.sources.clone());
        };
        let mut sorted = self.sources.clone();
        sorted.sort_by(|a, b| a.id.cmp(&b.id));
        let owned: Vec<_> = sorted
            .into_iter()
            .enumerate()
            .filter(|(i, _)| i % shard.count == shard.index)
            .map(|(_, s)| s)
            .collect();
        if owned.is_empty() {
            return Err(anyhow!(
                "instance {} of {} is not responsible for any source",
                shard.index,
                shard.count
            ));
        }
        Ok(owned)
    }

    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            replay_delay: Duration::from_millis(self.replay_delay_ms),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }
}

/// Two sources resolving to the same sink target would write into each other.
fn check_distinct(
    sources: &[SourceConfig],
    what: &str,
    target: impl Fn(&SourceConfig) -> String,
) -> Result<()> {
    let mut seen: HashMap<String, &str> = HashMap::new();
    for s in sources {
        let t = target(s);
        if let Some(other) = seen.insert(t.clone(), &s.id) {
            bail!("sources [{other}] and [{}] both write to {what} '{t}'", s.id);
        }
    }
    Ok(())
}

/// Load config from an explicit path.
pub fn load_from(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading config from {}", path.display()))?;
    AppConfig::parse(&content).with_context(|| format!("in {}", path.display()))
}

/// Load config using env var + fallback:
/// 1) $INGEST_CONFIG_PATH
/// 2) config/ingest.toml
pub fn load_default() -> Result<AppConfig> {
    if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
        let pb = PathBuf::from(p);
        if !pb.exists() {
            return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
        }
        return load_from(&pb);
    }
    load_from(Path::new(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
recovery_db = "state/recovery.db"

[file_sink]
root = "data"

[[sources]]
id = "bicing"
url = "http://wservice.viabicing.cat/getstations.php?v=1"
refresh_rate_seconds = 60
retries = 3
timestamp_parser = "updatetime_cdata"

[[sources]]
id = "air"
url = "http://localhost/air.json"
refresh_rate_seconds = 90
retries = 2
timestamp_parser = "json_timestamp"
"#;

    #[test]
    fn parses_with_defaults() {
        let cfg = AppConfig::parse(BASE).unwrap();
        assert_eq!(cfg.sources.len(), 2);
        let fs = cfg.file_sink.as_ref().unwrap();
        assert_eq!(fs.granularity, BucketGranularity::Month);
        assert_eq!(fs.idle_ttl(), Duration::from_secs(180));
        assert_eq!(fs.sync_interval, 100);
        assert!(cfg.table_sink.is_none());
        assert_eq!(cfg.coordinator_options().replay_delay, Duration::from_secs(1));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let dup = BASE.replace("id = \"air\"", "id = \"bicing\"");
        let err = AppConfig::parse(&dup).unwrap_err();
        assert!(format!("{err:#}").contains("duplicated"));
    }

    #[test]
    fn rejects_unknown_parser() {
        let bad = BASE.replace("json_timestamp", "org.example.Parser");
        assert!(AppConfig::parse(&bad).is_err());
    }

    #[test]
    fn rejects_sources_sharing_a_table() {
        let cfg = BASE.replace("[file_sink]", "[table_sink]\ndatabase = \"db/t.db\"\n\n[file_sink]");
        let clash = cfg
            .replace("id = \"bicing\"", "id = \"bicing-bcn\"")
            .replace("id = \"air\"", "id = \"bicing_bcn\"");
        let err = AppConfig::parse(&clash).unwrap_err();
        assert!(format!("{err:#}").contains("table 'bicing_bcn'"), "{err:#}");

        let explicit = cfg.replace("retries = 2\n", "retries = 2\ntable = \"bicing\"\n");
        assert!(AppConfig::parse(&explicit).is_err());
        // the same ids are fine without a table sink
        let files_only = BASE
            .replace("id = \"bicing\"", "id = \"bicing-bcn\"")
            .replace("id = \"air\"", "id = \"bicing_bcn\"");
        assert!(AppConfig::parse(&files_only).is_ok());
    }

    #[test]
    fn rejects_sources_sharing_a_directory() {
        let shared = BASE
            .replace("retries = 3\n", "retries = 3\ndirectory = \"shared\"\n")
            .replace("retries = 2\n", "retries = 2\ndirectory = \"shared\"\n");
        let err = AppConfig::parse(&shared).unwrap_err();
        assert!(format!("{err:#}").contains("directory 'shared'"), "{err:#}");

        // a directory named after another source's id collides too
        let by_id = BASE.replace("retries = 2\n", "retries = 2\ndirectory = \"bicing\"\n");
        assert!(AppConfig::parse(&by_id).is_err());
    }

    #[test]
    fn rejects_missing_sinks() {
        let bad = BASE.replace("[file_sink]\nroot = \"data\"\n", "");
        assert!(AppConfig::parse(&bad).is_err());
    }

    #[test]
    fn shards_by_sorted_id() {
        let mut cfg = AppConfig::parse(BASE).unwrap();
        cfg.shard = Some(ShardConfig { index: 0, count: 2 });
        let ids: Vec<_> = cfg.owned_sources().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["air"]);
        cfg.shard = Some(ShardConfig { index: 1, count: 2 });
        let ids: Vec<_> = cfg.owned_sources().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["bicing"]);
        cfg.shard = Some(ShardConfig { index: 2, count: 3 });
        assert!(cfg.owned_sources().is_err());
    }
}
