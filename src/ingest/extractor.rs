// src/ingest/extractor.rs
//! Timestamp extraction from raw payloads.
//!
//! Extractors are resolved by identifier through [`ExtractorRegistry`] once, when
//! a source is set up. Unknown identifiers are a startup error.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use regex::Regex;

use crate::error::{IngestError, Result};

/// Pulls a POSIX-seconds timestamp out of a payload.
///
/// `None` means the payload carries no recognizable timestamp.
pub trait TimestampExtractor: Send + Sync {
    fn extract(&self, payload: &str) -> Option<i64>;
}

/// Matches `<updatetime><![CDATA[1401551587]]></updatetime>` as served by the
/// bike-share station XML feed.
#[derive(Debug)]
pub struct UpdateTimeCdataExtractor {
    pattern: Regex,
}

impl UpdateTimeCdataExtractor {
    pub const ID: &'static str = "updatetime_cdata";

    pub fn new() -> Self {
        static RE: OnceCell<Regex> = OnceCell::new();
        let pattern = RE
            .get_or_init(|| {
                Regex::new(r"<updatetime><!\[CDATA\[(\d+)\]\]></updatetime>")
                    .expect("static updatetime pattern")
            })
            .clone();
        Self { pattern }
    }
}

impl Default for UpdateTimeCdataExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl TimestampExtractor for UpdateTimeCdataExtractor {
    fn extract(&self, payload: &str) -> Option<i64> {
        let caps = self.pattern.captures(payload)?;
        caps.get(1)?.as_str().parse().ok()
    }
}

/// Reads a top-level numeric `timestamp` (or `updatetime`) field from a JSON object.
#[derive(Debug, Default)]
pub struct JsonTimestampExtractor;

impl JsonTimestampExtractor {
    pub const ID: &'static str = "json_timestamp";
    const FIELDS: [&'static str; 2] = ["timestamp", "updatetime"];
}

impl TimestampExtractor for JsonTimestampExtractor {
    fn extract(&self, payload: &str) -> Option<i64> {
        let value: serde_json::Value = serde_json::from_str(payload).ok()?;
        let obj = value.as_object()?;
        Self::FIELDS.iter().find_map(|f| match obj.get(*f)? {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }
}

type Constructor = fn() -> Arc<dyn TimestampExtractor>;

/// Maps extractor identifiers to constructors.
#[derive(Clone)]
pub struct ExtractorRegistry {
    constructors: HashMap<String, Constructor>,
}

impl ExtractorRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry with the built-in extractors.
    pub fn with_builtins() -> Self {
        let mut reg = Self::empty();
        reg.register(UpdateTimeCdataExtractor::ID, || {
            Arc::new(UpdateTimeCdataExtractor::new())
        });
        reg.register(JsonTimestampExtractor::ID, || Arc::new(JsonTimestampExtractor));
        reg
    }

    pub fn register(&mut self, id: impl Into<String>, ctor: Constructor) {
        self.constructors.insert(id.into(), ctor);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.constructors.contains_key(id)
    }

    pub fn resolve(&self, id: &str) -> Result<Arc<dyn TimestampExtractor>> {
        self.constructors
            .get(id)
            .map(|ctor| ctor())
            .ok_or_else(|| IngestError::Config(format!("unknown timestamp parser '{id}'")))
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.constructors.keys().collect();
        ids.sort();
        f.debug_struct("ExtractorRegistry").field("ids", &ids).finish()
    }
}
