// src/sink/bucket.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Calendar granularity used to route records to per-bucket files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BucketGranularity {
    #[default]
    Month,
    Day,
}

impl BucketGranularity {
    /// Bucket key for a POSIX-seconds timestamp, in UTC (`2024-01` or `2024-01-31`).
    ///
    /// Out-of-range timestamps fall into the epoch bucket.
    pub fn bucket_for(self, timestamp: i64) -> String {
        let dt = DateTime::<Utc>::from_timestamp(timestamp, 0).unwrap_or_default();
        match self {
            BucketGranularity::Month => dt.format("%Y-%m").to_string(),
            BucketGranularity::Day => dt.format("%Y-%m-%d").to_string(),
        }
    }
}
