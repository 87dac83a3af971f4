// src/ingest/dedup.rs
/// Last accepted timestamp for one source.
///
/// Owned by the task that polls the source, so it needs no lock.
#[derive(Debug, Clone, Default)]
pub struct DedupState {
    last_seen: Option<i64>,
}

impl DedupState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `timestamp` is strictly newer than the last accepted one.
    /// Does not record it.
    pub fn is_new(&self, timestamp: i64) -> bool {
        self.last_seen.map_or(true, |last| timestamp > last)
    }

    /// Accepts `timestamp` iff it is strictly newer than the last accepted one,
    /// recording it on acceptance.
    pub fn accept(&mut self, timestamp: i64) -> bool {
        if !self.is_new(timestamp) {
            return false;
        }
        self.last_seen = Some(timestamp);
        true
    }

    pub fn last_seen(&self) -> Option<i64> {
        self.last_seen
    }
}
