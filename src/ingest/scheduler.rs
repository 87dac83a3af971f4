// src/ingest/scheduler.rs
use std::time::Duration;

use metrics::{counter, gauge};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::ingest::types::SourceConfig;

pub fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Shared tick interval: gcd of every source's rounded refresh rate in ms.
///
/// Returns `None` for an empty set or when every rate rounds to zero.
pub fn tick_interval(sources: &[SourceConfig]) -> Option<Duration> {
    let ms = sources
        .iter()
        .map(SourceConfig::refresh_rate_ms)
        .fold(0, gcd);
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Per-source poll timer.
#[derive(Debug, Clone)]
pub struct SourceClock {
    refresh: Duration,
    last_poll: Option<Instant>,
}

impl SourceClock {
    /// A fresh clock is due on its first check.
    pub fn new(refresh: Duration) -> Self {
        Self {
            refresh,
            last_poll: None,
        }
    }

    pub fn refresh(&self) -> Duration {
        self.refresh
    }

    /// If the refresh rate has elapsed since the last poll, resets the timer and
    /// returns true.
    pub fn check_due(&mut self, now: Instant) -> bool {
        let due = match self.last_poll {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.refresh,
        };
        if due {
            self.last_poll = Some(now);
        }
        due
    }
}

/// Spawn the single shared tick loop.
///
/// Subscribers see the tick counter advance; ticks that arrive while a
/// subscriber is busy coalesce into one.
pub fn spawn_ticker(period: Duration, ct: CancellationToken) -> (watch::Receiver<u64>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(0u64);
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut n: u64 = 0;
        loop {
            tokio::select! {
                _ = ct.cancelled() => break,
                _ = ticker.tick() => {
                    n += 1;
                    counter!("ingest_ticks_total").increment(1);
                    gauge!("ingest_last_tick_ts").set(chrono::Utc::now().timestamp() as f64);
                    if tx.send(n).is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(target: "ingest", ticks = n, "tick loop stopped");
    });
    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src(id: &str, secs: f64) -> SourceConfig {
        SourceConfig {
            id: id.into(),
            url: "http://localhost/".into(),
            refresh_rate_seconds: secs,
            retries: 1,
            timestamp_parser: "json_timestamp".into(),
            directory: None,
            table: None,
        }
    }

    #[test]
    fn gcd_of_sixty_and_ninety_seconds() {
        let sources = vec![src("a", 60.0), src("b", 90.0)];
        assert_eq!(tick_interval(&sources), Some(Duration::from_millis(30_000)));
    }

    #[test]
    fn single_source_uses_own_rate() {
        assert_eq!(
            tick_interval(&[src("a", 2.5)]),
            Some(Duration::from_millis(2_500))
        );
    }

    #[test]
    fn fractional_rates_are_rounded_to_ms() {
        let sources = vec![src("a", 0.3333), src("b", 1.0)];
        assert_eq!(tick_interval(&sources), Some(Duration::from_millis(1)));
    }

    #[test]
    fn empty_or_zero_has_no_interval() {
        assert_eq!(tick_interval(&[]), None);
        assert_eq!(tick_interval(&[src("a", 0.0)]), None);
    }

    #[test]
    fn clock_is_due_first_then_every_refresh() {
        let t0 = Instant::now();
        let mut c = SourceClock::new(Duration::from_secs(60));
        assert!(c.check_due(t0));
        assert!(!c.check_due(t0 + Duration::from_secs(30)));
        assert!(c.check_due(t0 + Duration::from_secs(60)));
        assert!(!c.check_due(t0 + Duration::from_secs(90)));
        assert!(c.check_due(t0 + Duration::from_secs(120)));
    }

    #[test]
    fn polled_within_one_tick_of_rate() {
        // 60s and 90s sources on a 30s tick.
        let t0 = Instant::now();
        let tick = Duration::from_secs(30);
        let mut a = SourceClock::new(Duration::from_secs(60));
        let mut b = SourceClock::new(Duration::from_secs(90));
        let mut polls_a = vec![];
        let mut polls_b = vec![];
        for i in 0..=12u32 {
            let now = t0 + tick * i;
            if a.check_due(now) {
                polls_a.push(i * 30);
            }
            if b.check_due(now) {
                polls_b.push(i * 30);
            }
        }
        assert_eq!(polls_a, vec![0, 60, 120, 180, 240, 300, 360]);
        assert_eq!(polls_b, vec![0, 90, 180, 270, 360]);
    }
}
