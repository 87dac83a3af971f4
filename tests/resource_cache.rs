// tests/resource_cache.rs
//
// Keyed handle cache: one open per key under contention, idle eviction,
// exclusion between eviction and append, failed appends, shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use snapshot_ingest::error::CacheError;
use snapshot_ingest::resource_cache::{KeyedResourceCache, ResourceHandler};
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;

/// Handle is the list of appended items; every open/close is counted.
#[derive(Default)]
struct Journal {
    opens: AtomicUsize,
    closes: AtomicUsize,
    closed_items: AtomicUsize,
    /// When set, appends park until a permit is released.
    gate: Option<Arc<Semaphore>>,
    entered: Notify,
    /// Number of upcoming appends that write half an item and then fail.
    fail_appends: AtomicUsize,
}

#[async_trait]
impl ResourceHandler for Journal {
    type Key = String;
    type Handle = Vec<u64>;
    type Item = u64;

    async fn open(&self, _key: &String) -> anyhow::Result<Vec<u64>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        // widen the race window for concurrent first appends
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(Vec::new())
    }

    async fn append(&self, _key: &String, handle: &mut Vec<u64>, item: &u64) -> anyhow::Result<()> {
        if let Some(gate) = &self.gate {
            self.entered.notify_one();
            let _permit = gate.acquire().await?;
        }
        if self
            .fail_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            handle.push(u64::MAX);
            anyhow::bail!("disk full");
        }
        handle.push(*item);
        Ok(())
    }

    async fn close(&self, _key: &String, handle: Vec<u64>) -> anyhow::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed_items.fetch_add(handle.len(), Ordering::SeqCst);
        Ok(())
    }
}

fn cache(handler: Journal, ttl: Duration) -> Arc<KeyedResourceCache<Journal>> {
    Arc::new(KeyedResourceCache::new("journal", Arc::new(handler), ttl))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_appends_open_once() {
    let c = cache(Journal::default(), Duration::from_secs(60));
    let key = "bicing/2024-01".to_string();

    let mut handles = Vec::new();
    for i in 0..16u64 {
        let c = c.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move { c.append(&key, &i).await }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    assert_eq!(c.handler().opens.load(Ordering::SeqCst), 1);
    assert_eq!(c.len(), 1);

    assert_eq!(c.shutdown().await, 1);
    assert_eq!(c.handler().closes.load(Ordering::SeqCst), 1);
    assert_eq!(c.handler().closed_items.load(Ordering::SeqCst), 16);
}

#[tokio::test]
async fn idle_entry_is_closed_once_and_reopened_on_next_use() {
    let ttl = Duration::from_secs(180);
    let c = cache(Journal::default(), ttl);
    let key = "air/2024-01".to_string();

    c.append(&key, &1).await.unwrap();
    let later = Instant::now() + ttl + Duration::from_secs(1);
    assert_eq!(c.evict_idle_at(later).await, 1);
    assert!(!c.contains(&key));
    // second sweep finds nothing to close
    assert_eq!(c.evict_idle_at(later).await, 0);
    assert_eq!(c.handler().closes.load(Ordering::SeqCst), 1);

    c.append(&key, &2).await.unwrap();
    assert_eq!(c.handler().opens.load(Ordering::SeqCst), 2);
    assert!(c.contains(&key));
}

#[tokio::test]
async fn entries_within_ttl_survive_a_sweep() {
    let ttl = Duration::from_secs(180);
    let c = cache(Journal::default(), ttl);
    c.append(&"a".to_string(), &1).await.unwrap();
    assert_eq!(c.evict_idle_at(Instant::now() + ttl - Duration::from_secs(1)).await, 0);
    assert_eq!(c.handler().closes.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn eviction_skips_entry_with_append_in_flight() {
    let gate = Arc::new(Semaphore::new(0));
    let c = cache(
        Journal {
            gate: Some(gate.clone()),
            ..Journal::default()
        },
        Duration::from_millis(1),
    );
    let key = "busy".to_string();

    let writer = {
        let c = c.clone();
        let key = key.clone();
        tokio::spawn(async move { c.append(&key, &7).await })
    };
    c.handler().entered.notified().await;

    let far = Instant::now() + Duration::from_secs(3600);
    assert_eq!(c.evict_idle_at(far).await, 0);
    assert_eq!(c.handler().closes.load(Ordering::SeqCst), 0);

    gate.add_permits(1);
    writer.await.unwrap().unwrap();

    assert_eq!(c.evict_idle_at(far).await, 1);
    assert_eq!(c.handler().closes.load(Ordering::SeqCst), 1);
    assert_eq!(c.handler().closed_items.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_append_closes_the_handle() {
    let journal = Journal::default();
    journal.fail_appends.store(1, Ordering::SeqCst);
    let c = cache(journal, Duration::from_secs(60));
    let key = "bicing/2024-01".to_string();

    c.append(&key, &1).await.unwrap();
    let err = c.append(&key, &2).await.unwrap_err();
    assert!(matches!(err, CacheError::Append { .. }));
    // the handle holding the partial write is gone
    assert!(c.is_empty());
    assert_eq!(c.handler().closes.load(Ordering::SeqCst), 1);
    assert_eq!(c.handler().closed_items.load(Ordering::SeqCst), 2);

    c.append(&key, &2).await.unwrap();
    assert_eq!(c.handler().opens.load(Ordering::SeqCst), 2);
    assert_eq!(c.len(), 1);
    assert_eq!(c.shutdown().await, 1);
    assert_eq!(c.handler().closed_items.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn shutdown_force_closes_fresh_entries() {
    let c = cache(Journal::default(), Duration::from_secs(3600));
    for k in ["a", "b", "c"] {
        c.append(&k.to_string(), &1).await.unwrap();
    }
    assert_eq!(c.shutdown().await, 3);
    assert_eq!(c.handler().closes.load(Ordering::SeqCst), 3);
    assert!(c.is_shut_down());
    assert!(matches!(
        c.append(&"a".to_string(), &2).await,
        Err(CacheError::ShutDown)
    ));
    // nothing left for a second shutdown
    assert_eq!(c.shutdown().await, 0);
}

#[tokio::test(start_paused = true)]
async fn sweeper_closes_idle_entries_until_cancelled() {
    let c = cache(Journal::default(), Duration::from_secs(5));
    c.append(&"a".to_string(), &1).await.unwrap();

    let ct = tokio_util::sync::CancellationToken::new();
    let sweeper = c.spawn_sweeper(Duration::from_secs(2), ct.clone());

    tokio::time::sleep(Duration::from_secs(9)).await;
    assert!(c.is_empty());
    assert_eq!(c.handler().closes.load(Ordering::SeqCst), 1);

    ct.cancel();
    sweeper.await.unwrap();
}
