//! Keyed cache of long-lived write handles (files, table connections).
//!
//! Handles are opened lazily on first use of a key, reused across calls, and
//! closed when idle longer than the TTL or when the cache is shut down.
//!
//! Each key owns a slot guarded by an async mutex. Open, append and close for a
//! key all run under that slot's lock, so:
//! - concurrent callers for one key wait for a single `open`;
//! - eviction never overlaps an append on the same key;
//! - a slot that was evicted, or whose append failed, is marked retired and callers still queued on it
//!   go back to the map for a fresh slot, so there is never more than one live
//!   handle per key.

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::CacheError;

/// Open/append/close contract for a cached resource.
#[async_trait]
pub trait ResourceHandler: Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Display + Send + Sync + 'static;
    type Handle: Send + 'static;
    type Item: Send + Sync + 'static;

    async fn open(&self, key: &Self::Key) -> anyhow::Result<Self::Handle>;

    async fn append(
        &self,
        key: &Self::Key,
        handle: &mut Self::Handle,
        item: &Self::Item,
    ) -> anyhow::Result<()>;

    async fn close(&self, key: &Self::Key, handle: Self::Handle) -> anyhow::Result<()>;
}

struct SlotState<V> {
    handle: Option<V>,
    last_access: Instant,
    retired: bool,
}

type Slot<V> = Arc<AsyncMutex<SlotState<V>>>;

pub struct KeyedResourceCache<H: ResourceHandler> {
    name: &'static str,
    handler: Arc<H>,
    idle_ttl: Duration,
    slots: Mutex<HashMap<H::Key, Slot<H::Handle>>>,
    closed: AtomicBool,
}

impl<H: ResourceHandler> KeyedResourceCache<H> {
    pub fn new(name: &'static str, handler: Arc<H>, idle_ttl: Duration) -> Self {
        Self {
            name,
            handler,
            idle_ttl,
            slots: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn idle_ttl(&self) -> Duration {
        self.idle_ttl
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Number of keys with a slot (open, opening, or being closed).
    pub fn len(&self) -> usize {
        self.slots.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &H::Key) -> bool {
        self.slots
            .lock()
            .map(|m| m.contains_key(key))
            .unwrap_or(false)
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<H::Key, Slot<H::Handle>>> {
        // A panic while holding this lock cannot leave the map half-updated.
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn slot_for(&self, key: &H::Key) -> Result<Slot<H::Handle>, CacheError> {
        let mut slots = self.lock_slots();
        if self.closed.load(Ordering::SeqCst) {
            return Err(CacheError::ShutDown);
        }
        let slot = slots.entry(key.clone()).or_insert_with(|| {
            Arc::new(AsyncMutex::new(SlotState {
                handle: None,
                last_access: Instant::now(),
                retired: false,
            }))
        });
        Ok(slot.clone())
    }

    fn forget(&self, key: &H::Key, slot: &Slot<H::Handle>) {
        let mut slots = self.lock_slots();
        if slots.get(key).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(key);
        }
    }

    fn snapshot(&self) -> Vec<(H::Key, Slot<H::Handle>)> {
        self.lock_slots()
            .iter()
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect()
    }

    /// Append `item` to the handle for `key`, opening it first if needed.
    ///
    /// Open failures propagate and leave nothing cached for the key. A failed
    /// append closes the handle.
    pub async fn append(&self, key: &H::Key, item: &H::Item) -> Result<(), CacheError> {
        loop {
            let slot = self.slot_for(key)?;
            let mut st = slot.clone().lock_owned().await;
            if st.retired {
                continue;
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(CacheError::ShutDown);
            }
            if st.handle.is_none() {
                match self.handler.open(key).await {
                    Ok(h) => {
                        counter!("resource_cache_opens_total", "cache" => self.name).increment(1);
                        tracing::info!(cache = self.name, key = %key, "opened resource");
                        st.handle = Some(h);
                    }
                    Err(e) => {
                        st.retired = true;
                        self.forget(key, &slot);
                        return Err(CacheError::Open {
                            key: key.to_string(),
                            message: format!("{e:#}"),
                        });
                    }
                }
            }
            st.last_access = Instant::now();
            let Some(handle) = st.handle.as_mut() else {
                continue;
            };
            let res = self.handler.append(key, handle, item).await;
            st.last_access = Instant::now();
            if let Err(e) = res {
                // The handle may hold a partial write; the next append reopens.
                self.retire(key, &slot, st, "append failed").await;
                return Err(CacheError::Append {
                    key: key.to_string(),
                    message: format!("{e:#}"),
                });
            }
            return Ok(());
        }
    }

    async fn retire(
        &self,
        key: &H::Key,
        slot: &Slot<H::Handle>,
        mut st: OwnedMutexGuard<SlotState<H::Handle>>,
        reason: &'static str,
    ) {
        if let Some(handle) = st.handle.take() {
            counter!("resource_cache_evictions_total", "cache" => self.name).increment(1);
            tracing::info!(cache = self.name, key = %key, reason, "closing resource");
            if let Err(e) = self.handler.close(key, handle).await {
                tracing::error!(
                    cache = self.name,
                    key = %key,
                    error = %format!("{e:#}"),
                    "error closing resource"
                );
            }
        }
        st.retired = true;
        self.forget(key, slot);
    }

    /// Close every entry idle for longer than the TTL as of `now`.
    ///
    /// Entries busy with an open or append are skipped this round.
    pub async fn evict_idle_at(&self, now: Instant) -> usize {
        let mut evicted = 0;
        for (key, slot) in self.snapshot() {
            let Ok(st) = slot.clone().try_lock_owned() else {
                continue;
            };
            if st.retired || now.saturating_duration_since(st.last_access) <= self.idle_ttl {
                continue;
            }
            self.retire(&key, &slot, st, "idle").await;
            evicted += 1;
        }
        evicted
    }

    pub async fn evict_idle(&self) -> usize {
        self.evict_idle_at(Instant::now()).await
    }

    /// Close every entry regardless of idle time and refuse further appends.
    ///
    /// Waits for in-flight appends to finish.
    pub async fn shutdown(&self) -> usize {
        {
            let _slots = self.lock_slots();
            self.closed.store(true, Ordering::SeqCst);
        }
        let mut closed = 0;
        loop {
            let entries = self.snapshot();
            if entries.is_empty() {
                break;
            }
            for (key, slot) in entries {
                let st = slot.clone().lock_owned().await;
                if st.retired {
                    self.forget(&key, &slot);
                    continue;
                }
                self.retire(&key, &slot, st, "shutdown").await;
                closed += 1;
            }
        }
        tracing::info!(cache = self.name, closed, "resource cache shut down");
        closed
    }

    /// Periodic idle sweep until `ct` is cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration, ct: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ct.cancelled() => break,
                    _ = ticker.tick() => {
                        let n = cache.evict_idle().await;
                        if n > 0 {
                            tracing::debug!(cache = cache.name, evicted = n, "idle sweep");
                        }
                    }
                }
            }
        })
    }
}
