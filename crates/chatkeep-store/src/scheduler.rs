//! Dual-cadence persistence of the flat chat document.
//!
//! Two trailing-edge debounced writers share one snapshot provider:
//!
//! - the **fast** tier stores the snapshot in the [`FastCache`] shortly
//!   after the last mutation, so a restart can paint immediately;
//! - the **slow** tier saves it through [`DiskBackend::save_kv`] after a
//!   longer quiet period.
//!
//! Every [`PersistenceScheduler::schedule`] call restarts both timers. A
//! quota failure switches the fast tier off for the scheduler's lifetime.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backend::DiskBackend;
use crate::config::PersistConfig;
use crate::fast_cache::FastCache;
use crate::scope::ScopeTicket;

/// Produces the document to persist, or `None` when there is nothing to
/// write yet.
pub type SnapshotFn = Arc<dyn Fn() -> Option<Value> + Send + Sync>;

#[derive(Clone)]
pub struct PersistenceScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    key: String,
    fast: Arc<dyn FastCache>,
    backend: Option<Arc<dyn DiskBackend>>,
    snapshot: SnapshotFn,
    config: PersistConfig,
    ticket: ScopeTicket,
    fast_disabled: AtomicBool,
    fast_timer: Mutex<Option<JoinHandle<()>>>,
    slow_timer: Mutex<Option<JoinHandle<()>>>,
    fast_writes: AtomicU64,
    slow_writes: AtomicU64,
}

impl PersistenceScheduler {
    pub fn new(
        key: impl Into<String>,
        fast: Arc<dyn FastCache>,
        backend: Option<Arc<dyn DiskBackend>>,
        snapshot: SnapshotFn,
        config: PersistConfig,
        ticket: ScopeTicket,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                key: key.into(),
                fast,
                backend,
                snapshot,
                config,
                ticket,
                fast_disabled: AtomicBool::new(false),
                fast_timer: Mutex::new(None),
                slow_timer: Mutex::new(None),
                fast_writes: AtomicU64::new(0),
                slow_writes: AtomicU64::new(0),
            }),
        }
    }

    /// Restart both debounce timers.
    pub fn schedule(&self) {
        if !self.inner.fast_disabled.load(Ordering::SeqCst) {
            let inner = Arc::clone(&self.inner);
            let delay = self.inner.config.fast_debounce();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                inner.write_fast(true).await;
            });
            replace_timer(&self.inner.fast_timer, Some(handle));
        }
        if self.inner.backend.is_some() {
            let inner = Arc::clone(&self.inner);
            let delay = self.inner.config.slow_debounce();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                inner.write_slow(true).await;
            });
            replace_timer(&self.inner.slow_timer, Some(handle));
        }
    }

    /// Drop pending timers without writing.
    pub fn cancel(&self) {
        replace_timer(&self.inner.fast_timer, None);
        replace_timer(&self.inner.slow_timer, None);
    }

    /// Write both tiers now, even after the scope has moved on: a scope
    /// switch flushes the outgoing scope's document this way.
    pub async fn flush(&self) {
        self.cancel();
        self.inner.write_fast(false).await;
        self.inner.write_slow(false).await;
    }

    /// Write the fast tier now.
    pub async fn write_fast_now(&self) {
        self.inner.write_fast(false).await;
    }

    pub fn is_fast_disabled(&self) -> bool {
        self.inner.fast_disabled.load(Ordering::SeqCst)
    }

    pub fn fast_writes(&self) -> u64 {
        self.inner.fast_writes.load(Ordering::Relaxed)
    }

    pub fn slow_writes(&self) -> u64 {
        self.inner.slow_writes.load(Ordering::Relaxed)
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Delay before a scheduled write reaches the slow tier.
    pub fn slow_delay(&self) -> Duration {
        self.inner.config.slow_debounce()
    }
}

fn replace_timer(slot: &Mutex<Option<JoinHandle<()>>>, next: Option<JoinHandle<()>>) {
    let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(previous) = slot.take() {
        previous.abort();
    }
    *slot = next;
}

impl SchedulerInner {
    /// Timer fires pass `check_scope`; explicit flushes do not.
    async fn write_fast(&self, check_scope: bool) {
        if self.fast_disabled.load(Ordering::SeqCst) || (check_scope && self.ticket.is_stale()) {
            return;
        }
        let Some(doc) = (self.snapshot)() else {
            return;
        };
        match self.fast.store(&self.key, &doc).await {
            Ok(()) => {
                self.fast_writes.fetch_add(1, Ordering::Relaxed);
                debug!(key = %self.key, "fast tier written");
            }
            Err(err) if err.is_quota() => {
                if !self.fast_disabled.swap(true, Ordering::SeqCst) {
                    warn!(key = %self.key, %err, "fast tier over quota, disabling it");
                    self.fast.remove(&self.key).await;
                }
            }
            Err(err) => warn!(key = %self.key, %err, "fast tier write failed"),
        }
    }

    async fn write_slow(&self, check_scope: bool) {
        let Some(backend) = &self.backend else {
            return;
        };
        if check_scope && self.ticket.is_stale() {
            debug!(key = %self.key, "skipping slow write for stale scope");
            return;
        }
        let Some(doc) = (self.snapshot)() else {
            return;
        };
        match backend.save_kv(&self.key, &doc).await {
            Ok(()) => {
                self.slow_writes.fetch_add(1, Ordering::Relaxed);
                debug!(key = %self.key, "slow tier written");
            }
            Err(err) => warn!(key = %self.key, %err, "slow tier write failed"),
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::fast_cache::LocalCache;
    use crate::scope::ScopeGeneration;
    use serde_json::json;
    use std::sync::atomic::AtomicI64;

    struct Fixture {
        scheduler: PersistenceScheduler,
        cache: Arc<LocalCache>,
        backend: Arc<MemoryBackend>,
        value: Arc<AtomicI64>,
        generation: ScopeGeneration,
    }

    fn fixture(quota: u64) -> Fixture {
        let cache = Arc::new(LocalCache::new("test", quota));
        let backend = Arc::new(MemoryBackend::new());
        let value = Arc::new(AtomicI64::new(0));
        let generation = ScopeGeneration::new();
        let source = Arc::clone(&value);
        let snapshot: SnapshotFn = Arc::new(move || Some(json!({"v": source.load(Ordering::SeqCst)})));
        let scheduler = PersistenceScheduler::new(
            "doc",
            cache.clone(),
            Some(backend.clone()),
            snapshot,
            PersistConfig::default(),
            generation.ticket(""),
        );
        Fixture {
            scheduler,
            cache,
            backend,
            value,
            generation,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bursts_collapse_into_one_trailing_write() {
        let f = fixture(1024);
        for i in 1..=3 {
            f.value.store(i, Ordering::SeqCst);
            f.scheduler.schedule();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(f.scheduler.fast_writes(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.scheduler.fast_writes(), 1);
        assert_eq!(f.cache.load("doc").await, Some(json!({"v": 3})));
        assert_eq!(f.scheduler.slow_writes(), 0);

        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(f.scheduler.slow_writes(), 1);
        assert_eq!(f.backend.kv_document("doc"), Some(json!({"v": 3})));
    }

    #[tokio::test(start_paused = true)]
    async fn quota_failure_disables_fast_tier_only() {
        let f = fixture(4);
        f.value.store(12345, Ordering::SeqCst);
        f.scheduler.schedule();
        tokio::time::sleep(Duration::from_millis(2100)).await;

        assert!(f.scheduler.is_fast_disabled());
        assert_eq!(f.scheduler.fast_writes(), 0);
        assert_eq!(f.scheduler.slow_writes(), 1);
        assert!(f.cache.load("doc").await.is_none());

        // Later mutations keep reaching the slow tier.
        f.value.store(7, Ordering::SeqCst);
        f.scheduler.schedule();
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(f.backend.kv_document("doc"), Some(json!({"v": 7})));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_pending_writes() {
        let f = fixture(1024);
        f.scheduler.schedule();
        f.scheduler.cancel();
        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert_eq!(f.scheduler.fast_writes(), 0);
        assert_eq!(f.scheduler.slow_writes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_writes_both_tiers_immediately() {
        let f = fixture(1024);
        f.value.store(9, Ordering::SeqCst);
        f.scheduler.schedule();
        f.scheduler.flush().await;
        assert_eq!(f.scheduler.fast_writes(), 1);
        assert_eq!(f.scheduler.slow_writes(), 1);

        // The timers were consumed by the flush.
        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert_eq!(f.scheduler.slow_writes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_scope_skips_timer_writes() {
        let f = fixture(1024);
        f.scheduler.schedule();
        f.generation.advance();
        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert_eq!(f.scheduler.fast_writes(), 0);
        assert!(f.backend.kv_document("doc").is_none());
    }
}
