//! Request-Lock: per-path mutual exclusion around connection opening.
//!
//! Keyed by the raw upgrade path, since identity is unknown until the
//! directory answers. Held around resolution and around the first CALL of a
//! session so two racing opens of the same path never resolve concurrently.
//!
//! Waiters are woken on release instead of polling, but still bounded by a
//! retry budget: once it is spent the waiter proceeds without the lock and
//! the attempt is logged. Forward progress wins over strict exclusion.

// ============================================================================
// Imports
// ============================================================================

use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tokio::time::{Instant, timeout_at};
use tracing::{error, trace, warn};

use crate::stats::GatewayStats;

// ============================================================================
// Constants
// ============================================================================

/// Upper bound on one wait, whatever the configured retry budget.
const MAX_WAIT_BUDGET: Duration = Duration::from_secs(24 * 60 * 60);

// ============================================================================
// Types
// ============================================================================

/// Current holder of one path.
struct LockEntry {
    token: u64,
    released: Arc<Notify>,
}

// ============================================================================
// RequestLock
// ============================================================================

/// Path-keyed lock with a bounded wait.
pub struct RequestLock {
    entries: Mutex<FxHashMap<String, LockEntry>>,
    next_token: AtomicU64,
    retry_count: u32,
    retry_interval: Duration,
    alarm_threshold: u32,
    consecutive_exhaustions: AtomicU32,
    stats: Arc<GatewayStats>,
}

impl std::fmt::Debug for RequestLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestLock")
            .field("held", &self.held_count())
            .field("retry_count", &self.retry_count)
            .field("retry_interval", &self.retry_interval)
            .finish_non_exhaustive()
    }
}

impl RequestLock {
    /// Creates a lock with the given wait budget.
    #[must_use]
    pub fn new(
        retry_count: u32,
        retry_interval: Duration,
        alarm_threshold: u32,
        stats: Arc<GatewayStats>,
    ) -> Self {
        Self {
            entries: Mutex::new(FxHashMap::default()),
            next_token: AtomicU64::new(1),
            retry_count,
            retry_interval,
            alarm_threshold,
            consecutive_exhaustions: AtomicU32::new(0),
            stats,
        }
    }

    /// Number of paths currently held.
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether `path` is currently held.
    #[must_use]
    pub fn is_held(&self, path: &str) -> bool {
        self.entries.lock().contains_key(path)
    }

    /// Acquires `path`, waiting at most `retry_count × retry_interval` in
    /// total.
    ///
    /// Releases wake waiters early without spending the budget. Always
    /// returns a guard: if the budget ran out the guard does not own the
    /// path ([`RequestLockGuard::is_owned`] is `false`).
    pub async fn acquire(&self, path: &str) -> RequestLockGuard<'_> {
        let budget = self
            .retry_interval
            .saturating_mul(self.retry_count)
            .min(MAX_WAIT_BUDGET);
        let deadline = Instant::now() + budget;

        loop {
            let released = match self.try_insert(path) {
                Ok(guard) => return guard,
                Err(released) => released,
            };

            if Instant::now() >= deadline {
                break;
            }

            let mut notified = pin!(released.notified());
            notified.as_mut().enable();

            // Released between the insert attempt and enabling the waiter.
            if !self.is_held(path) {
                continue;
            }

            let _ = timeout_at(deadline, notified).await;
        }

        self.stats.record_lock_exhausted();
        let exhausted = self.consecutive_exhaustions.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            path,
            budget_ms = u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
            "Request-Lock wait budget exhausted, proceeding without lock"
        );
        if exhausted >= self.alarm_threshold {
            error!(
                path,
                consecutive = exhausted,
                "Request-Lock capacity alarm: wait budget repeatedly exhausted"
            );
        }

        RequestLockGuard {
            lock: self,
            path: path.to_string(),
            token: None,
        }
    }

    fn try_insert(&self, path: &str) -> Result<RequestLockGuard<'_>, Arc<Notify>> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(path) {
            return Err(Arc::clone(&entry.released));
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            path.to_string(),
            LockEntry {
                token,
                released: Arc::new(Notify::new()),
            },
        );
        drop(entries);

        self.consecutive_exhaustions.store(0, Ordering::Relaxed);
        trace!(path, "Request-Lock acquired");

        Ok(RequestLockGuard {
            lock: self,
            path: path.to_string(),
            token: Some(token),
        })
    }

    fn release(&self, path: &str, token: u64) {
        let mut entries = self.entries.lock();
        if entries.get(path).is_some_and(|entry| entry.token == token)
            && let Some(entry) = entries.remove(path)
        {
            drop(entries);
            entry.released.notify_waiters();
            trace!(path, "Request-Lock released");
        }
    }
}

// ============================================================================
// RequestLockGuard
// ============================================================================

/// Releases the path on drop, if it was acquired.
#[derive(Debug)]
pub struct RequestLockGuard<'a> {
    lock: &'a RequestLock,
    path: String,
    token: Option<u64>,
}

impl RequestLockGuard<'_> {
    /// `false` if the wait budget ran out and the caller proceeds unlocked.
    #[inline]
    #[must_use]
    pub fn is_owned(&self) -> bool {
        self.token.is_some()
    }
}

impl Drop for RequestLockGuard<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token {
            self.lock.release(&self.path, token);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::time::timeout;

    fn lock(retry_count: u32, retry_interval_ms: u64) -> (Arc<RequestLock>, Arc<GatewayStats>) {
        let stats = Arc::new(GatewayStats::new());
        let lock = RequestLock::new(
            retry_count,
            Duration::from_millis(retry_interval_ms),
            2,
            Arc::clone(&stats),
        );
        (Arc::new(lock), stats)
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let (lock, _stats) = lock(3, 50);

        let guard = lock.acquire("/OCPP16/T1/TOK/D1").await;
        assert!(guard.is_owned());
        assert!(lock.is_held("/OCPP16/T1/TOK/D1"));

        drop(guard);
        assert!(!lock.is_held("/OCPP16/T1/TOK/D1"));
        assert_eq!(lock.held_count(), 0);
    }

    #[tokio::test]
    async fn test_waiter_proceeds_after_release() {
        let (lock, stats) = lock(10, 1_000);

        let guard = lock.acquire("/p").await;

        let waiter_lock = Arc::clone(&lock);
        let waiter = tokio::spawn(async move {
            let guard = waiter_lock.acquire("/p").await;
            guard.is_owned()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        let owned = timeout(Duration::from_millis(500), waiter)
            .await
            .expect("waiter should be woken by release")
            .unwrap();
        assert!(owned);
        assert_eq!(stats.snapshot().lock_exhausted, 0);
    }

    #[tokio::test]
    async fn test_wakeups_do_not_spend_budget() {
        let (lock, stats) = lock(2, 1_000);

        let holder = lock.acquire("/p").await;

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                tokio::spawn(async move {
                    let guard = lock.acquire("/p").await;
                    let owned = guard.is_owned();
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    owned
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(holder);

        for waiter in waiters {
            let owned = timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter should finish within the budget")
                .unwrap();
            assert!(owned);
        }
        assert_eq!(stats.snapshot().lock_exhausted, 0);
    }

    #[tokio::test]
    async fn test_exhausted_budget_proceeds_unowned() {
        let (lock, stats) = lock(2, 10);

        let holder = lock.acquire("/p").await;
        let second = lock.acquire("/p").await;

        assert!(holder.is_owned());
        assert!(!second.is_owned());
        assert_eq!(stats.snapshot().lock_exhausted, 1);

        // Dropping the unowned guard must not release the holder's entry.
        drop(second);
        assert!(lock.is_held("/p"));

        drop(holder);
        assert!(!lock.is_held("/p"));
    }

    #[tokio::test]
    async fn test_distinct_paths_do_not_block() {
        let (lock, _stats) = lock(0, 10);

        let a = lock.acquire("/a").await;
        let b = lock.acquire("/b").await;

        assert!(a.is_owned());
        assert!(b.is_owned());
        assert_eq!(lock.held_count(), 2);
    }

    #[tokio::test]
    async fn test_success_resets_exhaustion_streak() {
        let (lock, _stats) = lock(0, 5);

        let holder = lock.acquire("/p").await;
        let _ = lock.acquire("/p").await;
        assert_eq!(lock.consecutive_exhaustions.load(Ordering::Relaxed), 1);

        drop(holder);
        let _guard = lock.acquire("/p").await;
        assert_eq!(lock.consecutive_exhaustions.load(Ordering::Relaxed), 0);
    }
}
