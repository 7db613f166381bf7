//! Processing coordinator: one reply pipeline per slot at a time.
//!
//! Each id owns a lease entry with its own lock and FIFO waiter queue.
//! Entries are created lazily by `start` and removed entirely by `end`.
//! The table lock only guards lookup/insert/remove, and no lock in this
//! module is ever held across an `.await`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::CoordinatorError;

struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct LeaseState {
    held: bool,
    /// Set by `end`; a released entry is dead and must not be reused.
    released: bool,
    waiters: VecDeque<Waiter>,
}

#[derive(Default)]
struct LeaseEntry {
    state: Mutex<LeaseState>,
}

impl LeaseEntry {
    /// Remove a waiter. Returns false if it was already resolved.
    fn remove_waiter(&self, waiter_id: u64) -> bool {
        let mut state = self.state.lock();
        let before = state.waiters.len();
        state.waiters.retain(|w| w.id != waiter_id);
        state.waiters.len() != before
    }
}

/// Removes its waiter from the queue unless the wait completed normally.
struct WaiterGuard<'a> {
    entry: &'a LeaseEntry,
    waiter_id: u64,
    armed: bool,
}

impl WaiterGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }

    fn remove(&mut self) -> bool {
        self.armed = false;
        self.entry.remove_waiter(self.waiter_id)
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.entry.remove_waiter(self.waiter_id);
        }
    }
}

/// Per-id exclusive processing leases with bounded waiting.
#[derive(Default)]
pub struct ProcessingCoordinator {
    leases: RwLock<HashMap<String, Arc<LeaseEntry>>>,
    next_waiter: AtomicU64,
}

impl ProcessingCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn entry(&self, id: &str) -> Option<Arc<LeaseEntry>> {
        self.leases.read().get(id).cloned()
    }

    fn entry_or_insert(&self, id: &str) -> Arc<LeaseEntry> {
        if let Some(entry) = self.entry(id) {
            return entry;
        }
        let mut leases = self.leases.write();
        Arc::clone(leases.entry(id.to_string()).or_default())
    }

    /// Acquire the lease for `id`. Succeeds without blocking when already held.
    pub fn start(&self, id: &str) {
        self.acquire(id, true);
    }

    /// Acquire the lease only if nobody holds it.
    pub fn try_start(&self, id: &str) -> bool {
        self.acquire(id, false)
    }

    fn acquire(&self, id: &str, reentrant: bool) -> bool {
        loop {
            let entry = self.entry_or_insert(id);
            let mut state = entry.state.lock();
            if state.released {
                // Raced with `end`; the next lookup creates a fresh entry.
                continue;
            }
            if state.held {
                if reentrant {
                    debug!(id, "Lease already held, start is a no-op");
                }
                return reentrant;
            }
            state.held = true;
            debug!(id, "Lease acquired");
            return true;
        }
    }

    /// Acquire a lease that is released when dropped.
    pub fn try_lease(self: &Arc<Self>, id: &str) -> Option<ProcessingLease> {
        self.try_start(id).then(|| ProcessingLease {
            coordinator: Arc::clone(self),
            id: id.to_string(),
        })
    }

    /// Release the lease, wake every waiter in arrival order and drop all
    /// bookkeeping for `id`.
    pub fn end(&self, id: &str) {
        let Some(entry) = self.entry(id) else {
            return;
        };
        let mut state = entry.state.lock();
        if state.released {
            return;
        }
        state.released = true;
        state.held = false;
        let woken = state.waiters.len();
        for waiter in state.waiters.drain(..) {
            let _ = waiter.tx.send(());
        }

        {
            let mut leases = self.leases.write();
            if leases.get(id).is_some_and(|current| Arc::ptr_eq(current, &entry)) {
                leases.remove(id);
            }
        }
        drop(state);
        debug!(id, woken, "Lease released");
    }

    /// Wait until the lease for `id` is released.
    ///
    /// Returns immediately when nothing is held. Fails with
    /// [`CoordinatorError::Timeout`] after `timeout`; the waiter is removed
    /// from the queue in that case and when this future is dropped early.
    pub async fn wait_for_process(&self, id: &str, timeout: Duration) -> Result<(), CoordinatorError> {
        let Some(entry) = self.entry(id) else {
            return Ok(());
        };

        let (waiter_id, rx) = {
            let mut state = entry.state.lock();
            if state.released || !state.held {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            let waiter_id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
            state.waiters.push_back(Waiter { id: waiter_id, tx });
            (waiter_id, rx)
        };

        let mut guard = WaiterGuard {
            entry: &entry,
            waiter_id,
            armed: true,
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(_) => {
                guard.disarm();
                Ok(())
            }
            Err(_) => {
                if !guard.remove() {
                    // `end` resolved us between the deadline and the cleanup.
                    return Ok(());
                }
                warn!(id, timeout_ms = timeout.as_millis() as u64, "Timed out waiting for processing");
                Err(CoordinatorError::Timeout {
                    id: id.to_string(),
                    timeout,
                })
            }
        }
    }

    pub fn is_processing(&self, id: &str) -> bool {
        self.entry(id).is_some_and(|entry| {
            let state = entry.state.lock();
            state.held && !state.released
        })
    }

    pub fn waiter_count(&self, id: &str) -> usize {
        self.entry(id)
            .map(|entry| entry.state.lock().waiters.len())
            .unwrap_or(0)
    }

    /// Number of ids with live bookkeeping.
    pub fn active_leases(&self) -> usize {
        self.leases.read().len()
    }
}

/// Exclusive ownership of one id's pipeline. Calls `end` on drop.
pub struct ProcessingLease {
    coordinator: Arc<ProcessingCoordinator>,
    id: String,
}

impl ProcessingLease {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for ProcessingLease {
    fn drop(&mut self) {
        self.coordinator.end(&self.id);
    }
}

impl std::fmt::Debug for ProcessingLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingLease").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    async fn wait_for_waiters(c: &ProcessingCoordinator, id: &str, n: usize) {
        while c.waiter_count(id) < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_idle() {
        let c = ProcessingCoordinator::new();
        c.wait_for_process("group-1", ms(10)).await.unwrap();
        assert_eq!(c.active_leases(), 0);
    }

    #[tokio::test]
    async fn start_is_idempotent_and_try_start_conflicts() {
        let c = ProcessingCoordinator::new();
        c.start("g");
        c.start("g");
        assert!(c.is_processing("g"));
        assert!(!c.try_start("g"));
        assert_eq!(c.active_leases(), 1);

        c.end("g");
        assert!(!c.is_processing("g"));
        assert_eq!(c.active_leases(), 0);
        assert!(c.try_start("g"));
    }

    #[tokio::test]
    async fn end_without_start_is_noop() {
        let c = ProcessingCoordinator::new();
        c.end("missing");
        assert_eq!(c.active_leases(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_times_out_and_is_removed() {
        let c = ProcessingCoordinator::new();
        c.start("g");
        let err = c.wait_for_process("g", ms(800)).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Timeout { ref id, timeout } if id == "g" && timeout == ms(800)));
        assert_eq!(c.waiter_count("g"), 0);
        assert!(c.is_processing("g"));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_timeouts_do_not_grow_bookkeeping() {
        let c = ProcessingCoordinator::new();
        c.start("g");
        for _ in 0..100 {
            assert!(c.wait_for_process("g", ms(5)).await.is_err());
        }
        assert_eq!(c.waiter_count("g"), 0);
        assert_eq!(c.active_leases(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_wait_removes_waiter() {
        let c = ProcessingCoordinator::new();
        c.start("g");
        let outer = tokio::time::timeout(ms(10), c.wait_for_process("g", Duration::from_secs(60))).await;
        assert!(outer.is_err());
        assert_eq!(c.waiter_count("g"), 0);
    }

    #[tokio::test]
    async fn end_wakes_waiters_in_fifo_order() {
        let c = ProcessingCoordinator::new();
        c.start("g");
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..3 {
            let c2 = Arc::clone(&c);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                c2.wait_for_process("g", Duration::from_secs(5)).await.unwrap();
                order.lock().push(i);
            }));
            wait_for_waiters(&c, "g", i + 1).await;
        }

        c.end("g");
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(c.active_leases(), 0);
    }

    #[tokio::test]
    async fn ids_are_independent() {
        let c = ProcessingCoordinator::new();
        c.start("a");
        c.wait_for_process("b", ms(1)).await.unwrap();
        assert!(c.try_start("b"));
        assert_eq!(c.active_leases(), 2);
        c.end("a");
        assert!(c.is_processing("b"));
    }

    #[tokio::test]
    async fn lease_guard_releases_on_drop() {
        let c = ProcessingCoordinator::new();
        {
            let lease = c.try_lease("g").expect("free lease");
            assert_eq!(lease.id(), "g");
            assert!(c.try_lease("g").is_none());
        }
        assert!(!c.is_processing("g"));
        assert_eq!(c.active_leases(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn at_most_one_holder_under_contention() {
        let c = ProcessingCoordinator::new();
        let active = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = Arc::clone(&c);
            let active = Arc::clone(&active);
            let completed = Arc::clone(&completed);
            handles.push(tokio::spawn(async move {
                let mut runs = 0;
                while runs < 5 {
                    if c.wait_for_process("slot", Duration::from_secs(5)).await.is_err() {
                        continue;
                    }
                    let Some(lease) = c.try_lease("slot") else {
                        tokio::task::yield_now().await;
                        continue;
                    };
                    let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
                    assert_eq!(now_active, 1);
                    tokio::time::sleep(ms(1)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    drop(lease);
                    runs += 1;
                    completed.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(completed.load(Ordering::SeqCst), 40);
        assert_eq!(c.active_leases(), 0);
    }
}
