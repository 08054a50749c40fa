//! Work queue and per-destination locks
//!
//! The [`WorkQueue`] holds settled top-level paths in FIFO order. A path is
//! either pending, in flight (leased by a worker) or absent; enqueueing a
//! pending or in-flight path is a no-op, so each item has at most one
//! worker. A path that reappears while in flight can be re-armed and is
//! queued again as soon as its current lease is released.
//!
//! [`IdentityLocks`] serializes placement across workers for items that
//! resolve to the same destination media unit.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::metadata::MediaIdentity;

/// What happened to an enqueue request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    AlreadyQueued,
    /// Suppressed: a worker currently holds this path
    InFlight,
    /// Will be queued again when the current lease is released
    Rearmed,
    Closed,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<PathBuf>,
    queued: HashSet<PathBuf>,
    in_flight: HashSet<PathBuf>,
    rearmed: HashSet<PathBuf>,
    closed: bool,
}

/// FIFO queue of settled item paths
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a path unless it is already pending or in flight
    pub fn enqueue(&self, path: impl Into<PathBuf>) -> EnqueueOutcome {
        let path = path.into();
        let mut state = self.state.lock();

        if state.closed {
            return EnqueueOutcome::Closed;
        }
        if state.queued.contains(&path) {
            return EnqueueOutcome::AlreadyQueued;
        }
        if state.in_flight.contains(&path) {
            return EnqueueOutcome::InFlight;
        }

        debug!(item = %path.display(), "Queued item");
        state.queued.insert(path.clone());
        state.pending.push_back(path);
        drop(state);

        self.notify.notify_one();
        EnqueueOutcome::Queued
    }

    /// Enqueue a path that was freshly re-created.
    ///
    /// If a worker holds the path, it is queued again once that lease ends.
    pub fn rearm(&self, path: impl Into<PathBuf>) -> EnqueueOutcome {
        let path = path.into();
        {
            let mut state = self.state.lock();
            if state.closed {
                return EnqueueOutcome::Closed;
            }
            if state.in_flight.contains(&path) {
                debug!(item = %path.display(), "Re-armed in-flight item");
                state.rearmed.insert(path);
                return EnqueueOutcome::Rearmed;
            }
        }
        self.enqueue(path)
    }

    /// Whether the path is pending or in flight
    pub fn is_active(&self, path: &Path) -> bool {
        let state = self.state.lock();
        state.queued.contains(path) || state.in_flight.contains(path)
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Stop handing out work; waiting workers return `None`
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Wait for the next item. Returns `None` on cancellation or close.
    pub async fn dequeue(self: &Arc<Self>, cancel: &CancellationToken) -> Option<Lease> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(path) = state.pending.pop_front() {
                    state.queued.remove(&path);
                    state.in_flight.insert(path.clone());
                    return Some(Lease {
                        queue: Arc::clone(self),
                        path,
                    });
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    fn release(&self, path: &Path) {
        let mut state = self.state.lock();
        state.in_flight.remove(path);
        if state.rearmed.remove(path) && !state.closed {
            debug!(item = %path.display(), "Re-queued re-armed item");
            state.queued.insert(path.to_path_buf());
            state.pending.push_back(path.to_path_buf());
            drop(state);
            self.notify.notify_one();
        }
    }
}

/// Exclusive hold on one dequeued path; released on drop
pub struct Lease {
    queue: Arc<WorkQueue>,
    path: PathBuf,
}

impl Lease {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.queue.release(&self.path);
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("path", &self.path).finish()
    }
}

/// Lock table keyed by destination media identity
#[derive(Default)]
pub struct IdentityLocks {
    locks: Mutex<HashMap<MediaIdentity, Arc<tokio::sync::Mutex<()>>>>,
}

impl IdentityLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquire every identity in sorted order, waiting for current holders
    pub async fn acquire_all(
        self: &Arc<Self>,
        identities: BTreeSet<MediaIdentity>,
    ) -> IdentityGuard {
        let mut held = Vec::with_capacity(identities.len());

        for identity in identities {
            let lock = {
                let mut locks = self.locks.lock();
                Arc::clone(locks.entry(identity.clone()).or_default())
            };
            let guard = lock.lock_owned().await;
            debug!(identity = %identity, "Acquired destination lock");
            held.push((identity, guard));
        }

        IdentityGuard {
            table: Arc::clone(self),
            held,
        }
    }

    /// Number of identities with a live lock entry
    pub fn tracked(&self) -> usize {
        self.locks.lock().len()
    }
}

/// Held destination locks; released (and pruned) on drop
pub struct IdentityGuard {
    table: Arc<IdentityLocks>,
    held: Vec<(MediaIdentity, OwnedMutexGuard<()>)>,
}

impl IdentityGuard {
    pub fn identities(&self) -> impl Iterator<Item = &MediaIdentity> {
        self.held.iter().map(|(identity, _)| identity)
    }
}

impl Drop for IdentityGuard {
    fn drop(&mut self) {
        for (identity, guard) in self.held.drain(..) {
            drop(guard);
            let mut locks = self.table.locks.lock();
            // Only the table still references the lock: nobody is waiting
            if locks
                .get(&identity)
                .is_some_and(|lock| Arc::strong_count(lock) == 1)
            {
                locks.remove(&identity);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn identity(id: &str, episode: u32) -> MediaIdentity {
        MediaIdentity {
            catalog_id: id.to_string(),
            season: Some(1),
            episode: Some(episode),
            edition: None,
        }
    }

    // =========================================================================
    // WorkQueue
    // =========================================================================

    #[tokio::test]
    async fn test_enqueue_is_idempotent_while_pending() {
        let queue = WorkQueue::new();
        assert_eq!(queue.enqueue("/in/a"), EnqueueOutcome::Queued);
        assert_eq!(queue.enqueue("/in/a"), EnqueueOutcome::AlreadyQueued);
        assert_eq!(queue.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = WorkQueue::new();
        let cancel = CancellationToken::new();
        queue.enqueue("/in/a");
        queue.enqueue("/in/b");
        queue.enqueue("/in/c");

        let a = queue.dequeue(&cancel).await.unwrap();
        let b = queue.dequeue(&cancel).await.unwrap();
        let c = queue.dequeue(&cancel).await.unwrap();
        assert_eq!(a.path(), Path::new("/in/a"));
        assert_eq!(b.path(), Path::new("/in/b"));
        assert_eq!(c.path(), Path::new("/in/c"));
    }

    #[tokio::test]
    async fn test_in_flight_suppresses_duplicates() {
        let queue = WorkQueue::new();
        let cancel = CancellationToken::new();
        queue.enqueue("/in/a");

        let lease = queue.dequeue(&cancel).await.unwrap();
        assert!(queue.is_active(Path::new("/in/a")));
        assert_eq!(queue.enqueue("/in/a"), EnqueueOutcome::InFlight);
        assert_eq!(queue.pending_len(), 0);

        drop(lease);
        assert!(!queue.is_active(Path::new("/in/a")));
        assert_eq!(queue.enqueue("/in/a"), EnqueueOutcome::Queued);
    }

    #[tokio::test]
    async fn test_rearm_requeues_after_release() {
        let queue = WorkQueue::new();
        let cancel = CancellationToken::new();
        queue.enqueue("/in/a");

        let lease = queue.dequeue(&cancel).await.unwrap();
        assert_eq!(queue.rearm("/in/a"), EnqueueOutcome::Rearmed);
        assert_eq!(queue.pending_len(), 0);

        drop(lease);
        assert_eq!(queue.pending_len(), 1);
        let again = queue.dequeue(&cancel).await.unwrap();
        assert_eq!(again.path(), Path::new("/in/a"));
    }

    #[tokio::test]
    async fn test_rearm_of_idle_path_enqueues() {
        let queue = WorkQueue::new();
        assert_eq!(queue.rearm("/in/a"), EnqueueOutcome::Queued);
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_enqueue() {
        let queue = WorkQueue::new();
        let cancel = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.dequeue(&cancel).await.map(|l| l.path().to_path_buf()) })
        };

        tokio::task::yield_now().await;
        queue.enqueue("/in/late");

        let path = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(path, Some(PathBuf::from("/in/late")));
    }

    #[tokio::test]
    async fn test_dequeue_returns_none_on_cancel() {
        let queue = WorkQueue::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(queue.dequeue(&cancel).await.is_none());
    }

    #[tokio::test]
    async fn test_close_rejects_and_wakes() {
        let queue = WorkQueue::new();
        let cancel = CancellationToken::new();
        queue.close();
        assert_eq!(queue.enqueue("/in/a"), EnqueueOutcome::Closed);
        assert!(queue.dequeue(&cancel).await.is_none());
    }

    // =========================================================================
    // IdentityLocks
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_same_identity_is_serialized() {
        let locks = IdentityLocks::new();
        let first = locks
            .acquire_all(BTreeSet::from([identity("1", 1)]))
            .await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire_all(BTreeSet::from([identity("1", 1)])).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_distinct_identities_do_not_block() {
        let locks = IdentityLocks::new();
        let _a = locks.acquire_all(BTreeSet::from([identity("1", 1)])).await;
        let b = tokio::time::timeout(
            Duration::from_secs(1),
            locks.acquire_all(BTreeSet::from([identity("1", 2)])),
        )
        .await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_lock_table_is_pruned() {
        let locks = IdentityLocks::new();
        let guard = locks
            .acquire_all(BTreeSet::from([identity("1", 1), identity("1", 2)]))
            .await;
        assert_eq!(locks.tracked(), 2);
        assert_eq!(guard.identities().count(), 2);
        drop(guard);
        assert_eq!(locks.tracked(), 0);
    }
}
