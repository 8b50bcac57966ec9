//! Background update/reintegration scheduler (C8 — spec §4.8).
//!
//! Two FIFO queues — fast and slow, matching the link speed classified
//! by the connection manager — feed a bounded pool of worker tasks.
//! Generalises the teacher's per-connection task-spawning idiom
//! (`src/lib.rs` spins up one `ReadTask`/`VfsTask`/`StreamWriter` per
//! accepted socket) into a shared pool that grows/shrinks between
//! `min_spare`/`max_spare`/`max_total`, plus a single-slot "slow
//! updater" role so only one task ever drains the slow queue at a time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;

use crate::model::Fh;
use crate::reconcile::IfhFlags;

/// How long a demoted slow-busy item waits before being retried
/// (spec §4.8, `original_source/zfsd/update.h`'s `ZFS_SLOW_BUSY_DELAY`).
pub const ZFS_SLOW_BUSY_DELAY: std::time::Duration = std::time::Duration::from_secs(5);

struct Queue {
    items: SegQueue<Fh>,
    notify: Notify,
    len: AtomicUsize,
}

impl Queue {
    fn new() -> Self {
        Queue { items: SegQueue::new(), notify: Notify::new(), len: AtomicUsize::new(0) }
    }

    fn push(&self, fh: Fh) {
        self.items.push(fh);
        self.len.fetch_add(1, Ordering::AcqRel);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Fh> {
        let item = self.items.pop();
        if item.is_some() {
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
        item
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }
}

/// Thread-pool band: never fewer than `min_spare` idle workers, never
/// more than `max_spare` idle, never more than `max_total` total
/// (spec §4.8 "regulator").
pub struct PoolBand {
    pub min_spare: usize,
    pub max_spare: usize,
    pub max_total: usize,
}

/// The scheduler: owns the fast/slow queues, a set of already-enqueued
/// handles (for idempotent scheduling), and the worker pool.
pub struct Scheduler {
    fast: Queue,
    slow: Queue,
    enqueued: dashmap::DashSet<Fh>,
    /// Only one task may hold this at a time — the "slow updater" role
    /// (spec §4.8): draining the slow queue competes with nothing else
    /// for bandwidth on a link already classified saturated.
    slow_updater: Arc<Semaphore>,
    band: PoolBand,
    active_workers: AtomicU32,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(band: PoolBand) -> Self {
        Scheduler {
            fast: Queue::new(),
            slow: Queue::new(),
            enqueued: dashmap::DashSet::new(),
            slow_updater: Arc::new(Semaphore::new(1)),
            band,
            active_workers: AtomicU32::new(0),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Enqueue `fh` for update-or-reintegration unless it's already
    /// pending, keeping the flags so a worker can decide which pass to
    /// run without re-reading metadata first (spec §4.8 idempotence via
    /// `IFH_ENQUEUED`).
    pub fn schedule(&self, fh: Fh, flags: u32, fast_link: bool) -> bool {
        if flags & IfhFlags::ENQUEUED != 0 || !self.enqueued.insert(fh) {
            return false;
        }
        if fast_link {
            self.fast.push(fh);
        } else {
            self.slow.push(fh);
        }
        true
    }

    /// Pop the next item to work on, preferring the fast queue (spec
    /// §4.8: fast-link work always drains ahead of slow-link work since
    /// it completes faster and frees scheduler slots sooner).
    pub fn pop_next(&self) -> Option<Fh> {
        let item = self.fast.pop().or_else(|| self.slow.pop());
        if let Some(fh) = item {
            self.enqueued.remove(&fh);
        }
        item
    }

    pub fn fast_len(&self) -> usize {
        self.fast.len()
    }

    pub fn slow_len(&self) -> usize {
        self.slow.len()
    }

    /// Acquire the single slow-updater slot; callers should hold this for
    /// the duration of one slow-queue drain pass. Retries every
    /// [`ZFS_SLOW_BUSY_DELAY`] rather than queuing on the semaphore's own
    /// FIFO, so a demoted caller periodically reconsiders the role instead
    /// of waiting in line behind whoever asked first (spec §4.8).
    pub async fn acquire_slow_updater(&self) -> tokio::sync::OwnedSemaphorePermit {
        loop {
            match self.slow_updater.clone().try_acquire_owned() {
                Ok(permit) => return permit,
                Err(_) => tokio::time::sleep(ZFS_SLOW_BUSY_DELAY).await,
            }
        }
    }

    /// Spawn up to `min_spare` workers immediately; additional workers up
    /// to `max_total` spin up lazily as queue depth demands (spec §4.8).
    pub async fn spawn_workers<F, Fut>(self: &Arc<Self>, make_worker: F)
    where
        F: Fn(Arc<Scheduler>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let make_worker = Arc::new(make_worker);
        let mut handles = self.handles.lock().await;
        for _ in 0..self.band.min_spare {
            let scheduler = self.clone();
            let make_worker = make_worker.clone();
            self.active_workers.fetch_add(1, Ordering::AcqRel);
            handles.push(tokio::spawn(async move { make_worker(scheduler).await }));
        }
    }

    /// Whether another worker may be started without exceeding
    /// `max_total` (spec §4.8 regulator upper bound).
    pub fn can_grow(&self) -> bool {
        (self.active_workers.load(Ordering::Acquire) as usize) < self.band.max_total
    }

    pub fn active_workers(&self) -> u32 {
        self.active_workers.load(Ordering::Acquire)
    }
}

impl PoolBand {
    pub fn new(min_spare: usize, max_spare: usize, max_total: usize) -> Self {
        debug_assert!(min_spare <= max_spare && max_spare <= max_total);
        PoolBand { min_spare, max_spare, max_total }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fh(ino: u32) -> Fh {
        Fh { sid: 0, vid: 0, dev: 1, ino, gen: 0 }
    }

    #[test]
    fn schedule_is_idempotent_while_enqueued() {
        let sched = Scheduler::new(PoolBand::new(1, 2, 4));
        assert!(sched.schedule(fh(1), 0, true));
        assert!(!sched.schedule(fh(1), 0, true));
        assert_eq!(sched.fast_len(), 1);
    }

    #[test]
    fn fast_queue_drains_before_slow() {
        let sched = Scheduler::new(PoolBand::new(1, 2, 4));
        sched.schedule(fh(1), 0, false);
        sched.schedule(fh(2), 0, true);
        assert_eq!(sched.pop_next(), Some(fh(2)));
        assert_eq!(sched.pop_next(), Some(fh(1)));
    }

    #[test]
    fn popping_allows_rescheduling() {
        let sched = Scheduler::new(PoolBand::new(1, 2, 4));
        sched.schedule(fh(1), 0, true);
        sched.pop_next();
        assert!(sched.schedule(fh(1), 0, true));
    }

    #[tokio::test]
    async fn slow_updater_slot_is_exclusive() {
        let sched = Arc::new(Scheduler::new(PoolBand::new(1, 2, 4)));
        let _permit = sched.acquire_slow_updater().await;
        let second = tokio::time::timeout(std::time::Duration::from_millis(20), sched.acquire_slow_updater()).await;
        assert!(second.is_err());
    }
}
