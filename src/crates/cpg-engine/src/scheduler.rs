//! Work scheduling - queue, per-instance locks, timers, cancellation
//!
//! Workers cooperate over one bounded queue; each [`WorkItem`] targets one
//! instance. Per-instance exclusivity comes from an `instance_id`-keyed
//! async mutex map: whoever steps an instance holds its lock, and all state
//! changes commit before the lock is released. Timers are coalesced to at
//! most one scheduled wake per instance. A full queue blocks enqueue up to
//! the configured deadline, then surfaces backpressure to the caller.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Why a work item was enqueued
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkReason {
    /// Instance just started
    Start,
    /// Explicit step request
    Step,
    /// An event was delivered
    Event {
        /// Delivered event type
        event_type: String,
    },
    /// A retry or SLA timer fired
    Timer,
    /// Instance resumed
    Resume,
}

/// One unit of work targeting one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// Target instance
    pub instance_id: String,
    /// Why the work exists
    pub reason: WorkReason,
}

/// Queue full at the enqueue deadline
#[derive(Debug, thiserror::Error)]
#[error("work queue full")]
pub struct QueueFull;

struct TimerEntry {
    deadline: Instant,
    handle: JoinHandle<()>,
}

/// The engine scheduler
pub struct Scheduler {
    tx: mpsc::Sender<WorkItem>,
    rx: Mutex<Option<mpsc::Receiver<WorkItem>>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    timers: Arc<DashMap<String, TimerEntry>>,
    cancels: DashMap<String, watch::Sender<bool>>,
    enqueue_deadline: Duration,
    background: bool,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a scheduler; `background = false` turns enqueue into a no-op
    /// for manually stepped deployments
    pub fn new(queue_capacity: usize, enqueue_deadline: Duration, background: bool) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            locks: DashMap::new(),
            timers: Arc::new(DashMap::new()),
            cancels: DashMap::new(),
            enqueue_deadline,
            background,
            workers: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// The exclusive lock for an instance
    pub fn lock_for(&self, instance_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Enqueue a work item, blocking up to the enqueue deadline
    pub async fn enqueue(&self, item: WorkItem) -> Result<(), QueueFull> {
        if !self.background {
            return Ok(());
        }
        match tokio::time::timeout(self.enqueue_deadline, self.tx.send(item)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) | Err(_) => Err(QueueFull),
        }
    }

    /// Spawn the worker pool over the shared queue
    ///
    /// Workers exit when the queue closes. `process` runs outside any lock;
    /// it is expected to take the instance lock itself.
    pub async fn start_workers<F, Fut>(&self, count: usize, process: F)
    where
        F: Fn(WorkItem) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if count == 0 {
            return;
        }
        let Some(rx) = self.rx.lock().await.take() else {
            return;
        };
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = self.workers.lock();
        for worker in 0..count {
            let rx = rx.clone();
            let process = process.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let item = { rx.lock().await.recv().await };
                    match item {
                        Some(item) => {
                            debug!(worker, instance = %item.instance_id, reason = ?item.reason, "processing work item");
                            process(item).await;
                        }
                        None => break,
                    }
                }
            }));
        }
    }

    /// Schedule a wake for an instance, coalescing with any earlier one
    ///
    /// At most one timer exists per instance; a later deadline never
    /// replaces an earlier one.
    pub fn schedule_wake(&self, instance_id: &str, delay: Duration) {
        if !self.background {
            return;
        }
        let deadline = Instant::now() + delay;

        if let Some(existing) = self.timers.get(instance_id) {
            if existing.deadline <= deadline {
                return;
            }
        }
        if let Some((_, old)) = self.timers.remove(instance_id) {
            old.handle.abort();
        }

        let tx = self.tx.clone();
        let timers = self.timers.clone();
        let id = instance_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            timers.remove(&id);
            if tx
                .send(WorkItem {
                    instance_id: id.clone(),
                    reason: WorkReason::Timer,
                })
                .await
                .is_err()
            {
                warn!(instance = %id, "timer fired after queue closed");
            }
        });
        self.timers.insert(
            instance_id.to_string(),
            TimerEntry { deadline, handle },
        );
    }

    /// Cancellation receiver handed to action handlers
    pub fn cancellation(&self, instance_id: &str) -> watch::Receiver<bool> {
        self.cancels
            .entry(instance_id.to_string())
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    /// Signal cancellation: in-flight handlers observe it, the pending
    /// timer is dropped
    pub fn signal_cancel(&self, instance_id: &str) {
        if let Some(sender) = self.cancels.get(instance_id) {
            let _ = sender.send(true);
        }
        if let Some((_, timer)) = self.timers.remove(instance_id) {
            timer.handle.abort();
        }
    }

    /// Drop per-instance bookkeeping after a terminal status
    pub fn forget(&self, instance_id: &str) {
        if let Some((_, timer)) = self.timers.remove(instance_id) {
            timer.handle.abort();
        }
        self.cancels.remove(instance_id);
    }

    /// Close the queue; workers drain and exit
    pub fn shutdown(&self) {
        let mut workers = self.workers.lock();
        for worker in workers.drain(..) {
            worker.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
        for entry in self.timers.iter() {
            entry.value().handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn item(id: &str) -> WorkItem {
        WorkItem {
            instance_id: id.to_string(),
            reason: WorkReason::Step,
        }
    }

    #[tokio::test]
    async fn full_queue_reports_backpressure_at_the_deadline() {
        let scheduler = Scheduler::new(1, Duration::from_millis(5), true);

        scheduler.enqueue(item("a")).await.unwrap();
        let err = scheduler.enqueue(item("b")).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn foreground_mode_ignores_enqueue() {
        let scheduler = Scheduler::new(1, Duration::from_millis(5), false);
        // capacity 1, but every enqueue is a no-op
        for _ in 0..10 {
            scheduler.enqueue(item("a")).await.unwrap();
        }
    }

    #[tokio::test]
    async fn workers_drain_the_queue() {
        let scheduler = Arc::new(Scheduler::new(16, Duration::from_millis(50), true));
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = seen.clone();
        scheduler
            .start_workers(2, move |_item| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;

        for i in 0..8 {
            scheduler.enqueue(item(&format!("inst-{i}"))).await.unwrap();
        }
        tokio::time::timeout(Duration::from_secs(1), async {
            while seen.load(Ordering::SeqCst) < 8 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn per_instance_lock_is_shared() {
        let scheduler = Scheduler::new(4, Duration::from_millis(5), true);
        let lock_a = scheduler.lock_for("a");
        let lock_a_again = scheduler.lock_for("a");
        let lock_b = scheduler.lock_for("b");

        assert!(Arc::ptr_eq(&lock_a, &lock_a_again));
        assert!(!Arc::ptr_eq(&lock_a, &lock_b));

        let _held = lock_a.lock().await;
        assert!(lock_a_again.try_lock().is_err());
        assert!(lock_b.try_lock().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn wakes_are_coalesced_to_the_earliest() {
        let scheduler = Scheduler::new(4, Duration::from_millis(5), true);
        scheduler.schedule_wake("a", Duration::from_secs(30));
        // earlier wake replaces the later one; later wake is ignored
        scheduler.schedule_wake("a", Duration::from_secs(5));
        scheduler.schedule_wake("a", Duration::from_secs(60));
        assert_eq!(scheduler.timers.len(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(scheduler.timers.is_empty());
    }

    #[tokio::test]
    async fn cancellation_signal_reaches_subscribers() {
        let scheduler = Scheduler::new(4, Duration::from_millis(5), true);
        let mut rx = scheduler.cancellation("a");
        assert!(!*rx.borrow());

        scheduler.signal_cancel("a");
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }
}
