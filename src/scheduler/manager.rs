//! Operation scheduler: Immediate, Pending and Named-Queue disciplines on top
//! of a shared worker pool.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::engine::EngineWork;
use crate::error::OperationError;
use crate::scheduler::operation::{Operation, OperationSender};
use crate::scheduler::pool::WorkerPool;
use crate::util::{lock, panic_message};

#[derive(Default)]
struct OperationLists {
    /// Submitted but not yet seen by a sweep.
    to_be_pending: Vec<Arc<Operation>>,
    /// Waiting for a slot under the concurrency cap.
    pending: VecDeque<Arc<Operation>>,
    /// Admitted pending operations.
    executing: Vec<Arc<Operation>>,
    /// Immediate operations queued or running on a worker.
    immediate: Vec<Arc<Operation>>,
    queues: HashMap<String, VecDeque<Arc<Operation>>>,
}

impl OperationLists {
    /// Whether an operation from `sender` is already immediate, pending or executing.
    fn sender_active(&self, sender: &OperationSender) -> bool {
        self.pending
            .iter()
            .chain(self.executing.iter())
            .chain(self.immediate.iter())
            .any(|op| op.matches_sender(sender) && op.is_active())
    }

    fn workload(&self) -> usize {
        self.to_be_pending.len()
            + self.pending.len()
            + self.executing.len()
            + self.immediate.len()
            + self.queues.values().map(VecDeque::len).sum::<usize>()
    }
}

struct SchedulerShared {
    config: SchedulerConfig,
    pool: WorkerPool,
    lists: Mutex<OperationLists>,
}

impl SchedulerShared {
    fn lists(&self) -> MutexGuard<'_, OperationLists> {
        lock(&self.lists)
    }
}

/// Point-in-time counts, mostly for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    pub to_be_pending: usize,
    pub pending: usize,
    pub executing: usize,
    pub immediate: usize,
    pub queued: usize,
}

/// Cloneable handle to the operation scheduler.
#[derive(Clone)]
pub struct OperationScheduler {
    shared: Arc<SchedulerShared>,
}

impl OperationScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let pool = WorkerPool::new(config.max_workers);
        Self {
            shared: Arc::new(SchedulerShared {
                config,
                pool,
                lists: Mutex::new(OperationLists::default()),
            }),
        }
    }

    /// Grow the worker pool. Shrinking is ignored.
    pub fn configure_workers(&self, workers: usize) -> usize {
        self.shared.pool.grow(workers)
    }

    pub fn worker_count(&self) -> usize {
        self.shared.pool.size()
    }

    // ── Immediate ──────────────────────────────────────────────────────

    /// Run `action` as soon as a worker is free.
    ///
    /// Unless `even_if_running` is set, the submission is dropped (returning
    /// `None`) when another operation from the same sender is already active.
    pub fn submit_immediate<F, Fut>(
        &self,
        sender: Option<OperationSender>,
        even_if_running: bool,
        action: F,
    ) -> Option<Arc<Operation>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.run_immediate(Operation::new(sender, action), even_if_running)
    }

    /// Like [`submit_immediate`](Self::submit_immediate), sleeping `delay` before the action.
    pub fn submit_immediate_delayed<F, Fut>(
        &self,
        sender: Option<OperationSender>,
        delay: Duration,
        even_if_running: bool,
        action: F,
    ) -> Option<Arc<Operation>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.run_immediate(Operation::delayed(sender, delay, action), even_if_running)
    }

    fn run_immediate(&self, op: Operation, even_if_running: bool) -> Option<Arc<Operation>> {
        let op = Arc::new(op);
        {
            let mut lists = self.shared.lists();
            if let Some(sender) = op.sender().filter(|_| !even_if_running) {
                if lists.sender_active(sender) {
                    tracing::debug!(sender = %sender, "Immediate operation already active, skipping");
                    op.skip();
                    return None;
                }
            }
            lists.immediate.push(Arc::clone(&op));
        }

        let shared = Arc::clone(&self.shared);
        let job_op = Arc::clone(&op);
        let job = async move {
            let _ = job_op.execute().await;
            let id = job_op.id();
            shared.lists().immediate.retain(|o| o.id() != id);
        };

        if !self.shared.pool.dispatch(job.boxed()) {
            let id = op.id();
            self.shared.lists().immediate.retain(|o| o.id() != id);
            op.skip();
            return None;
        }
        Some(op)
    }

    // ── Pending ────────────────────────────────────────────────────────

    /// Queue `action` behind the concurrency cap. Admission happens on the
    /// next sweep.
    pub fn submit_pending<F, Fut>(&self, sender: Option<OperationSender>, action: F) -> Arc<Operation>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.push_pending(Operation::new(sender, action))
    }

    /// Queue a delayed retry. Delayed submissions are exempt from sender dedup.
    pub fn submit_pending_delayed<F, Fut>(
        &self,
        sender: Option<OperationSender>,
        delay: Duration,
        action: F,
    ) -> Arc<Operation>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.push_pending(Operation::delayed(sender, delay, action))
    }

    fn push_pending(&self, op: Operation) -> Arc<Operation> {
        let op = Arc::new(op);
        self.shared.lists().to_be_pending.push(Arc::clone(&op));
        op
    }

    // ── Named queues ───────────────────────────────────────────────────

    /// Append `action` to the serial queue `queue`.
    pub fn enqueue<F, Fut>(
        &self,
        queue: impl Into<String>,
        sender: Option<OperationSender>,
        action: F,
    ) -> Arc<Operation>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.push_queued(queue.into(), Operation::new(sender, action))
    }

    /// Append `action` to `queue`; it will not be admitted before `delay` elapses.
    pub fn enqueue_delayed<F, Fut>(
        &self,
        queue: impl Into<String>,
        sender: Option<OperationSender>,
        delay: Duration,
        action: F,
    ) -> Arc<Operation>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.push_queued(queue.into(), Operation::not_before(sender, delay, action))
    }

    fn push_queued(&self, queue: String, op: Operation) -> Arc<Operation> {
        let op = Arc::new(op);
        self.shared
            .lists()
            .queues
            .entry(queue)
            .or_default()
            .push_back(Arc::clone(&op));
        op
    }

    // ── Cancellation ───────────────────────────────────────────────────

    /// Cancel every not-yet-started pending operation from `sender`.
    /// Returns how many were cancelled.
    pub fn cancel_if_has_pending_operation(&self, sender: &OperationSender) -> usize {
        let lists = self.shared.lists();
        let mut cancelled = 0;
        for op in lists.to_be_pending.iter().chain(lists.pending.iter()) {
            if op.matches_sender(sender) && !op.is_cancelled() {
                op.cancel();
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::debug!(sender = %sender, cancelled, "Cancelled pending operations");
        }
        cancelled
    }

    // ── Sweep ──────────────────────────────────────────────────────────

    /// Admit pending and queued operations that may run now.
    ///
    /// Returns the remaining workload. Bookkeeping failures are logged and the
    /// next sweep proceeds normally.
    pub fn execute_if_pending_and_not_busy(&self) -> usize {
        let now = Instant::now();
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.sweep_pending(now);
            self.sweep_queues(now);
            self.shared.lists().workload()
        }));

        match outcome {
            Ok(remaining) => remaining,
            Err(payload) => {
                tracing::error!(
                    error = %panic_message(payload.as_ref()),
                    "Operation sweep failed"
                );
                0
            }
        }
    }

    fn sweep_pending(&self, now: Instant) {
        let mut admitted = Vec::new();
        {
            let mut guard = self.shared.lists();
            let lists = &mut *guard;

            for op in std::mem::take(&mut lists.to_be_pending) {
                if op.is_cancelled() {
                    op.skip();
                    continue;
                }
                let duplicate = !op.has_delay()
                    && op.sender().is_some_and(|sender| lists.sender_active(sender));
                if duplicate {
                    tracing::debug!(sender = ?op.sender(), "Duplicate pending operation dropped");
                    op.skip();
                    continue;
                }
                lists.pending.push_back(op);
            }

            lists.pending.retain(|op| {
                if op.is_cancelled() {
                    op.skip();
                    false
                } else {
                    true
                }
            });

            lists.executing.retain(|op| {
                if op.is_timed_out(now) && !op.status().is_terminal() {
                    let err = OperationError::Timeout {
                        id: op.id(),
                        queue: "pending".to_string(),
                        timeout: self.shared.config.pending_timeout,
                    };
                    tracing::warn!(error = %err, "Evicting executing operation");
                    op.dispose();
                    return false;
                }
                true
            });

            lists.executing.retain(|op| !op.status().is_terminal());

            while lists.executing.len() < self.shared.config.max_concurrent_operations {
                let Some(op) = lists.pending.pop_front() else {
                    break;
                };
                if op.is_cancelled() {
                    op.skip();
                    continue;
                }
                op.set_timeout(now + self.shared.config.pending_timeout);
                lists.executing.push(Arc::clone(&op));
                admitted.push(op);
            }
        }

        for op in admitted {
            self.dispatch(op);
        }
    }

    fn sweep_queues(&self, now: Instant) {
        let mut admitted = Vec::new();
        {
            let mut lists = self.shared.lists();
            let timeout = self.shared.config.queue_timeout;

            for (name, queue) in lists.queues.iter_mut() {
                while let Some(head) = queue.front() {
                    let status = head.status();
                    if status.is_terminal() {
                        if let Some(done) = queue.pop_front() {
                            done.dispose();
                        }
                        continue;
                    }
                    if head.running_longer_than(timeout, now) {
                        let err = OperationError::Timeout {
                            id: head.id(),
                            queue: name.clone(),
                            timeout,
                        };
                        tracing::warn!(queue = %name, error = %err, "Evicting queue head");
                        if let Some(stuck) = queue.pop_front() {
                            stuck.dispose();
                        }
                        continue;
                    }
                    if head.is_cancelled() && !head.is_claimed() {
                        if let Some(cancelled) = queue.pop_front() {
                            cancelled.skip();
                        }
                        continue;
                    }
                    // Blocked: a claimed head is waiting for a worker or running.
                    if !head.is_claimed() && head.is_due(now) && head.try_claim() {
                        admitted.push(Arc::clone(head));
                    }
                    break;
                }
            }

            lists.queues.retain(|_, queue| !queue.is_empty());
        }

        for op in admitted {
            self.dispatch_claimed(op);
        }
    }

    fn dispatch(&self, op: Arc<Operation>) {
        if op.try_claim() {
            self.dispatch_claimed(op);
        }
    }

    fn dispatch_claimed(&self, op: Arc<Operation>) {
        let job_op = Arc::clone(&op);
        let job = async move {
            let _ = job_op.execute().await;
        };
        if !self.shared.pool.dispatch(job.boxed()) {
            op.skip();
        }
    }

    /// Current list sizes.
    pub fn snapshot(&self) -> SchedulerSnapshot {
        let lists = self.shared.lists();
        SchedulerSnapshot {
            to_be_pending: lists.to_be_pending.len(),
            pending: lists.pending.len(),
            executing: lists.executing.len(),
            immediate: lists.immediate.len(),
            queued: lists.queues.values().map(VecDeque::len).sum(),
        }
    }

    /// Stop every worker. Outstanding operations never run.
    pub fn shutdown(&self) {
        self.shared.pool.shutdown();
        let mut guard = self.shared.lists();
        let lists = &mut *guard;
        let queued: Vec<_> = lists.queues.drain().flat_map(|(_, q)| q).collect();
        for op in lists
            .to_be_pending
            .drain(..)
            .chain(lists.pending.drain(..))
            .chain(queued)
        {
            op.skip();
        }
        tracing::info!("Operation scheduler shut down");
    }
}

#[async_trait]
impl EngineWork for OperationScheduler {
    async fn tick(&self, _cancel: &CancellationToken) -> anyhow::Result<usize> {
        Ok(self.execute_if_pending_and_not_busy())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::{Notify, mpsc};

    use super::*;
    use crate::scheduler::operation::OperationStatus;

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            max_workers: 2,
            max_concurrent_operations: 2,
            pending_timeout: Duration::from_secs(30),
            queue_timeout: Duration::from_secs(15),
        }
    }

    async fn wait_finished(op: &Operation) -> OperationStatus {
        tokio::time::timeout(Duration::from_secs(2), op.finished())
            .await
            .expect("operation finished")
    }

    #[tokio::test]
    async fn immediate_runs_action() {
        let scheduler = OperationScheduler::new(config());
        let op = scheduler
            .submit_immediate(None, false, || async { Ok(()) })
            .expect("accepted");
        assert_eq!(wait_finished(&op).await, OperationStatus::Completed);
    }

    #[tokio::test]
    async fn immediate_duplicate_sender_is_skipped() {
        let scheduler = OperationScheduler::new(config());
        let release = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let (r, c) = (release.clone(), calls.clone());
        let first = scheduler
            .submit_immediate(Some("feed".into()), false, move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                r.notified().await;
                Ok(())
            })
            .expect("first accepted");

        let c = calls.clone();
        let second = scheduler.submit_immediate(Some("feed".into()), false, move || async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(second.is_none());

        // A different sender is unaffected.
        let other = scheduler.submit_immediate(Some("other".into()), false, || async { Ok(()) });
        assert!(other.is_some());

        tokio::time::sleep(Duration::from_millis(20)).await;
        release.notify_waiters();
        wait_finished(&first).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn immediate_even_if_running_is_not_deduplicated() {
        let scheduler = OperationScheduler::new(config());
        let a = scheduler.submit_immediate(Some("s".into()), false, || async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        });
        let b = scheduler.submit_immediate(Some("s".into()), true, || async { Ok(()) });
        assert!(a.is_some());
        assert!(b.is_some());
    }

    #[tokio::test]
    async fn pending_respects_concurrency_cap() {
        let scheduler = OperationScheduler::new(config());
        let release = Arc::new(Notify::new());
        let running = Arc::new(AtomicUsize::new(0));

        let ops: Vec<_> = (0..3)
            .map(|_| {
                let (r, n) = (release.clone(), running.clone());
                scheduler.submit_pending(None, move || async move {
                    n.fetch_add(1, Ordering::SeqCst);
                    r.notified().await;
                    Ok(())
                })
            })
            .collect();

        assert_eq!(scheduler.execute_if_pending_and_not_busy(), 3);
        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot.executing, 2);
        assert_eq!(snapshot.pending, 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(running.load(Ordering::SeqCst), 2);

        release.notify_waiters();
        wait_finished(&ops[0]).await;
        wait_finished(&ops[1]).await;

        scheduler.execute_if_pending_and_not_busy();
        assert_eq!(scheduler.snapshot().executing, 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        release.notify_waiters();
        assert_eq!(wait_finished(&ops[2]).await, OperationStatus::Completed);
    }

    #[tokio::test]
    async fn pending_duplicates_dropped_but_delayed_retries_kept() {
        let scheduler = OperationScheduler::new(config());
        let release = Arc::new(Notify::new());
        let r = release.clone();
        let first = scheduler.submit_pending(Some("sync".into()), move || async move {
            r.notified().await;
            Ok(())
        });
        scheduler.execute_if_pending_and_not_busy();
        assert!(first.is_active());

        let dup = scheduler.submit_pending(Some("sync".into()), || async { Ok(()) });
        let retry = scheduler.submit_pending_delayed(
            Some("sync".into()),
            Duration::from_millis(1),
            || async { Ok(()) },
        );
        scheduler.execute_if_pending_and_not_busy();

        assert_eq!(dup.status(), OperationStatus::Completed);
        assert!(!dup.is_claimed());
        assert!(retry.is_claimed());
        assert_eq!(wait_finished(&retry).await, OperationStatus::Completed);

        tokio::time::sleep(Duration::from_millis(10)).await;
        release.notify_waiters();
        assert_eq!(wait_finished(&first).await, OperationStatus::Completed);
    }

    #[tokio::test]
    async fn cancelled_pending_never_runs() {
        let scheduler = OperationScheduler::new(config());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let op = scheduler.submit_pending(Some("img".into()), move || async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(scheduler.cancel_if_has_pending_operation(&"img".into()), 1);
        scheduler.execute_if_pending_and_not_busy();
        assert_eq!(op.status(), OperationStatus::Completed);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failing_operation_does_not_stop_others() {
        let scheduler = OperationScheduler::new(config());
        let bad = scheduler.submit_pending(None, || async { anyhow::bail!("broken") });
        let good = scheduler.submit_pending(None, || async { Ok(()) });
        scheduler.execute_if_pending_and_not_busy();

        assert_eq!(wait_finished(&bad).await, OperationStatus::Faulted);
        assert_eq!(wait_finished(&good).await, OperationStatus::Completed);
    }

    #[tokio::test]
    async fn named_queue_runs_serially_in_order() {
        let scheduler = OperationScheduler::new(config());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let release = Arc::new(Notify::new());

        let ops: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|name| {
                let (tx, r) = (tx.clone(), release.clone());
                scheduler.enqueue("uploads", None, move || async move {
                    let _ = tx.send(name);
                    r.notified().await;
                    Ok(())
                })
            })
            .collect();

        let mut order = Vec::new();
        for expected in 0..3 {
            scheduler.execute_if_pending_and_not_busy();
            let name = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            order.push(name);

            // Later heads stay waiting while this one runs.
            scheduler.execute_if_pending_and_not_busy();
            for later in &ops[expected + 1..] {
                assert_eq!(later.status(), OperationStatus::Waiting);
            }

            release.notify_waiters();
            wait_finished(&ops[expected]).await;
        }
        assert_eq!(order, vec!["a", "b", "c"]);

        scheduler.execute_if_pending_and_not_busy();
        assert_eq!(scheduler.snapshot().queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_queue_head_is_evicted_after_timeout() {
        let scheduler = OperationScheduler::new(config());
        let stuck = scheduler.enqueue("q", None, || async {
            futures::future::pending::<()>().await;
            Ok(())
        });
        let next = scheduler.enqueue("q", None, || async { Ok(()) });

        scheduler.execute_if_pending_and_not_busy();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(stuck.status(), OperationStatus::Running);

        tokio::time::sleep(Duration::from_secs(16)).await;
        scheduler.execute_if_pending_and_not_busy();
        assert_eq!(wait_finished(&next).await, OperationStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_pending_operation_is_evicted_after_timeout() {
        let scheduler = OperationScheduler::new(SchedulerConfig {
            max_concurrent_operations: 1,
            ..config()
        });
        let stuck = scheduler.submit_pending(None, || async {
            futures::future::pending::<()>().await;
            Ok(())
        });
        let next = scheduler.submit_pending(None, || async { Ok(()) });

        scheduler.execute_if_pending_and_not_busy();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(stuck.status(), OperationStatus::Running);

        tokio::time::advance(Duration::from_secs(29)).await;
        scheduler.execute_if_pending_and_not_busy();
        assert_eq!(next.status(), OperationStatus::Waiting);

        tokio::time::advance(Duration::from_secs(2)).await;
        scheduler.execute_if_pending_and_not_busy();
        assert_eq!(wait_finished(&next).await, OperationStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_queue_operation_waits_until_due() {
        let scheduler = OperationScheduler::new(config());
        let op = scheduler.enqueue_delayed("q", None, Duration::from_secs(1), || async { Ok(()) });

        scheduler.execute_if_pending_and_not_busy();
        assert!(!op.is_claimed());

        tokio::time::sleep(Duration::from_secs(2)).await;
        scheduler.execute_if_pending_and_not_busy();
        assert_eq!(wait_finished(&op).await, OperationStatus::Completed);
    }

    #[tokio::test]
    async fn workload_reported_to_engine() {
        let scheduler = OperationScheduler::new(config());
        let token = CancellationToken::new();
        assert_eq!(scheduler.tick(&token).await.unwrap(), 0);

        scheduler.enqueue("q", None, || async { Ok(()) });
        assert!(scheduler.tick(&token).await.unwrap() >= 1);
    }

    #[test]
    fn configure_workers_is_grow_only() {
        let scheduler = OperationScheduler::new(config());
        assert_eq!(scheduler.configure_workers(5), 5);
        assert_eq!(scheduler.configure_workers(3), 5);
        assert_eq!(scheduler.worker_count(), 5);
    }
}
