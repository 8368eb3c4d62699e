//! Grow-only pool of worker loops.
//!
//! Each worker owns a FIFO of jobs and a counting semaphore used as its wake
//! signal; the number of available permits is the worker's backlog.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::util::lock;

/// A queued unit of worker execution.
pub type Job = BoxFuture<'static, ()>;

struct Worker {
    signal: Arc<Semaphore>,
    jobs: Arc<Mutex<VecDeque<Job>>>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn backlog(&self) -> usize {
        self.signal.available_permits()
    }
}

pub struct WorkerPool {
    workers: Mutex<Vec<Worker>>,
    target: AtomicUsize,
    next: AtomicUsize,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            workers: Mutex::new(Vec::new()),
            target: AtomicUsize::new(size.max(1)),
            next: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
        }
    }

    /// Grow the pool to `size` workers. Never shrinks.
    pub fn grow(&self, size: usize) -> usize {
        let previous = self.target.fetch_max(size, Ordering::SeqCst);
        let current = previous.max(size);
        if current > previous {
            tracing::info!(workers = current, "Operation worker pool grown");
        }
        current
    }

    /// Configured worker count.
    pub fn size(&self) -> usize {
        self.target.load(Ordering::SeqCst)
    }

    /// Workers spawned so far.
    pub fn spawned(&self) -> usize {
        lock(&self.workers).len()
    }

    /// Queue `job` on the least loaded worker.
    ///
    /// Workers are spawned lazily on the current runtime. Returns `false` if no
    /// runtime is available or the pool was shut down.
    pub fn dispatch(&self, job: Job) -> bool {
        if self.cancel.is_cancelled() {
            tracing::debug!("Dispatch after pool shutdown ignored");
            return false;
        }

        let mut workers = lock(&self.workers);
        let target = self.size();
        if workers.len() < target {
            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                tracing::error!("No async runtime available for operation workers");
                return false;
            };
            while workers.len() < target {
                let index = workers.len();
                workers.push(self.spawn_worker(&runtime, index));
            }
        }

        let index = self.pick(&workers);
        let worker = &workers[index];
        lock(&worker.jobs).push_back(job);
        worker.signal.add_permits(1);
        true
    }

    /// Lowest backlog wins; ties rotate so simultaneous bursts spread out.
    fn pick(&self, workers: &[Worker]) -> usize {
        let count = workers.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed) % count;
        let min = workers.iter().map(Worker::backlog).min().unwrap_or(0);
        (0..count)
            .map(|offset| (start + offset) % count)
            .find(|&i| workers[i].backlog() == min)
            .unwrap_or(start)
    }

    fn spawn_worker(&self, runtime: &tokio::runtime::Handle, index: usize) -> Worker {
        let signal = Arc::new(Semaphore::new(0));
        let jobs = Arc::new(Mutex::new(VecDeque::new()));
        let handle = runtime.spawn(worker_loop(
            index,
            Arc::clone(&signal),
            Arc::clone(&jobs),
            self.cancel.clone(),
        ));
        Worker {
            signal,
            jobs,
            handle,
        }
    }

    /// Stop every worker. Queued jobs are dropped.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        for worker in lock(&self.workers).drain(..) {
            worker.signal.close();
            worker.handle.abort();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn worker_loop(
    index: usize,
    signal: Arc<Semaphore>,
    jobs: Arc<Mutex<VecDeque<Job>>>,
    cancel: CancellationToken,
) {
    tracing::debug!(worker = index, "Operation worker started");
    loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = signal.acquire() => permit,
        };
        match permit {
            Ok(permit) => permit.forget(),
            Err(_) => break,
        }

        let job = lock(&jobs).pop_front();
        if let Some(job) = job {
            job.await;
        }
    }
    tracing::debug!(worker = index, "Operation worker stopped");
}
