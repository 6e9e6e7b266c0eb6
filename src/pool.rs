//! Resizable set of worker tasks.
//!
//! Each worker loops on [`JobQueue::dequeue`] and hands every job to the
//! shared [`JobRunner`]. Shrinking the pool retires workers between jobs:
//! a retiring worker finishes the job it holds and then exits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::orchestrator::JobRunner;
use crate::queue::JobQueue;

struct Worker {
    id: usize,
    retire: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Workers {
    active: Vec<Worker>,
    /// Retired workers possibly still finishing a job.
    retiring: Vec<JoinHandle<()>>,
}

pub struct WorkerPool {
    runner: Arc<JobRunner>,
    queue: Arc<JobQueue>,
    workers: Mutex<Workers>,
    next_id: AtomicUsize,
    busy: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Creates an empty pool. Call [`resize`](Self::resize) to start workers.
    pub fn new(runner: Arc<JobRunner>, queue: Arc<JobQueue>) -> Self {
        Self {
            runner,
            queue,
            workers: Mutex::new(Workers::default()),
            next_id: AtomicUsize::new(0),
            busy: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn workers(&self) -> MutexGuard<'_, Workers> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Grows or shrinks the pool to `n` workers. Must run inside a tokio
    /// runtime. Calling it again with the same `n` changes nothing.
    pub fn resize(&self, n: usize) {
        let mut workers = self.workers();
        workers.retiring.retain(|h| !h.is_finished());
        let previous = workers.active.len();

        while workers.active.len() < n {
            let worker = self.spawn_worker();
            workers.active.push(worker);
        }
        while workers.active.len() > n {
            let Some(worker) = workers.active.pop() else {
                break;
            };
            tracing::debug!(worker = worker.id, "Retiring worker");
            worker.retire.cancel();
            workers.retiring.push(worker.handle);
        }

        if previous != n {
            tracing::info!(previous, workers = n, "Worker pool resized");
        }
    }

    fn spawn_worker(&self) -> Worker {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let retire = CancellationToken::new();
        let handle = tokio::spawn(worker_loop(
            id,
            Arc::clone(&self.runner),
            Arc::clone(&self.queue),
            retire.clone(),
            Arc::clone(&self.busy),
        ));
        Worker { id, retire, handle }
    }

    /// Workers currently taking new jobs.
    pub fn size(&self) -> usize {
        self.workers().active.len()
    }

    /// Workers currently executing a job, retiring ones included.
    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::Relaxed)
    }

    /// Retires every worker and waits for all of them to exit. Workers
    /// finish the job they hold first.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers();
            let mut handles: Vec<JoinHandle<()>> = workers.retiring.drain(..).collect();
            for worker in workers.active.drain(..) {
                worker.retire.cancel();
                handles.push(worker.handle);
            }
            handles
        };

        let count = handles.len();
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::error!("Worker task failed: {err}");
            }
        }
        tracing::debug!(workers = count, "Worker pool stopped");
    }
}

async fn worker_loop(
    id: usize,
    runner: Arc<JobRunner>,
    queue: Arc<JobQueue>,
    retire: CancellationToken,
    busy: Arc<AtomicUsize>,
) {
    tracing::debug!(worker = id, "Worker started");
    loop {
        let job_id = tokio::select! {
            biased;
            _ = retire.cancelled() => break,
            next = queue.dequeue() => match next {
                Some(job_id) => job_id,
                None => break,
            },
        };

        busy.fetch_add(1, Ordering::Relaxed);
        runner.run_job(job_id).await;
        busy.fetch_sub(1, Ordering::Relaxed);
    }
    tracing::debug!(worker = id, "Worker stopped");
}
