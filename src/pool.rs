//! Worker pool backing the execution fan-out engine, per §4.5.
//!
//! Two modes: `Fixed(N)` keeps N long-lived daemon threads draining an
//! unbounded FIFO; `Cached` emulates a direct-handoff pool with zero core
//! threads, an unbounded maximum, and a 60s idle timeout, matching the
//! `executorSize == 0` semantics.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use crossbeam_queue::SegQueue;

use crate::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// `executorSize` from §4.5: 0 selects the cached mode, N>0 a fixed pool
/// of N threads.
#[derive(Debug, Clone, Copy)]
pub enum PoolSize {
    Fixed(usize),
    Cached,
}

enum Mode {
    Fixed {
        sender: Sender<Job>,
        handles: Vec<JoinHandle<()>>,
    },
    Cached {
        idle: Arc<SegQueue<Sender<Job>>>,
        idle_timeout: Duration,
        handles: Arc<std::sync::Mutex<Vec<JoinHandle<()>>>>,
    },
}

/// A pool of daemon worker threads. Workers never outlive a `close()` that
/// fully drains; short of that, the process exit takes them down (daemon
/// semantics — Rust has no forced-thread-kill, so "force-terminate" means
/// "stop waiting for them", per DESIGN.md).
pub struct WorkerPool {
    mode: Mode,
}

impl WorkerPool {
    pub fn new(size: PoolSize, idle_timeout: Duration) -> Self {
        match size {
            PoolSize::Fixed(n) => {
                let (sender, receiver) = unbounded::<Job>();
                let handles = (0..n.max(1))
                    .map(|i| spawn_fixed_worker(i, receiver.clone()))
                    .collect();
                Self {
                    mode: Mode::Fixed { sender, handles },
                }
            }
            PoolSize::Cached => Self {
                mode: Mode::Cached {
                    idle: Arc::new(SegQueue::new()),
                    idle_timeout,
                    handles: Arc::new(std::sync::Mutex::new(Vec::new())),
                },
            },
        }
    }

    /// Submit a job. Never blocks the caller (§5: "suspension points: ...
    /// awaiting a response future inside the response state machine is
    /// not allowed" — the same non-blocking discipline applies to
    /// submission here).
    pub fn submit(&self, job: Job) -> Result<()> {
        match &self.mode {
            Mode::Fixed { sender, .. } => sender
                .send(job)
                .map_err(|_| Error::Execution("worker pool is shut down".into())),
            Mode::Cached {
                idle,
                idle_timeout,
                handles,
            } => {
                while let Some(worker_tx) = idle.pop() {
                    // the idle worker may have just timed out and exited;
                    // a failed send means try the next one.
                    match worker_tx.send(job) {
                        Ok(()) => return Ok(()),
                        Err(crossbeam_channel::SendError(returned)) => {
                            return self.spawn_cached_worker_with(returned, Arc::clone(idle), *idle_timeout, handles);
                        }
                    }
                }
                self.spawn_cached_worker_with(job, Arc::clone(idle), *idle_timeout, handles)
            }
        }
    }

    fn spawn_cached_worker_with(
        &self,
        job: Job,
        idle: Arc<SegQueue<Sender<Job>>>,
        idle_timeout: Duration,
        handles: &Arc<std::sync::Mutex<Vec<JoinHandle<()>>>>,
    ) -> Result<()> {
        let handle = spawn_cached_worker(job, idle, idle_timeout);
        handles
            .lock()
            .map_err(|_| Error::Execution("worker pool handle list poisoned".into()))?
            .push(handle);
        Ok(())
    }

    /// Idempotent shutdown: stop accepting new work and wait up to
    /// `budget` for in-flight/queued jobs to drain, polling every 5s per
    /// §5. Returns once the budget is exhausted even if workers have not
    /// joined — the caller's thread must never block past the budget.
    pub fn close(self, budget: Duration) {
        let poll_interval = Duration::from_secs(5).min(budget);
        match self.mode {
            Mode::Fixed { sender, handles } => {
                drop(sender);
                join_within_budget(handles, budget, poll_interval);
            }
            Mode::Cached { handles, .. } => {
                let handles = match Arc::try_unwrap(handles) {
                    Ok(mutex) => mutex.into_inner().unwrap_or_default(),
                    Err(shared) => shared.lock().map(|mut g| std::mem::take(&mut *g)).unwrap_or_default(),
                };
                join_within_budget(handles, budget, poll_interval);
            }
        }
    }
}

fn join_within_budget(handles: Vec<JoinHandle<()>>, budget: Duration, poll_interval: Duration) {
    let deadline = Instant::now() + budget;
    let mut remaining = handles;
    while !remaining.is_empty() && Instant::now() < deadline {
        remaining.retain(|h| !h.is_finished());
        if remaining.is_empty() {
            break;
        }
        std::thread::sleep(poll_interval.min(deadline.saturating_duration_since(Instant::now())));
    }
    if !remaining.is_empty() {
        log::warn!(
            "worker pool shutdown budget exceeded with {} thread(s) still running; force-escalating (detaching)",
            remaining.len()
        );
    }
}

fn spawn_fixed_worker(index: usize, receiver: Receiver<Job>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("sharding-core-worker-{index}"))
        .spawn(move || {
            while let Ok(job) = receiver.recv() {
                job();
            }
        })
        .expect("failed to spawn fixed worker thread")
}

fn spawn_cached_worker(first_job: Job, idle: Arc<SegQueue<Sender<Job>>>, idle_timeout: Duration) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("sharding-core-worker-cached".into())
        .spawn(move || {
            let mut job = first_job;
            loop {
                job();

                let (tx, rx) = bounded::<Job>(1);
                idle.push(tx);

                match rx.recv_timeout(idle_timeout) {
                    Ok(next) => job = next,
                    Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })
        .expect("failed to spawn cached worker thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fixed_pool_runs_all_submitted_jobs() {
        let pool = WorkerPool::new(PoolSize::Fixed(2), Duration::from_secs(60));
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }

        pool.close(Duration::from_secs(5));
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn cached_pool_runs_all_submitted_jobs() {
        let pool = WorkerPool::new(PoolSize::Cached, Duration::from_millis(200));
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            pool.submit(Box::new(move || {
                std::thread::sleep(Duration::from_millis(10));
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }

        pool.close(Duration::from_secs(5));
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }
}
