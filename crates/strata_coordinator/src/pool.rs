//! Worker pools owned by a coordinator.
//!
//! Read and write pools queue without bound. The dispatch pool hands jobs
//! to an idle worker and, only when every worker is busy, runs the job on the
//! submitting thread. Workers share one MPMC receiver and announce themselves
//! idle before blocking on it; a submitter claims one of those announcements
//! before queueing. Timeouts and cancellation fan-out run on a small tokio
//! runtime.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::config::{CoordinatorConfig, SCHEDULED_EXECUTOR_SIZE};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// What a pool does when every worker is busy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaturationPolicy {
    /// Queue the job until a worker frees up.
    Queue,
    /// Run the job on the submitting thread.
    CallerRuns,
}

/// Where a submitted job ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Submission {
    Queued,
    CallerRan,
}

/// Fixed set of named worker threads.
pub struct WorkerPool {
    name: String,
    size: usize,
    policy: SaturationPolicy,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    idle: Arc<AtomicUsize>,
    caller_runs: AtomicU64,
}

impl WorkerPool {
    pub fn new(name: &str, size: usize, policy: SaturationPolicy) -> anyhow::Result<Self> {
        anyhow::ensure!(size > 0, "pool {name} needs at least one worker");
        let (sender, receiver) = crossbeam_channel::unbounded();
        let idle = Arc::new(AtomicUsize::new(0));
        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = receiver.clone();
            let idle = idle.clone();
            let pool_name = name.to_string();
            let handle = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || worker_loop(&pool_name, &receiver, &idle))
                .with_context(|| format!("spawn {name} worker {index}"))?;
            workers.push(handle);
        }
        debug!(pool = name, size, ?policy, "worker pool started");
        Ok(Self {
            name: name.to_string(),
            size,
            policy,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            idle,
            caller_runs: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn policy(&self) -> SaturationPolicy {
        self.policy
    }

    /// Workers currently waiting for a job that no submitter has claimed.
    pub fn idle_workers(&self) -> usize {
        self.idle.load(Ordering::Acquire)
    }

    /// Number of jobs the caller ran itself because the pool was saturated.
    pub fn caller_runs(&self) -> u64 {
        self.caller_runs.load(Ordering::Relaxed)
    }

    /// Submit a job according to the pool's saturation policy.
    pub fn execute<F>(&self, job: F) -> anyhow::Result<Submission>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self
            .sender
            .lock()
            .clone()
            .with_context(|| format!("pool {} is shut down", self.name))?;
        let claimed = self.claim_idle_worker();
        if self.policy == SaturationPolicy::CallerRuns && !claimed {
            self.caller_runs.fetch_add(1, Ordering::Relaxed);
            debug!(pool = %self.name, "pool saturated, running job on caller");
            job();
            return Ok(Submission::CallerRan);
        }
        sender
            .send(Box::new(job))
            .map_err(|_| anyhow::anyhow!("pool {} has no live workers", self.name))?;
        Ok(Submission::Queued)
    }

    fn claim_idle_worker(&self) -> bool {
        self.idle
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |idle| idle.checked_sub(1))
            .is_ok()
    }

    /// Stop accepting jobs and wait for workers to drain.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        let workers = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                warn!(pool = %self.name, "worker exited with a panic");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("policy", &self.policy)
            .finish()
    }
}

fn worker_loop(pool: &str, receiver: &Receiver<Job>, idle: &AtomicUsize) {
    loop {
        idle.fetch_add(1, Ordering::AcqRel);
        let Ok(job) = receiver.recv() else {
            return;
        };
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
            error!(pool, "job panicked");
        }
    }
}

/// Handle to a task scheduled on a [`ScheduledPool`].
#[derive(Debug)]
pub struct ScheduledTask {
    abort: tokio::task::AbortHandle,
}

impl ScheduledTask {
    pub fn cancel(&self) {
        self.abort.abort();
    }
}

/// Small tokio runtime for delayed and asynchronous coordinator work.
pub struct ScheduledPool {
    handle: tokio::runtime::Handle,
    runtime: Option<tokio::runtime::Runtime>,
}

impl ScheduledPool {
    pub fn new(name: &str, threads: usize) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name(name)
            .enable_time()
            .build()
            .with_context(|| format!("build {name} runtime"))?;
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
        })
    }

    pub fn handle(&self) -> &tokio::runtime::Handle {
        &self.handle
    }

    /// Run `task` once after `delay`.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> ScheduledTask
    where
        F: FnOnce() + Send + 'static,
    {
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
        ScheduledTask {
            abort: join.abort_handle(),
        }
    }

    pub fn spawn<Fut>(&self, future: Fut) -> tokio::task::JoinHandle<Fut::Output>
    where
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }
}

impl Drop for ScheduledPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            // Non-blocking; this may run inside an async context.
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for ScheduledPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledPool").finish_non_exhaustive()
    }
}

/// Every pool a coordinator runs on.
#[derive(Debug, Clone)]
pub struct CoordinatorPools {
    pub read: Arc<WorkerPool>,
    pub write: Arc<WorkerPool>,
    pub dispatch: Arc<WorkerPool>,
    pub scheduled: Arc<ScheduledPool>,
}

impl CoordinatorPools {
    pub fn from_config(config: &CoordinatorConfig) -> anyhow::Result<Self> {
        Ok(Self {
            read: Arc::new(WorkerPool::new(
                "coordinator-read",
                config.coordinator_read_executor_size,
                SaturationPolicy::Queue,
            )?),
            write: Arc::new(WorkerPool::new(
                "coordinator-write",
                config.coordinator_write_executor_size,
                SaturationPolicy::Queue,
            )?),
            dispatch: Arc::new(WorkerPool::new(
                "coordinator-dispatch",
                config.dispatch_executor_size(),
                SaturationPolicy::CallerRuns,
            )?),
            scheduled: Arc::new(ScheduledPool::new(
                "coordinator-scheduled",
                SCHEDULED_EXECUTOR_SIZE,
            )?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;
    use std::sync::Barrier;
    use std::time::Instant;

    #[test]
    fn queue_pool_runs_every_job() {
        let pool = WorkerPool::new("test-queue", 2, SaturationPolicy::Queue).unwrap();
        let (tx, rx) = channel();
        for i in 0..20 {
            let tx = tx.clone();
            assert_eq!(
                pool.execute(move || tx.send(i).unwrap()).unwrap(),
                Submission::Queued
            );
        }
        let mut seen: Vec<i32> = (0..20).map(|_| rx.recv().unwrap()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
        assert_eq!(pool.caller_runs(), 0);
    }

    fn wait_for_idle(pool: &WorkerPool, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.idle_workers() < count {
            assert!(Instant::now() < deadline, "workers never became idle");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn saturated_handoff_pool_runs_on_caller() {
        let pool = WorkerPool::new("test-dispatch", 1, SaturationPolicy::CallerRuns).unwrap();
        wait_for_idle(&pool, 1);
        let gate = Arc::new(Barrier::new(2));
        let held = gate.clone();
        assert_eq!(
            pool.execute(move || {
                held.wait();
            })
            .unwrap(),
            Submission::Queued
        );
        // The only worker is claimed, so the next job runs here.
        let caller = thread::current().id();
        let (tx, rx) = channel();
        let outcome = pool
            .execute(move || tx.send(thread::current().id()).unwrap())
            .unwrap();
        assert_eq!(outcome, Submission::CallerRan);
        assert_eq!(rx.recv().unwrap(), caller);
        assert_eq!(pool.caller_runs(), 1);
        gate.wait();
    }

    #[test]
    fn idle_workers_take_back_to_back_jobs() {
        let pool = WorkerPool::new("test-fanout", 20, SaturationPolicy::CallerRuns).unwrap();
        wait_for_idle(&pool, 20);
        let gate = Arc::new(Barrier::new(11));
        let caller = thread::current().id();
        let (tx, rx) = channel();
        for _ in 0..10 {
            let gate = gate.clone();
            let tx = tx.clone();
            let outcome = pool
                .execute(move || {
                    tx.send(thread::current().id()).unwrap();
                    gate.wait();
                })
                .unwrap();
            assert_eq!(outcome, Submission::Queued);
        }
        let ran_on: Vec<_> = (0..10).map(|_| rx.recv().unwrap()).collect();
        assert!(ran_on.iter().all(|id| *id != caller));
        assert_eq!(pool.caller_runs(), 0);
        gate.wait();
    }

    #[test]
    fn shutdown_rejects_new_jobs() {
        let pool = WorkerPool::new("test-shutdown", 1, SaturationPolicy::Queue).unwrap();
        pool.shutdown();
        assert!(pool.execute(|| {}).is_err());
    }

    #[test]
    fn panicking_job_keeps_worker_alive() {
        let pool = WorkerPool::new("test-panic", 1, SaturationPolicy::Queue).unwrap();
        pool.execute(|| panic!("boom")).unwrap();
        let (tx, rx) = channel();
        pool.execute(move || tx.send(1).unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
    }

    #[test]
    fn scheduled_task_fires_and_can_be_canceled() {
        let pool = ScheduledPool::new("test-scheduled", 1).unwrap();
        let (tx, rx) = channel();
        let fired = tx.clone();
        pool.schedule(Duration::from_millis(10), move || fired.send("fired").unwrap());
        let canceled = pool.schedule(Duration::from_millis(200), move || {
            tx.send("canceled").unwrap()
        });
        canceled.cancel();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "fired");
        assert!(rx.recv_timeout(Duration::from_millis(400)).is_err());
    }
}
