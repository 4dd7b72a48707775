//! Bounded-parallel job scheduler with per-group mutual exclusion.
//!
//! Workers pull the first queued job whose schedule group is idle. Jobs whose
//! group is busy stay queued in place; a worker that finds nothing eligible
//! sleeps until some group is released.

use crate::config::HostConfig;
use crate::utils::errors::Result;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::ops::AddAssign;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{error, info};

/// What the scheduler needs to know about a job
pub trait ScheduledJob: Send + Sync + 'static {
    /// Unique job key, used in log lines
    fn key(&self) -> &str;

    /// Jobs sharing a group never run concurrently
    fn group(&self) -> &str;

    /// Disabled jobs are taken off the queue without running
    fn enabled(&self) -> bool;
}

impl ScheduledJob for HostConfig {
    fn key(&self) -> &str {
        &self.host
    }

    fn group(&self) -> &str {
        &self.schedule_group
    }

    fn enabled(&self) -> bool {
        self.schedule_enabled
    }
}

/// Outcome counts of one scheduler run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleSummary {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl ScheduleSummary {
    pub fn total(&self) -> usize {
        self.completed + self.failed + self.skipped
    }
}

impl AddAssign for ScheduleSummary {
    fn add_assign(&mut self, other: Self) {
        self.completed += other.completed;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

struct QueueState<J> {
    queue: VecDeque<Arc<J>>,
    in_progress: HashSet<String>,
}

struct Shared<J> {
    state: Mutex<QueueState<J>>,
    released: Notify,
}

impl<J> Shared<J> {
    fn lock(&self) -> MutexGuard<'_, QueueState<J>> {
        // The lock is never held across user code, so a poisoned state is still consistent
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

enum Next<J> {
    Run(Arc<J>),
    Wait,
    Drained,
}

/// Marks a group in progress; releases it and wakes idle workers on drop
struct GroupGuard<J> {
    shared: Arc<Shared<J>>,
    group: String,
}

impl<J> Drop for GroupGuard<J> {
    fn drop(&mut self) {
        self.shared.lock().in_progress.remove(&self.group);
        self.shared.released.notify_waiters();
    }
}

/// Runs jobs on a fixed number of workers
pub struct Scheduler<J> {
    workers: usize,
    shared: Arc<Shared<J>>,
}

impl<J: ScheduledJob> Scheduler<J> {
    /// Create a scheduler over `jobs` in queue order. Zero workers means one.
    pub fn new(workers: usize, jobs: Vec<J>) -> Self {
        Self {
            workers: workers.max(1),
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    queue: jobs.into_iter().map(Arc::new).collect(),
                    in_progress: HashSet::new(),
                }),
                released: Notify::new(),
            }),
        }
    }

    /// Run every queued job once and wait for all workers to finish.
    ///
    /// Each job runs in its own task; an error or a panic counts the job as
    /// failed and the worker moves on.
    pub async fn run<F, Fut>(self, run_job: F) -> ScheduleSummary
    where
        F: Fn(Arc<J>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let run_job = Arc::new(run_job);
        let mut handles = Vec::with_capacity(self.workers);

        for worker in 0..self.workers {
            let shared = self.shared.clone();
            let run_job = run_job.clone();
            handles.push(tokio::spawn(worker_loop(worker, shared, run_job)));
        }

        let mut summary = ScheduleSummary::default();
        for handle in handles {
            match handle.await {
                Ok(worker_summary) => summary += worker_summary,
                Err(e) => error!(error = %e, "Scheduler worker terminated abnormally"),
            }
        }

        info!(
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            "All scheduled jobs processed"
        );
        summary
    }
}

/// Convenience wrapper around [`Scheduler::new`] and [`Scheduler::run`]
pub async fn run_all<J, F, Fut>(workers: usize, jobs: Vec<J>, run_job: F) -> ScheduleSummary
where
    J: ScheduledJob,
    F: Fn(Arc<J>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Scheduler::new(workers, jobs).run(run_job).await
}

fn next_job<J: ScheduledJob>(shared: &Shared<J>) -> Next<J> {
    let mut state = shared.lock();
    if state.queue.is_empty() {
        return Next::Drained;
    }

    let eligible = state
        .queue
        .iter()
        .position(|job| !state.in_progress.contains(job.group()));

    match eligible.and_then(|index| state.queue.remove(index)) {
        Some(job) => {
            state.in_progress.insert(job.group().to_string());
            Next::Run(job)
        }
        None => Next::Wait,
    }
}

async fn worker_loop<J, F, Fut>(
    worker: usize,
    shared: Arc<Shared<J>>,
    run_job: Arc<F>,
) -> ScheduleSummary
where
    J: ScheduledJob,
    F: Fn(Arc<J>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let mut summary = ScheduleSummary::default();

    loop {
        // Registered before looking at the queue so a release in between is not missed
        let released = shared.released.notified();

        let job = match next_job(&shared) {
            Next::Run(job) => {
                drop(released);
                job
            }
            Next::Wait => {
                released.await;
                continue;
            }
            Next::Drained => break,
        };

        let _guard = GroupGuard {
            shared: shared.clone(),
            group: job.group().to_string(),
        };

        if !job.enabled() {
            info!(worker, job = job.key(), "Job disabled, skipping");
            summary.skipped += 1;
            continue;
        }

        info!(worker, job = job.key(), group = job.group(), "Starting job");
        match tokio::spawn(run_job(job.clone())).await {
            Ok(Ok(())) => summary.completed += 1,
            Ok(Err(e)) => {
                error!(worker, job = job.key(), error = %e, "Job failed");
                summary.failed += 1;
            }
            Err(e) => {
                error!(worker, job = job.key(), error = %e, "Job aborted");
                summary.failed += 1;
            }
        }
    }

    summary
}
