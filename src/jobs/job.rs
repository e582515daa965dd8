//! A `Job` tracks how many of its tasks are still outstanding and lets a
//! waiting thread help finish them instead of blocking idle (§3: "Job",
//! §4.5: "work donation").

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::checked_assert;
use crate::sync::CondGate;

use super::worker_pool::WorkerPool;

/// A unit of work queued on a [`super::task_queue::TaskQueue`].
pub type TaskFn = Box<dyn FnOnce() + Send + 'static>;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Shared between a [`Job`] and every task spawned under it; the worker pool
/// decrements it as each task completes and signals the gate when it hits
/// zero (§3: "num_tasks_in_progress").
pub struct JobSynchronizer {
    remaining: AtomicI64,
    gate: CondGate,
}

impl JobSynchronizer {
    pub(crate) fn new() -> Self {
        JobSynchronizer { remaining: AtomicI64::new(0), gate: CondGate::new() }
    }

    pub(crate) fn add_tasks(&self, n: i64) {
        self.remaining.fetch_add(n, Ordering::AcqRel);
    }

    pub(crate) fn complete_one(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.gate.signal_all();
        }
    }

    pub fn remaining(&self) -> i64 {
        self.remaining.load(Ordering::Acquire)
    }
}

/// Constructed, executed (any number of tasks queued against it), waited on,
/// then destructed. §3's invariant -- `num_tasks_in_progress == 0` at
/// destruction -- is checked on drop.
pub struct Job {
    id: u64,
    sync: Arc<JobSynchronizer>,
}

impl Job {
    pub fn new() -> Self {
        Job { id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed), sync: Arc::new(JobSynchronizer::new()) }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn synchronizer(&self) -> Arc<JobSynchronizer> {
        self.sync.clone()
    }

    pub fn tasks_in_progress(&self) -> i64 {
        self.sync.remaining()
    }

    /// Blocks until every task queued under this job has completed. While
    /// blocked, the calling thread donates its time by running this job's
    /// own queued tasks from any worker queue -- the donation that prevents
    /// deadlock when the thread waiting is itself a worker (§4.5, §5).
    pub fn wait(&self, pool: &WorkerPool) {
        pool.donate_until_done(self.id, &self.sync);
    }
}

impl Default for Job {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocates a fresh job id and synchronizer without the `Job` wrapper's
/// drop-time "no tasks outstanding" check -- for callers (the timed
/// dispatcher) that track completion through the synchronizer directly
/// rather than holding a `Job` for the fire's lifetime.
pub(crate) fn ad_hoc_job() -> (u64, Arc<JobSynchronizer>) {
    (NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed), Arc::new(JobSynchronizer::new()))
}

impl Drop for Job {
    fn drop(&mut self) {
        checked_assert(self.sync.remaining() == 0, "job destructed with tasks still in progress");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synchronizer_signals_once_the_last_task_completes() {
        let sync = JobSynchronizer::new();
        sync.add_tasks(3);
        sync.complete_one();
        sync.complete_one();
        assert_eq!(sync.remaining(), 1);
        sync.complete_one();
        assert_eq!(sync.remaining(), 0);
    }

    #[test]
    fn job_with_no_tasks_drops_cleanly() {
        let job = Job::new();
        assert_eq!(job.tasks_in_progress(), 0);
    }
}
