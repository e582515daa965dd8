//! C4: the job scheduler facade. Wraps the [`WorkerPool`] and [`Dispatcher`]
//! behind the abstract API of §6: fire-and-forget submission, parallel-for
//! with partition/batch, parallel-invoke, delayed tasks under a
//! time-critical scope, and main-thread draining.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::platform::Clock;

use super::job::{Job, TaskFn};
use super::timed::{Dispatcher, PeriodicOptions, TimedJob};
use super::worker_pool::WorkerPool;

/// Below this many free (hinted-empty) queues, `parallel_for` runs
/// sequentially rather than pay task-dispatch overhead (§4.7).
const SEQUENTIAL_THRESHOLD: usize = 1;

pub struct JobScheduler {
    pool: Arc<WorkerPool>,
    dispatcher: Arc<Dispatcher>,
    clock: Clock,
    time_critical_depth: AtomicUsize,
    delayed: Mutex<Vec<TaskFn>>,
}

impl JobScheduler {
    pub fn new(num_queues: usize, num_companions: usize) -> Arc<Self> {
        let pool = WorkerPool::new(num_queues, num_companions);
        let dispatcher = Dispatcher::new(pool.clone());
        Arc::new(JobScheduler {
            pool,
            dispatcher,
            clock: Clock::new(),
            time_critical_depth: AtomicUsize::new(0),
            delayed: Mutex::new(Vec::new()),
        })
    }

    fn submit(&self, f: TaskFn) {
        let (id, sync) = super::job::ad_hoc_job();
        self.pool.push_task(id, sync, f);
    }

    pub fn push_task(&self, f: impl FnOnce() + Send + 'static) {
        self.submit(Box::new(f));
    }

    pub fn push_io_task(&self, f: impl FnOnce() + Send + 'static) {
        let (id, sync) = super::job::ad_hoc_job();
        self.pool.push_io_task(id, sync, Box::new(f));
    }

    pub fn push_background_task(&self, f: impl FnOnce() + Send + 'static) {
        let (id, sync) = super::job::ad_hoc_job();
        self.pool.push_background_task(id, sync, Box::new(f));
    }

    pub fn push_main_thread_task(&self, f: impl FnOnce() + Send + 'static) {
        let (id, sync) = super::job::ad_hoc_job();
        self.pool.push_main_thread_task(id, sync, Box::new(f));
    }

    pub fn work_on_main_thread(&self) {
        self.pool.work_on_main_thread();
    }

    pub fn work_on_main_thread_no_block(&self) {
        self.pool.work_on_main_thread_no_block();
    }

    /// §4.7: below `SEQUENTIAL_THRESHOLD` free queues, run `[first, last)`
    /// sequentially. Otherwise spawn up to `clamp(ceil(N/batch), 1,
    /// num_queues)` tasks; each starts on a disjoint `partition`-sized slice
    /// then steals further `batch`-sized ranges from a shared atomic cursor.
    /// The calling thread waits via `Job::wait`'s work donation, so it also
    /// ends up running some of the work.
    pub fn parallel_for(&self, first: usize, last: usize, partition: usize, batch: usize, f: impl Fn(usize) + Send + Sync + 'static) {
        if last <= first {
            return;
        }
        let n = last - first;
        let partition = partition.max(1);
        let batch = batch.max(1);

        if self.pool.free_queue_count() < SEQUENTIAL_THRESHOLD || n <= partition {
            for i in first..last {
                f(i);
            }
            return;
        }

        let num_tasks = ((n + batch - 1) / batch).clamp(1, self.pool.num_queues());
        let handed_out = (num_tasks * partition).min(n);
        let cursor = Arc::new(AtomicUsize::new(first + handed_out));
        let f = Arc::new(f);
        let job = Job::new();

        for task_idx in 0..num_tasks {
            let my_start = (first + task_idx * partition).min(last);
            let my_end = (my_start + partition).min(last);
            let cursor = cursor.clone();
            let f = f.clone();
            self.pool.push_task(job.id(), job.synchronizer(), Box::new(move || {
                for i in my_start..my_end {
                    f(i);
                }
                loop {
                    let start = cursor.fetch_add(batch, Ordering::Relaxed);
                    if start >= last {
                        break;
                    }
                    let end = (start + batch).min(last);
                    for i in start..end {
                        f(i);
                    }
                }
            }));
        }

        job.wait(&self.pool);
    }

    /// Identical index-range semantics to [`parallel_for`](Self::parallel_for);
    /// kept as a distinct entry point to mirror §6's abstract API, which
    /// names both a by-value and a by-index form over the same cursor-steal
    /// scheme.
    pub fn parallel_for_index(&self, begin: usize, end: usize, partition: usize, batch: usize, f: impl Fn(usize) + Send + Sync + 'static) {
        self.parallel_for(begin, end, partition, batch, f);
    }

    /// Runs `f2` as a one-task job on another queue, `f1` on the calling
    /// thread, then waits for `f2` (§4.7).
    pub fn parallel_invoke(&self, f1: impl FnOnce() + Send + 'static, f2: impl FnOnce() + Send + 'static) {
        let job = Job::new();
        self.pool.push_task(job.id(), job.synchronizer(), Box::new(f2));
        f1();
        job.wait(&self.pool);
    }

    /// Defers enqueue until the outermost [`time_critical_scope`](Self::time_critical_scope)
    /// exits, or submits immediately if no scope is entered (§4.7).
    pub fn push_delayed(&self, f: impl FnOnce() + Send + 'static) {
        if self.time_critical_depth.load(Ordering::Acquire) > 0 {
            self.delayed.lock().unwrap_or_else(|e| e.into_inner()).push(Box::new(f));
        } else {
            self.push_task(f);
        }
    }

    /// Enters a (possibly nested) time-critical section; delayed tasks
    /// pushed during it are flushed atomically when the outermost guard
    /// drops.
    pub fn time_critical_scope(self: &Arc<Self>) -> TimeCriticalScope {
        self.time_critical_depth.fetch_add(1, Ordering::AcqRel);
        TimeCriticalScope { scheduler: self.clone() }
    }

    fn flush_delayed(&self) {
        let tasks: Vec<TaskFn> = std::mem::take(&mut *self.delayed.lock().unwrap_or_else(|e| e.into_inner()));
        for t in tasks {
            self.submit(t);
        }
    }

    pub fn one_shot(&self, delay_us: u64, f: impl Fn() + Send + Sync + 'static) -> TimedJob {
        self.dispatcher.one_shot(delay_us, f)
    }

    pub fn periodic(&self, first_delay_us: u64, opts: PeriodicOptions, f: impl Fn() + Send + Sync + 'static) -> TimedJob {
        self.dispatcher.periodic(first_delay_us, opts, f)
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
        self.pool.shutdown();
    }
}

/// RAII guard returned by [`JobScheduler::time_critical_scope`]. Flushes the
/// scheduler's delayed-task buffer when the last nested guard drops.
pub struct TimeCriticalScope {
    scheduler: Arc<JobScheduler>,
}

impl Drop for TimeCriticalScope {
    fn drop(&mut self) {
        if self.scheduler.time_critical_depth.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.scheduler.flush_delayed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn parallel_for_covers_every_index_exactly_once() {
        let scheduler = JobScheduler::new(4, 1);
        let seen = Arc::new(StdMutex::new(vec![0u32; 1000]));
        let seen2 = seen.clone();
        scheduler.parallel_for(0, 1000, 32, 16, move |i| {
            seen2.lock().unwrap()[i] += 1;
        });
        assert!(seen.lock().unwrap().iter().all(|&c| c == 1));
        scheduler.shutdown();
    }

    #[test]
    fn parallel_invoke_runs_both_closures() {
        let scheduler = JobScheduler::new(2, 1);
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let (a2, b2) = (a.clone(), b.clone());
        scheduler.parallel_invoke(
            move || { a2.store(1, Ordering::Relaxed); },
            move || { b2.store(1, Ordering::Relaxed); },
        );
        assert_eq!(a.load(Ordering::Relaxed), 1);
        assert_eq!(b.load(Ordering::Relaxed), 1);
        scheduler.shutdown();
    }

    #[test]
    fn delayed_tasks_flush_only_when_the_outermost_scope_exits() {
        let scheduler = JobScheduler::new(2, 1);
        let ran = Arc::new(AtomicUsize::new(0));
        let outer = scheduler.time_critical_scope();
        let inner = scheduler.time_critical_scope();
        let r2 = ran.clone();
        scheduler.push_delayed(move || { r2.fetch_add(1, Ordering::Relaxed); });
        drop(inner);
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(ran.load(Ordering::Relaxed), 0, "must not flush until the outer scope drops");
        drop(outer);
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(ran.load(Ordering::Relaxed), 1);
        scheduler.shutdown();
    }
}
