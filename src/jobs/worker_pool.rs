//! C2: the worker pool. Each worker owns one [`TaskQueue`]; idle workers
//! steal from the back of a sibling's queue. A small set of companion
//! threads services long/IO-tagged tasks and assists any queue when its own
//! is empty. One queue is reserved for the embedding application's main
//! thread and is only ever drained by that thread, never by a worker (§4.5).

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::job::{JobSynchronizer, TaskFn};
use super::task_queue::{Task, TaskQueue};

thread_local! {
    /// Set by a worker thread on entry to its run loop so `choose_queue` can
    /// exclude "my own queue" from random placement (§4.5: "excluding the
    /// caller's own queue").
    static OWN_QUEUE: Cell<Option<usize>> = const { Cell::new(None) };
}

pub struct WorkerPool {
    queues: Vec<Arc<TaskQueue>>,
    companion_queue: Arc<TaskQueue>,
    main_queue: Arc<TaskQueue>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    job_syncs: Mutex<HashMap<u64, Arc<JobSynchronizer>>>,
    running: AtomicBool,
}

impl WorkerPool {
    pub fn new(num_queues: usize, num_companions: usize) -> Arc<Self> {
        let queues: Vec<_> = (0..num_queues.max(1)).map(|_| Arc::new(TaskQueue::new())).collect();
        let pool = Arc::new(WorkerPool {
            queues,
            companion_queue: Arc::new(TaskQueue::new()),
            main_queue: Arc::new(TaskQueue::new()),
            threads: Mutex::new(Vec::new()),
            job_syncs: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
        });
        pool.spawn_workers(num_companions);
        pool
    }

    pub fn num_queues(&self) -> usize {
        self.queues.len()
    }

    fn spawn_workers(self: &Arc<Self>, num_companions: usize) {
        let mut threads = self.threads.lock().unwrap();
        for idx in 0..self.queues.len() {
            let pool = self.clone();
            threads.push(std::thread::spawn(move || pool.run_worker(idx)));
        }
        for _ in 0..num_companions {
            let pool = self.clone();
            threads.push(std::thread::spawn(move || pool.run_companion()));
        }
    }

    fn run_worker(self: Arc<Self>, idx: usize) {
        OWN_QUEUE.with(|c| c.set(Some(idx)));
        let queue = &self.queues[idx];
        loop {
            if let Some(task) = queue.pop_own() {
                self.run_task(task);
                continue;
            }
            if let Some(task) = self.try_steal_excluding(idx) {
                self.run_task(task);
                continue;
            }
            if !queue.wait_for_work() {
                break;
            }
        }
    }

    fn run_companion(self: Arc<Self>) {
        loop {
            if let Some(task) = self.companion_queue.pop_own() {
                self.run_task(task);
                continue;
            }
            if let Some(task) = self.try_steal_excluding(usize::MAX) {
                self.run_task(task);
                continue;
            }
            if !self.companion_queue.wait_for_work() {
                break;
            }
        }
    }

    /// §4.5's steal protocol: try, in turn, each sibling queue via try-lock,
    /// skipping queues already hinted empty.
    fn try_steal_excluding(&self, exclude: usize) -> Option<Task> {
        for (i, q) in self.queues.iter().enumerate() {
            if i == exclude || q.maybe_empty() {
                continue;
            }
            if let Some(task) = q.try_steal() {
                return Some(task);
            }
        }
        None
    }

    fn run_task(&self, task: Task) {
        (task.run)();
        let mut syncs = self.job_syncs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sync) = syncs.get(&task.job_id).cloned() {
            sync.complete_one();
            if sync.remaining() == 0 {
                syncs.remove(&task.job_id);
            }
        }
    }

    fn choose_queue(&self) -> usize {
        let own = OWN_QUEUE.with(|c| c.get());
        for (i, q) in self.queues.iter().enumerate() {
            if Some(i) != own && q.maybe_empty() {
                return i;
            }
        }
        if self.queues.len() == 1 {
            return 0;
        }
        loop {
            let i = fastrand::usize(0..self.queues.len());
            if Some(i) != own {
                return i;
            }
        }
    }

    fn register(&self, job_id: u64, sync: Arc<JobSynchronizer>, n: i64) {
        sync.add_tasks(n);
        self.job_syncs.lock().unwrap_or_else(|e| e.into_inner()).entry(job_id).or_insert(sync);
    }

    /// Enqueues one task under `job_id` on whichever regular queue looks
    /// best (§4.5: "prefers a queue recorded as jobless ... otherwise picks
    /// randomly, excluding the caller's own queue").
    pub fn push_task(&self, job_id: u64, sync: Arc<JobSynchronizer>, f: TaskFn) {
        self.register(job_id, sync, 1);
        let q = self.choose_queue();
        self.queues[q].push(Task { job_id, run: f });
    }

    /// Long-running/IO-tagged work goes to the companion queue (§4.5).
    pub fn push_io_task(&self, job_id: u64, sync: Arc<JobSynchronizer>, f: TaskFn) {
        self.register(job_id, sync, 1);
        self.companion_queue.push(Task { job_id, run: f });
    }

    /// Background work is placed the same way as [`push_task`](Self::push_task);
    /// the distinction is advisory priority at the call site, not a separate
    /// queueing discipline in this implementation.
    pub fn push_background_task(&self, job_id: u64, sync: Arc<JobSynchronizer>, f: TaskFn) {
        self.push_task(job_id, sync, f);
    }

    /// Queued for the embedding application's own thread; only drained by
    /// [`work_on_main_thread`](Self::work_on_main_thread) /
    /// [`work_on_main_thread_no_block`](Self::work_on_main_thread_no_block).
    pub fn push_main_thread_task(&self, job_id: u64, sync: Arc<JobSynchronizer>, f: TaskFn) {
        self.register(job_id, sync, 1);
        self.main_queue.push(Task { job_id, run: f });
    }

    /// Drains the main-thread queue once, running whatever is queued right
    /// now, then returns without blocking.
    pub fn work_on_main_thread_no_block(&self) {
        while let Some(task) = self.main_queue.pop_own() {
            self.run_task(task);
        }
    }

    /// Drains the main-thread queue, blocking for more work until the pool
    /// is shut down.
    pub fn work_on_main_thread(&self) {
        loop {
            if let Some(task) = self.main_queue.pop_own() {
                self.run_task(task);
                continue;
            }
            if !self.main_queue.wait_for_work() {
                break;
            }
        }
    }

    /// Work-donating wait used by [`Job::wait`](super::job::Job::wait): runs
    /// this job's own queued tasks from any queue until its counter reaches
    /// zero, instead of blocking idle (§4.5).
    pub(crate) fn donate_until_done(&self, job_id: u64, sync: &JobSynchronizer) {
        while sync.remaining() > 0 {
            if let Some(task) = self.take_task_for_job(job_id) {
                self.run_task(task);
                continue;
            }
            std::thread::sleep(Duration::from_micros(100));
        }
    }

    fn take_task_for_job(&self, job_id: u64) -> Option<Task> {
        for q in self.queues.iter().chain(std::iter::once(&self.companion_queue)) {
            if let Some(task) = q.try_steal() {
                if task.job_id == job_id {
                    return Some(task);
                }
                // belongs to someone else; put it back rather than drop it.
                q.push(task);
            }
        }
        None
    }

    /// Number of regular queues currently hinted empty -- the "available
    /// parallelism" probe `parallel_for` consults (§4.7).
    pub fn free_queue_count(&self) -> usize {
        self.queues.iter().filter(|q| q.maybe_empty()).count()
    }

    /// §4.5: stop every queue, wake all workers, join, then drop whatever
    /// remained queued.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
        for q in &self.queues {
            q.stop();
        }
        self.companion_queue.stop();
        self.main_queue.stop();

        let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        for handle in threads.drain(..) {
            let _ = handle.join();
        }

        for q in &self.queues {
            q.drain();
        }
        self.companion_queue.drain();
        self.main_queue.drain();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn pushed_tasks_all_run_exactly_once() {
        let pool = WorkerPool::new(4, 1);
        let sync = Arc::new(JobSynchronizer::new());
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..50 {
            let counter = counter.clone();
            pool.push_task(1, sync.clone(), Box::new(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            }));
        }

        while sync.remaining() > 0 {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counter.load(Ordering::Relaxed), 50);
        pool.shutdown();
    }

    #[test]
    fn io_tasks_run_on_the_companion_queue() {
        let pool = WorkerPool::new(2, 1);
        let sync = Arc::new(JobSynchronizer::new());
        let (tx, rx) = std::sync::mpsc::channel();
        pool.push_io_task(1, sync.clone(), Box::new(move || tx.send(()).unwrap()));
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        pool.shutdown();
    }

    #[test]
    fn work_on_main_thread_no_block_drains_without_blocking() {
        let pool = WorkerPool::new(1, 0);
        let sync = Arc::new(JobSynchronizer::new());
        let ran = Arc::new(AtomicUsize::new(0));
        let r2 = ran.clone();
        pool.push_main_thread_task(1, sync, Box::new(move || {
            r2.fetch_add(1, Ordering::Relaxed);
        }));
        pool.work_on_main_thread_no_block();
        assert_eq!(ran.load(Ordering::Relaxed), 1);
        pool.shutdown();
    }
}

