//! Per-worker task queue: a mutex+condvar-guarded deque, stoppable to force
//! its worker to exit (§4.5).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use super::job::TaskFn;

/// A single queued unit of work: the job it belongs to (so `Job::wait` can
/// filter by job) plus the closure to run.
pub struct Task {
    pub job_id: u64,
    pub run: TaskFn,
}

struct Inner {
    deque: VecDeque<Task>,
    /// Cleared on shutdown so a blocked worker wakes and exits (§4.5).
    is_running: bool,
    /// Set by the most recent probe; lets the dispatcher/pusher skip queues
    /// it already knows are empty (§4.5: "maybe-empty hints").
    maybe_empty: bool,
}

pub struct TaskQueue {
    inner: Mutex<Inner>,
    cv: Condvar,
}

/// How long a worker's blocking wait sits before re-checking shutdown state.
/// Finite so shutdown always progresses (§5).
const WAIT_QUANTUM: Duration = Duration::from_millis(50);

impl TaskQueue {
    pub fn new() -> Self {
        TaskQueue {
            inner: Mutex::new(Inner { deque: VecDeque::new(), is_running: true, maybe_empty: true }),
            cv: Condvar::new(),
        }
    }

    /// Appends to the front (owner pops from the front; stealers pop from
    /// the back, §4.5's FIFO-owner/LIFO-stealer split) and signals if the
    /// queue was empty.
    pub fn push(&self, task: Task) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let was_empty = inner.deque.is_empty();
        inner.deque.push_front(task);
        inner.maybe_empty = false;
        if was_empty {
            self.cv.notify_one();
        }
    }

    /// The owning worker's pop: front of the deque.
    pub fn pop_own(&self) -> Option<Task> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let task = inner.deque.pop_front();
        inner.maybe_empty = inner.deque.is_empty();
        task
    }

    /// A stealer's pop: back of the deque, via try-lock only (§4.5: "try-lock
    /// -> pop from the back; give up on failure").
    pub fn try_steal(&self) -> Option<Task> {
        let mut inner = self.inner.try_lock().ok()?;
        let task = inner.deque.pop_back();
        inner.maybe_empty = inner.deque.is_empty();
        task
    }

    pub fn maybe_empty(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).maybe_empty
    }

    /// Blocks the owning worker until a task is available or the queue is
    /// stopped, using a finite wait quantum so shutdown is always observed
    /// promptly (§5).
    pub fn wait_for_work(&self) -> bool {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = self
            .cv
            .wait_timeout_while(guard, WAIT_QUANTUM, |inner| inner.is_running && inner.deque.is_empty())
            .unwrap_or_else(|e| e.into_inner());
        guard.is_running
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).is_running
    }

    /// Stops the queue and wakes its worker (§4.5: "set is_running=false on
    /// every queue; broadcast condvars").
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.is_running = false;
        self.cv.notify_all();
    }

    /// Drains whatever remains after shutdown, running nothing -- just
    /// dropping tasks (§4.5: "drain remaining tasks").
    pub fn drain(&self) -> Vec<Task> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.deque.drain(..).collect()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide marker for "no job" (used by standalone tasks pushed
/// without a `Job`, e.g. `push_task`'s fire-and-forget form).
pub static NO_JOB: AtomicBool = AtomicBool::new(false);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn push_then_pop_own_preserves_fifo_for_the_owner() {
        let q = TaskQueue::new();
        q.push(Task { job_id: 1, run: Box::new(|| {}) });
        q.push(Task { job_id: 2, run: Box::new(|| {}) });
        assert_eq!(q.pop_own().unwrap().job_id, 1);
        assert_eq!(q.pop_own().unwrap().job_id, 2);
        assert!(q.pop_own().is_none());
    }

    #[test]
    fn steal_takes_from_the_back() {
        let q = TaskQueue::new();
        q.push(Task { job_id: 1, run: Box::new(|| {}) });
        q.push(Task { job_id: 2, run: Box::new(|| {}) });
        // front is job 2 (most recently pushed); steal should take job 1.
        assert_eq!(q.try_steal().unwrap().job_id, 1);
    }

    #[test]
    fn stop_wakes_a_blocked_waiter() {
        let q = Arc::new(TaskQueue::new());
        let q2 = q.clone();
        let handle = std::thread::spawn(move || q2.wait_for_work());
        std::thread::sleep(Duration::from_millis(20));
        q.stop();
        assert!(!handle.join().unwrap());
    }
}
