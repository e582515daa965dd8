//! C3: the timed dispatcher. A single high-priority thread owns the active
//! set of timed jobs and rearms them through an MPSC inbox rather than
//! mutating jobs in place (§4.6).

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::platform::Clock;
use crate::sync::CondGate;

use super::job::TaskFn;
use super::worker_pool::WorkerPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimedJobState {
    Inactive,
    Active,
    Stopping,
}

/// Options for a periodic timed job (§6: `periodic(...)`).
#[derive(Debug, Clone, Copy)]
pub struct PeriodicOptions {
    /// Microseconds between fires.
    pub interval_us: u64,
    /// How many missed intervals are tolerated before the schedule resets
    /// to `now + period` instead of catching up one interval at a time.
    pub max_intervals_late: u32,
    /// If nonzero, the firing task sleeps/spins within the worker until the
    /// exact scheduled time is reached (§4.6: "pre_start_hint").
    pub pre_start_hint_us: u64,
    /// Route fires through the main-thread queue instead of the pool.
    pub on_main_thread: bool,
}

impl Default for PeriodicOptions {
    fn default() -> Self {
        PeriodicOptions { interval_us: 0, max_intervals_late: 4, pre_start_hint_us: 0, on_main_thread: false }
    }
}

struct Shared {
    next_fire_us: AtomicI64,
    period_us: u64,
    pre_start_hint_us: u64,
    max_intervals_late: u32,
    on_main_thread: bool,
    tasks_in_progress: AtomicI64,
    state: Mutex<TimedJobState>,
    id: u64,
}

/// A handle to a job scheduled on the [`Dispatcher`] (§3: "Timed job").
pub struct TimedJob {
    shared: Arc<Shared>,
    inbox: Sender<DispatcherMsg>,
}

impl TimedJob {
    pub fn cancel(&self) {
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = if self.shared.tasks_in_progress.load(Ordering::Acquire) > 0 {
            TimedJobState::Stopping
        } else {
            TimedJobState::Inactive
        };
    }

    /// Polls under the job's own state until `tasks_in_progress` drains to
    /// zero (§4.6).
    pub fn wait_until_done(&self) {
        while self.shared.tasks_in_progress.load(Ordering::Acquire) > 0 {
            std::thread::sleep(Duration::from_micros(200));
        }
    }

    /// Enqueues an immediate rearm regardless of the current schedule.
    pub fn reschedule_immediately(&self, clock: &Clock) {
        self.shared.next_fire_us.store(clock.now_us() as i64, Ordering::Release);
        let _ = self.inbox.send(DispatcherMsg::Rearm(self.shared.clone()));
    }

    pub fn state(&self) -> TimedJobState {
        *self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

enum DispatcherMsg {
    Rearm(Arc<Shared>),
    Shutdown,
}

static NEXT_TIMED_JOB_ID: AtomicU64 = AtomicU64::new(1);

struct ActiveEntry {
    shared: Arc<Shared>,
    task: Box<dyn Fn() -> TaskFn + Send + Sync>,
}

/// The single dispatcher thread (§4.6). Owns the active set; rearms arrive
/// over an MPSC inbox so the loop never mutates a job shared with another
/// thread in place.
pub struct Dispatcher {
    inbox_tx: Sender<DispatcherMsg>,
    wake: Arc<CondGate>,
    handle: Mutex<Option<JoinHandle<()>>>,
    clock: Clock,
}

impl Dispatcher {
    pub fn new(pool: Arc<WorkerPool>) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = unbounded();
        let wake = Arc::new(CondGate::new());
        let clock = Clock::new();

        let dispatcher = Arc::new(Dispatcher { inbox_tx, wake: wake.clone(), handle: Mutex::new(None), clock });

        let loop_clock = dispatcher.clock;
        let handle = std::thread::spawn(move || dispatcher_loop(pool, inbox_rx, wake, loop_clock));
        *dispatcher.handle.lock().unwrap() = Some(handle);
        dispatcher
    }

    /// Schedules `f` to run once after `delay_us` microseconds (§6:
    /// `one_shot`).
    pub fn one_shot(&self, delay_us: u64, f: impl Fn() + Send + Sync + 'static) -> TimedJob {
        self.schedule(delay_us, PeriodicOptions { interval_us: 0, ..Default::default() }, f)
    }

    /// Schedules `f` to run every `opts.interval_us` microseconds (§6:
    /// `periodic`).
    pub fn periodic(&self, first_delay_us: u64, opts: PeriodicOptions, f: impl Fn() + Send + Sync + 'static) -> TimedJob {
        self.schedule(first_delay_us, opts, f)
    }

    fn schedule(&self, first_delay_us: u64, opts: PeriodicOptions, f: impl Fn() + Send + Sync + 'static) -> TimedJob {
        let id = NEXT_TIMED_JOB_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(Shared {
            next_fire_us: AtomicI64::new(self.clock.now_us() as i64 + first_delay_us as i64),
            period_us: opts.interval_us,
            pre_start_hint_us: opts.pre_start_hint_us,
            max_intervals_late: opts.max_intervals_late,
            on_main_thread: opts.on_main_thread,
            tasks_in_progress: AtomicI64::new(0),
            state: Mutex::new(TimedJobState::Active),
            id,
        });

        let f = Arc::new(f);
        let entry = ActiveEntry {
            shared: shared.clone(),
            task: Box::new(move || {
                let f = f.clone();
                Box::new(move || (*f)()) as TaskFn
            }),
        };
        register_task(id, entry);
        let _ = self.inbox_tx.send(DispatcherMsg::Rearm(shared.clone()));
        self.wake.signal_one();

        TimedJob { shared, inbox: self.inbox_tx.clone() }
    }

    pub fn shutdown(&self) {
        let _ = self.inbox_tx.send(DispatcherMsg::Shutdown);
        self.wake.signal_all();
        if let Some(handle) = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = handle.join();
        }
    }
}

// Tasks are registered in a process-wide side table keyed by timed-job id
// rather than threaded through the MPSC message, since `Shared` must stay
// `Send + Sync` without requiring the closure itself to travel through the
// channel on every rearm.
fn task_table() -> &'static Mutex<std::collections::HashMap<u64, ActiveEntry>> {
    static TABLE: std::sync::OnceLock<Mutex<std::collections::HashMap<u64, ActiveEntry>>> = std::sync::OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(std::collections::HashMap::new()))
}

fn register_task(id: u64, entry: ActiveEntry) {
    task_table().lock().unwrap_or_else(|e| e.into_inner()).insert(id, entry);
}

fn dispatcher_loop(pool: Arc<WorkerPool>, inbox: Receiver<DispatcherMsg>, wake: Arc<CondGate>, clock: Clock) {
    let mut active: Vec<u64> = Vec::new();
    let shutting_down = AtomicBool::new(false);

    loop {
        // drain the inbox without blocking.
        loop {
            match inbox.try_recv() {
                Ok(DispatcherMsg::Rearm(shared)) => {
                    if !active.contains(&shared.id) {
                        active.push(shared.id);
                    }
                }
                Ok(DispatcherMsg::Shutdown) => shutting_down.store(true, Ordering::Relaxed),
                Err(_) => break,
            }
        }
        if shutting_down.load(Ordering::Relaxed) && active.is_empty() {
            return;
        }

        let now = clock.now_us() as i64;
        let mut min_remaining = i64::MAX;
        let mut fired = Vec::new();

        let table = task_table();
        active.retain(|id| {
            let guard = table.lock().unwrap_or_else(|e| e.into_inner());
            let Some(entry) = guard.get(id) else { return false };
            let shared = &entry.shared;
            if *shared.state.lock().unwrap_or_else(|e| e.into_inner()) == TimedJobState::Stopping {
                return false;
            }
            let time_left = shared.next_fire_us.load(Ordering::Acquire) - now;
            if time_left <= 0 {
                fired.push(*id);
                false
            } else {
                min_remaining = min_remaining.min(time_left);
                true
            }
        });

        for id in fired {
            fire_and_maybe_rearm(id, &pool, now, &mut active);
        }

        if shutting_down.load(Ordering::Relaxed) && active.is_empty() {
            return;
        }

        let sleep_for = if min_remaining == i64::MAX { Duration::from_millis(50) } else { Duration::from_micros(min_remaining.max(0) as u64) };
        wake.wait_timeout(sleep_for.min(Duration::from_millis(50)));
    }
}

fn fire_and_maybe_rearm(id: u64, pool: &Arc<WorkerPool>, now: i64, active: &mut Vec<u64>) {
    let table = task_table();
    let (shared, task_fn) = {
        let guard = table.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = guard.get(&id) else { return };
        (entry.shared.clone(), (entry.task)())
    };

    shared.tasks_in_progress.fetch_add(1, Ordering::AcqRel);
    let pre_start_hint_us = shared.pre_start_hint_us;
    let shared_for_task = shared.clone();
    let wrapped: TaskFn = Box::new(move || {
        if pre_start_hint_us > 0 {
            crate::platform::sleep_usec(pre_start_hint_us);
        }
        task_fn();
        shared_for_task.tasks_in_progress.fetch_sub(1, Ordering::AcqRel);
    });

    let (job_id, job_sync) = super::job::ad_hoc_job();
    if shared.on_main_thread {
        pool.push_main_thread_task(job_id, job_sync, wrapped);
    } else {
        pool.push_task(job_id, job_sync, wrapped);
    }

    if shared.period_us > 0 {
        advance_schedule(&shared, now);
        active.push(id);
    } else {
        let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = TimedJobState::Inactive;
    }
}

/// §4.6: advance by one period; if that leaves the job more than
/// `max_intervals_late * period` behind, reset relative to `now` instead of
/// trying to catch up one interval at a time.
fn advance_schedule(shared: &Shared, now: i64) {
    let period = shared.period_us as i64;
    let mut next = shared.next_fire_us.load(Ordering::Acquire) + period;
    let max_late = period * shared.max_intervals_late as i64;
    if now - next > max_late {
        next = now + period - shared.pre_start_hint_us as i64;
    }
    shared.next_fire_us.store(next, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn one_shot_fires_once() {
        let pool = WorkerPool::new(2, 1);
        let dispatcher = Dispatcher::new(pool.clone());
        let count = Arc::new(AtomicUsize::new(0));
        let c2 = count.clone();
        let job = dispatcher.one_shot(1_000, move || {
            c2.fetch_add(1, Ordering::Relaxed);
        });
        job.wait_until_done();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::Relaxed), 1);
        dispatcher.shutdown();
        pool.shutdown();
    }

    #[test]
    fn periodic_fires_more_than_once() {
        let pool = WorkerPool::new(2, 1);
        let dispatcher = Dispatcher::new(pool.clone());
        let count = Arc::new(AtomicUsize::new(0));
        let c2 = count.clone();
        let job = dispatcher.periodic(0, PeriodicOptions { interval_us: 5_000, ..Default::default() }, move || {
            c2.fetch_add(1, Ordering::Relaxed);
        });
        std::thread::sleep(Duration::from_millis(60));
        job.cancel();
        assert!(count.load(Ordering::Relaxed) >= 2, "expected multiple periodic fires, got {}", count.load(Ordering::Relaxed));
        dispatcher.shutdown();
        pool.shutdown();
    }
}
