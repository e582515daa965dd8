//! C1: concurrency primitives shared by the worker pool, the dispatcher, and
//! the delegate queue. Thin wrappers over `std::sync` plus `crossbeam-channel`
//! queues, kept deliberately small -- the scheduler builds its own queueing
//! discipline on top of these rather than hiding it behind them.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::error::{Error, Result};

/// An "auto-lock": the lock is acquired in `with`/`lock` and released when
/// the returned guard drops, mirroring the teacher's RAII lock wrappers. This
/// type exists mainly to convert lock poisoning into [`Error::Poisoned`]
/// instead of panicking, per §4.10/§7.
pub struct Lock<T> {
    inner: Mutex<T>,
}

impl<T> Lock<T> {
    pub fn new(value: T) -> Self {
        Lock { inner: Mutex::new(value) }
    }

    /// Acquires the lock, converting poison into [`Error::Poisoned`] rather
    /// than propagating the panic as `std::sync::Mutex` does by default.
    pub fn lock(&self, what: &'static str) -> Result<MutexGuard<'_, T>> {
        self.inner.lock().map_err(|_| Error::Poisoned { what })
    }

    /// Convenience for call sites that treat poisoning as "recover the data
    /// anyway" (the teacher's allocators do this throughout, since a
    /// panicking holder mid-bump-allocation still leaves the bytes intact).
    pub fn lock_recover(&self, _err: PoisonError<MutexGuard<'_, T>>) -> MutexGuard<'_, T> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A condition variable paired with the predicate it guards, matching the
/// queue/dispatcher pattern of "lock, check predicate, wait, recheck" (§4.5,
/// §4.6, §5 suspension points).
pub struct CondGate {
    mutex: Mutex<bool>,
    cv: Condvar,
}

impl CondGate {
    pub fn new() -> Self {
        CondGate { mutex: Mutex::new(false), cv: Condvar::new() }
    }

    /// Sets the gate open and wakes exactly one waiter.
    pub fn signal_one(&self) {
        let mut guard = self.mutex.lock().unwrap_or_else(|e| e.into_inner());
        *guard = true;
        self.cv.notify_one();
    }

    /// Sets the gate open and wakes every waiter (used for shutdown: §4.5
    /// "broadcast condvars").
    pub fn signal_all(&self) {
        let mut guard = self.mutex.lock().unwrap_or_else(|e| e.into_inner());
        *guard = true;
        self.cv.notify_all();
    }

    /// Blocks until the gate is open, then closes it again and returns. A
    /// finite timeout keeps shutdown always progressing (§5: "`TaskQueue::wait`
    /// uses finite-horizon condvar wait").
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.mutex.lock().unwrap_or_else(|e| e.into_inner());
        let (mut guard, _result) =
            self.cv.wait_timeout_while(guard, timeout, |open| !*open).unwrap_or_else(|e| e.into_inner());
        let was_open = *guard;
        *guard = false;
        was_open
    }
}

impl Default for CondGate {
    fn default() -> Self {
        Self::new()
    }
}

/// A bounded single-producer/single-consumer queue.
pub fn spsc<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    bounded(capacity)
}

/// An unbounded multi-producer/single-consumer queue (the defer-free queue in
/// L7, the dispatcher's rearm inbox in C3, and the delegate queue in C4 all
/// use this shape even though only one side is actually multi; `crossbeam`
/// does not distinguish MPSC from MPMC at the type level).
pub fn mpsc<T>() -> (Sender<T>, Receiver<T>) {
    unbounded()
}

/// A multi-producer/multi-consumer queue (worker task queues before the
/// per-queue deque wrapper is layered on top in C2).
pub fn mpmc<T>(capacity: Option<usize>) -> (Sender<T>, Receiver<T>) {
    match capacity {
        Some(n) => bounded(n),
        None => unbounded(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn lock_recovers_from_a_poisoned_guard_instead_of_propagating_panic() {
        let lock = Arc::new(Lock::new(0));
        let l2 = lock.clone();
        let _ = thread::spawn(move || {
            let _guard = l2.inner.lock().unwrap();
            panic!("poison it");
        })
        .join();

        let err = lock.lock("test counter").unwrap_err();
        assert!(matches!(err, Error::Poisoned { .. }));
    }

    #[test]
    fn cond_gate_wakes_a_waiter() {
        let gate = Arc::new(CondGate::new());
        let g2 = gate.clone();
        let handle = thread::spawn(move || g2.wait_timeout(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        gate.signal_one();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn cond_gate_wait_times_out_without_a_signal() {
        let gate = CondGate::new();
        assert!(!gate.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn mpsc_delivers_in_order() {
        let (tx, rx) = mpsc();
        for i in 0..10 {
            tx.send(i).unwrap();
        }
        drop(tx);
        let received: Vec<_> = rx.iter().collect();
        assert_eq!(received, (0..10).collect::<Vec<_>>());
    }
}
