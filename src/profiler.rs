//! X1: a per-thread ring of profiling samples, emitted as a `serde_json`
//! array of trace events (§3a, §6's "Persistent formats").

use std::cell::RefCell;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::platform::{self, Clock};
use crate::tag::MemoryTag;

/// One recorded span: a named interval, tagged, timestamped against the
/// process-wide clock (§3a: "Profiler trace event").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub name: String,
    pub tag: MemoryTag,
    pub thread_id: u16,
    pub start_us: u64,
    pub duration_us: u64,
}

struct Ring {
    events: Vec<TraceEvent>,
    capacity: usize,
}

impl Ring {
    fn push(&mut self, event: TraceEvent) {
        if self.events.len() == self.capacity {
            self.events.remove(0);
        }
        self.events.push(event);
    }
}

thread_local! {
    static LOCAL_RING: RefCell<Option<Ring>> = const { RefCell::new(None) };
}

/// Collects samples recorded on any thread that has called [`Profiler::scope`]
/// or [`Profiler::record`], and emits them as one JSON array (§3a).
pub struct Profiler {
    clock: Clock,
    capacity: usize,
    enabled: Mutex<bool>,
    drained: Mutex<Vec<TraceEvent>>,
}

impl Profiler {
    pub fn new(per_thread_capacity: usize) -> Self {
        Profiler {
            clock: Clock::new(),
            capacity: per_thread_capacity.max(1),
            enabled: Mutex::new(true),
            drained: Mutex::new(Vec::new()),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        *self.enabled.lock().unwrap_or_else(|e| e.into_inner()) = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records one completed span on the calling thread's ring.
    pub fn record(&self, name: impl Into<String>, tag: MemoryTag, start_us: u64, duration_us: u64) {
        if !self.is_enabled() {
            return;
        }
        let event = TraceEvent { name: name.into(), tag, thread_id: platform::thread_id(), start_us, duration_us };
        let capacity = self.capacity;
        LOCAL_RING.with(|cell| {
            let mut ring = cell.borrow_mut();
            let ring = ring.get_or_insert_with(|| Ring { events: Vec::new(), capacity });
            ring.push(event);
        });
    }

    /// Times `f` against this profiler's clock and records it under `name`/`tag`.
    pub fn scope<R>(&self, name: impl Into<String>, tag: MemoryTag, f: impl FnOnce() -> R) -> R {
        if !self.is_enabled() {
            return f();
        }
        let start = self.clock.now_us();
        let result = f();
        let duration = self.clock.now_us().saturating_sub(start);
        self.record(name, tag, start, duration);
        result
    }

    /// Moves the calling thread's ring into the shared drained buffer, for
    /// later inclusion in [`Profiler::emit_json`]. Threads that exit without
    /// calling this lose their still-local samples, matching a per-thread
    /// ring that nobody else can reach.
    pub fn drain_local(&self) {
        let local = LOCAL_RING.with(|cell| cell.borrow_mut().take());
        if let Some(ring) = local {
            self.drained.lock().unwrap_or_else(|e| e.into_inner()).extend(ring.events);
        }
    }

    /// Serializes every drained event (via [`drain_local`](Self::drain_local))
    /// as a JSON array of trace events.
    pub fn emit_json(&self) -> serde_json::Result<String> {
        let events = self.drained.lock().unwrap_or_else(|e| e.into_inner());
        serde_json::to_string(&*events)
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_records_one_event_on_the_calling_threads_ring() {
        let profiler = Profiler::new(16);
        profiler.scope("work", MemoryTag::Core, || {
            std::thread::sleep(std::time::Duration::from_micros(50));
        });
        profiler.drain_local();
        let json = profiler.emit_json().unwrap();
        assert!(json.contains("\"name\":\"work\""));
    }

    #[test]
    fn disabled_profiler_records_nothing() {
        let profiler = Profiler::new(16);
        profiler.set_enabled(false);
        profiler.scope("work", MemoryTag::Core, || {});
        profiler.drain_local();
        assert_eq!(profiler.emit_json().unwrap(), "[]");
    }

    #[test]
    fn ring_drops_oldest_sample_past_capacity() {
        let profiler = Profiler::new(2);
        for i in 0..5 {
            profiler.record(format!("e{i}"), MemoryTag::Core, 0, 1);
        }
        profiler.drain_local();
        let json = profiler.emit_json().unwrap();
        assert!(json.contains("\"e3\""));
        assert!(json.contains("\"e4\""));
        assert!(!json.contains("\"e0\""));
    }
}
