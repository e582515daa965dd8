//! Tiered memory, a work-stealing job scheduler, and a deterministic
//! node-graph execution engine.
//!
//! Modules are layered bottom-up (§9): `tracker` (L2) sits under every
//! allocator in `memory` (L3-L7); `sync` (C1) sits under `jobs` (C2-C4);
//! `jobs` sits under `graph` (G1). `tweakables` and `profiler` hook into
//! `jobs` and `sync` without being depended on by anything below them.

pub mod error;
pub mod fixed;
pub mod graph;
pub mod jobs;
pub mod memory;
pub mod platform;
pub mod profiler;
pub mod sync;
pub mod tag;
pub mod tracker;
pub mod tweakables;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::sync::Arc;

use jobs::JobScheduler;
use memory::global_pool::GlobalPool;
use profiler::Profiler;
use tweakables::Tweakables;

/// Default number of worker queues handed to the lazily-initialized
/// scheduler when the caller doesn't build their own via [`Runtime::build`].
const DEFAULT_QUEUES: usize = 4;
const DEFAULT_COMPANIONS: usize = 1;
const DEFAULT_SMALL_BLOCK: usize = 4096;
const DEFAULT_REGION_STEP: usize = 1 << 20;
const DEFAULT_PROFILER_CAPACITY: usize = 1024;

/// Process-wide singletons, initialized lazily in dependency order (tracker
/// -> global pool -> scheduler -> dispatcher -> profiler -> tweakables) the
/// first time [`Runtime::get`] is called, and torn down in reverse by
/// [`Runtime::shutdown`] (§9).
pub struct Runtime {
    pub global_pool: GlobalPool,
    pub scheduler: Arc<JobScheduler>,
    pub profiler: Profiler,
    pub tweakables: Tweakables,
    shut_down: AtomicBool,
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

impl Runtime {
    /// The process-wide runtime. `tracker::Tracker::global()` is reached
    /// independently by every allocator layer and needs no handle here.
    pub fn get() -> &'static Runtime {
        RUNTIME.get_or_init(|| {
            let _ = tracker::Tracker::global();
            Runtime {
                global_pool: GlobalPool::new(DEFAULT_REGION_STEP, DEFAULT_SMALL_BLOCK),
                scheduler: JobScheduler::new(DEFAULT_QUEUES, DEFAULT_COMPANIONS),
                profiler: Profiler::new(DEFAULT_PROFILER_CAPACITY),
                tweakables: Tweakables::new(),
                shut_down: AtomicBool::new(false),
            }
        })
    }

    /// Tears the runtime down in reverse dependency order: scheduler first
    /// (so no task can touch the pools after), then the tracker is told it's
    /// in late-teardown so any remaining frees don't flag as leaks. Safe to
    /// call more than once; only the first call does anything.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.scheduler.shutdown();
        tracker::Tracker::global().set_lifecycle_ignoring_leaks(true);
    }
}
