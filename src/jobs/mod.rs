//! The work-stealing job scheduler (C1-C4): per-worker task queues with a
//! steal-from-back protocol, companion workers for long/IO tasks, a timed
//! dispatcher for one-shot and periodic jobs, and the `JobScheduler` facade
//! that ties them together (§4.5-§4.7).

pub mod delegate;
pub mod job;
pub mod scheduler;
pub mod task_queue;
pub mod timed;
pub mod worker_pool;

pub use job::Job;
pub use scheduler::JobScheduler;
pub use timed::{Dispatcher, PeriodicOptions, TimedJob, TimedJobState};
pub use worker_pool::WorkerPool;
