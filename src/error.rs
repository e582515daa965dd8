//! Crate-wide error kinds (§7). Allocators below the safe facades speak in
//! sentinels and sticky flags; everything above them returns [`Result`].

use std::fmt;

/// Crate-wide result alias.
pub type Result<T> = core::result::Result<T, Error>;

/// Error kinds surfaced by the safe facades (`JobScheduler`, `NodeHierarchy`,
/// `Tweakables`, ...). The lower allocator layers use sentinel returns
/// instead (see `memory::monotonic`, `memory::tlsf`) and never construct
/// this type on their hot paths.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("out of memory")]
    OutOfMemory,

    #[error("capacity exceeded: {what}")]
    CapacityExceeded { what: &'static str },

    #[error("invalid state: {what}")]
    InvalidState { what: &'static str },

    #[error("not found: {key}")]
    NotFound { key: String },

    #[error("invalid argument: {what}")]
    InvalidArgument { what: &'static str },

    #[error("a lock was poisoned by a panicking holder: {what}")]
    Poisoned { what: &'static str },
}

impl Error {
    pub fn invalid_argument(what: &'static str) -> Self {
        Error::InvalidArgument { what }
    }

    pub fn invalid_state(what: &'static str) -> Self {
        Error::InvalidState { what }
    }

    pub fn capacity_exceeded(what: &'static str) -> Self {
        Error::CapacityExceeded { what }
    }

    pub fn not_found(key: impl Into<String>) -> Self {
        Error::NotFound { key: key.into() }
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::Poisoned { what: "mutex or condvar" }
    }
}

/// The fatal-error path (§7): flush logging, then abort. Used by checked
/// builds when a tracked allocation's guard is found corrupted, or when an
/// invariant that the caller cannot recover from is violated.
pub fn fatal(msg: impl fmt::Display) -> ! {
    log::error!("fatal: {msg}");
    std::process::abort();
}

/// In checked (debug_assertions) builds, aborts with a diagnostic. In
/// release builds this is silent, matching §4.1's verify-failure semantics.
#[inline]
pub fn checked_assert(cond: bool, msg: &str) {
    if cfg!(debug_assertions) && !cond {
        fatal(msg);
    }
}
