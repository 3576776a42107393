//! Error types for pool construction.
//!
//! The rest of the crate treats a task panic as a recoverable, observed
//! event rather than an `Err` (see [`crate::PanicObserver`]); the only
//! fallible operation left is actually standing the pool up, since spawning
//! an OS thread can fail.

use std::fmt;

#[derive(Debug)]
pub enum PoolBuildError {
    /// A pool was built with a thread count of zero.
    ZeroThreads,
    /// `std::thread::Builder::spawn` failed partway through bringing the
    /// pool's workers up. Any threads already started are stopped and
    /// joined before this is returned, so a caller never observes a
    /// half-started pool.
    ThreadSpawn(std::io::Error),
}

impl fmt::Display for PoolBuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroThreads => write!(f, "a thread pool requires at least one worker thread"),
            Self::ThreadSpawn(e) => write!(f, "failed to spawn pool worker thread: {e}"),
        }
    }
}

impl std::error::Error for PoolBuildError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ZeroThreads => None,
            Self::ThreadSpawn(e) => Some(e),
        }
    }
}
