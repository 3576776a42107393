//! A general-purpose, non-blocking compute thread pool.
//!
//! Each worker owns a fixed-capacity [work-stealing deque](deque::TaskDeque):
//! it pushes and pops its own work lock-free from the front, while idle
//! workers steal from the back of someone else's. Idle workers that find
//! nothing to steal park on a [non-blocking condition](nbc::NonblockingCondition)
//! rather than spinning forever or taking a lock on every empty poll.
//!
//! ```no_run
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use compute_pool::make_pool;
//!
//! let pool = make_pool("demo", 4).expect("failed to start pool");
//! pool.dispatch(|| println!("ran on a worker thread"));
//!
//! let total = AtomicU32::new(0);
//! pool.parallel_for(1000, |i, _n| {
//!     total.fetch_add(i as u32, Ordering::Relaxed);
//! });
//! println!("sum: {}", total.load(Ordering::Relaxed));
//!
//! pool.shutdown();
//! ```

mod atomics;
mod context;
mod deque;
mod error;
mod nbc;
mod rng;
mod scheduler;

pub use context::{current_worker_context, WorkerContext};
pub use error::PoolBuildError;
pub use scheduler::{make_pool, PanicObserver, Pool, PoolActivity, PoolBuilder};
