//! Thread-local worker identity.
//!
//! Every pool worker thread binds itself into a thread-local slot for the
//! lifetime of its run loop, the same way the scheduler this crate is
//! descended from tags each OS thread with the logical core it's pinned
//! to. `dispatch`/`join` read this slot to decide whether the calling
//! thread is itself a worker of the target pool (push to its own deque's
//! front) or an outside caller (push to a random worker's back).

use std::cell::RefCell;
use std::sync::{Arc, Weak};

use crate::scheduler::PoolInner;

thread_local! {
    static WORKER_CONTEXT: RefCell<Option<(Weak<PoolInner>, usize)>> = const { RefCell::new(None) };
}

pub(crate) fn bind(pool: &Arc<PoolInner>, worker_id: usize) {
    WORKER_CONTEXT.with(|cell| *cell.borrow_mut() = Some((Arc::downgrade(pool), worker_id)));
}

pub(crate) fn unbind() {
    WORKER_CONTEXT.with(|cell| *cell.borrow_mut() = None);
}

/// If the calling thread is a worker of `pool`, its worker id.
pub(crate) fn local_worker_id_for(pool: &Arc<PoolInner>) -> Option<usize> {
    WORKER_CONTEXT.with(|cell| {
        cell.borrow().as_ref().and_then(|(weak, id)| {
            weak.upgrade()
                .filter(|owner| Arc::ptr_eq(owner, pool))
                .map(|_| *id)
        })
    })
}

/// Identifies the pool worker thread a task is currently running on, if
/// any. Mostly useful for logging and assertions from within task bodies;
/// `dispatch`/`join` route around it via [`local_worker_id_for`] so they
/// can also compare against a specific pool instance.
#[derive(Debug, Clone, Copy)]
pub struct WorkerContext {
    pub worker_id: usize,
}

pub fn current_worker_context() -> Option<WorkerContext> {
    WORKER_CONTEXT.with(|cell| {
        cell.borrow()
            .as_ref()
            .filter(|(weak, _)| weak.strong_count() > 0)
            .map(|(_, id)| WorkerContext { worker_id: *id })
    })
}
