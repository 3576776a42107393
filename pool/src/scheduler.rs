//! The pool itself: worker threads, the dispatch/join/parallel_for surface,
//! and the run loop that ties the deque and the non-blocking condition
//! together.

use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::context::{self, local_worker_id_for};
use crate::deque::{TaskDeque, DEFAULT_CAPACITY};
use crate::error::PoolBuildError;
use crate::nbc::NonblockingCondition;
use crate::rng::{fast_fit, positive_coprimes, AtomicRng};

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

/// Called with the id of the worker a task panicked on (or `usize::MAX` if
/// the panic happened while a task was executed inline, e.g. on deque
/// overflow) and the panic payload. The default observer just logs the
/// panic and lets the worker keep running; install your own to route
/// failures elsewhere.
pub type PanicObserver = Arc<dyn Fn(usize, Box<dyn Any + Send>) + Send + Sync>;

#[derive(Debug, Clone)]
struct PoolConfig {
    name: String,
    thread_count: usize,
    deque_capacity: usize,
    grain_k: usize,
    spin_iters: usize,
}

struct WorkerHandle {
    deque: TaskDeque<Task>,
    rng: AtomicRng,
}

/// The pool's shared state. Workers, dispatchers, and joiners all hold an
/// `Arc<PoolInner>`; [`Pool`] is just this plus the join handles of the
/// threads it owns.
pub struct PoolInner {
    workers: Vec<WorkerHandle>,
    condition: NonblockingCondition,
    cancelled: AtomicBool,
    coprimes: Vec<u32>,
    tasks_pending: AtomicUsize,
    config: PoolConfig,
    observer: PanicObserver,
    fallback_rng: AtomicRng,
    overflow_warned: Vec<AtomicBool>,
    running_workers: AtomicUsize,
}

/// A cheap, cloneable handle onto a pool's live worker count, independent of
/// the owning [`Pool`] value's lifetime. Used by diagnostics and by tests
/// that need to observe the worker count drop to zero after `shutdown()`
/// has consumed the `Pool` itself.
#[derive(Clone)]
pub struct PoolActivity {
    inner: Arc<PoolInner>,
}

impl PoolActivity {
    /// Number of worker threads currently inside their run loop (i.e. not
    /// yet returned from `worker_loop`). Reaches `0` once `shutdown()`
    /// returns.
    pub fn running_workers(&self) -> usize {
        self.inner.running_workers.load(Ordering::Acquire)
    }
}

/// A running compute thread pool. Dropping it (or calling [`Pool::shutdown`]
/// explicitly) stops every worker after its current task finishes and
/// drains their join handles.
pub struct Pool {
    inner: Arc<PoolInner>,
    threads: Vec<JoinHandle<()>>,
    shutdown_done: bool,
}

/// Builds a [`Pool`] with non-default tuning. `PoolBuilder::new(name).build()`
/// alone gives you a pool sized to [`std::thread::available_parallelism`]
/// with all other defaults.
pub struct PoolBuilder {
    name: String,
    thread_count: usize,
    deque_capacity: usize,
    grain_k: usize,
    spin_iters: Option<usize>,
    observer: Option<PanicObserver>,
}

impl PoolBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            thread_count: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            deque_capacity: DEFAULT_CAPACITY,
            grain_k: 4,
            spin_iters: None,
            observer: None,
        }
    }

    pub fn thread_count(mut self, n: usize) -> Self {
        self.thread_count = n;
        self
    }

    pub fn deque_capacity(mut self, capacity: usize) -> Self {
        self.deque_capacity = capacity;
        self
    }

    /// Target number of leaf iterations per worker for `parallel_for`'s
    /// bisection; grain size is derived as `n / (thread_count * k)`.
    pub fn grain_k(mut self, k: usize) -> Self {
        self.grain_k = k.max(1);
        self
    }

    /// Iterations of bounded spin-then-steal a worker runs before it
    /// commits to parking. Defaults to `32 * thread_count`.
    pub fn spin_iters(mut self, iters: usize) -> Self {
        self.spin_iters = Some(iters);
        self
    }

    pub fn observer<F>(mut self, f: F) -> Self
    where
        F: Fn(usize, Box<dyn Any + Send>) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Result<Pool, PoolBuildError> {
        if self.thread_count == 0 {
            return Err(PoolBuildError::ZeroThreads);
        }

        let spin_iters = self.spin_iters.unwrap_or(32 * self.thread_count);
        let coprimes = positive_coprimes(self.thread_count as u32);
        let condition = NonblockingCondition::new(self.thread_count);
        let observer = self
            .observer
            .unwrap_or_else(|| Arc::new(default_observer) as PanicObserver);

        let workers: Vec<WorkerHandle> = (0..self.thread_count)
            .map(|i| WorkerHandle {
                deque: TaskDeque::new(self.deque_capacity),
                rng: AtomicRng::new(seed_for(&self.name, i)),
            })
            .collect();

        let config = PoolConfig {
            name: self.name.clone(),
            thread_count: self.thread_count,
            deque_capacity: self.deque_capacity,
            grain_k: self.grain_k,
            spin_iters,
        };

        let inner = Arc::new(PoolInner {
            workers,
            condition,
            cancelled: AtomicBool::new(false),
            coprimes,
            tasks_pending: AtomicUsize::new(0),
            observer,
            fallback_rng: AtomicRng::new(seed_for(&self.name, usize::MAX)),
            overflow_warned: (0..self.thread_count).map(|_| AtomicBool::new(false)).collect(),
            running_workers: AtomicUsize::new(0),
            config,
        });

        log::debug!(
            "pool \"{}\": starting {} worker thread(s), deque capacity {}",
            inner.config.name,
            inner.config.thread_count,
            inner.config.deque_capacity,
        );

        let mut threads = Vec::with_capacity(self.thread_count);
        for id in 0..self.thread_count {
            let thread_inner = Arc::clone(&inner);
            let thread_name = format!("{}-{}", inner.config.name, id);
            match std::thread::Builder::new()
                .name(thread_name)
                .spawn(move || worker_loop(thread_inner, id))
            {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    inner.cancelled.store(true, Ordering::SeqCst);
                    inner.condition.notify(true);
                    for t in threads {
                        let _ = t.join();
                    }
                    return Err(PoolBuildError::ThreadSpawn(e));
                }
            }
        }

        Ok(Pool {
            inner,
            threads,
            shutdown_done: false,
        })
    }
}

fn seed_for(name: &str, idx: usize) -> u64 {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    idx.hash(&mut hasher);
    hasher.finish()
}

fn default_observer(worker_id: usize, payload: Box<dyn Any + Send>) {
    log::error!("pool worker {worker_id} panicked: {}", panic_message(&payload));
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

/// Convenience constructor equivalent to
/// `PoolBuilder::new(name).thread_count(thread_count).build()`.
pub fn make_pool(name: impl Into<String>, thread_count: usize) -> Result<Pool, PoolBuildError> {
    PoolBuilder::new(name).thread_count(thread_count).build()
}

impl Pool {
    pub fn thread_count(&self) -> usize {
        self.inner.config.thread_count
    }

    /// A diagnostic handle that outlives this `Pool` value, useful for
    /// observing the worker count drop to zero across a `shutdown()` call
    /// that consumes `self`.
    pub fn activity(&self) -> PoolActivity {
        PoolActivity {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Fire-and-forget: enqueues `task` and returns immediately. If the
    /// calling thread is itself a worker of this pool, the task is pushed
    /// to the front of its own deque (cheap, cache-local, and stealable by
    /// others if this worker doesn't get to it first); otherwise it's
    /// pushed to the back of a randomly chosen worker's deque.
    pub fn dispatch(&self, task: impl FnOnce() + Send + 'static) {
        dispatch(&self.inner, Box::new(task));
    }

    /// Runs `a` on the calling thread while `b` is made available for any
    /// worker to steal; the calling thread itself participates in
    /// work-stealing while waiting for `b` to finish, so it never sits
    /// idle. Returns `a`'s result once both have completed.
    pub fn join<'scope, A, B, RA>(&self, a: A, b: B) -> RA
    where
        A: FnOnce() -> RA + Send + 'scope,
        B: FnOnce() + Send + 'scope,
        RA: Send,
    {
        join(&self.inner, a, b)
    }

    /// Recursively bisects `0..n` down to a grain size derived from the
    /// pool's thread count and `grain_k`, running leaves via `join` so the
    /// calling thread helps drain the work instead of blocking on it.
    /// `body(i, n)` is called once for every `i` in `0..n`, in no
    /// particular order, each from exactly one thread.
    pub fn parallel_for<F>(&self, n: usize, body: F)
    where
        F: Fn(usize, usize) + Send + Sync,
    {
        parallel_for(&self.inner, n, &body);
    }

    /// Stops accepting new internally-generated work, wakes every parked
    /// worker, and joins all worker threads. Consuming `self` by value
    /// means a second `shutdown()` call on the same pool is a compile
    /// error rather than a runtime one.
    pub fn shutdown(mut self) {
        self.shutdown_internal();
    }

    fn shutdown_internal(&mut self) {
        if self.shutdown_done {
            return;
        }
        assert!(
            local_worker_id_for(&self.inner).is_none(),
            "shutdown() must not be called from inside a task running on this pool"
        );
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.condition.notify(true);
        for t in self.threads.drain(..) {
            if t.join().is_err() {
                log::error!("pool \"{}\": a worker thread panicked during shutdown", self.inner.config.name);
            }
        }
        debug_assert!(
            self.inner.workers.iter().all(|w| w.deque.is_empty()),
            "pool \"{}\": worker deque still held a task after every worker exited",
            self.inner.config.name,
        );
        debug_assert_eq!(
            self.inner.running_workers.load(Ordering::Acquire),
            0,
            "pool \"{}\": a worker thread is still marked running after shutdown joined it",
            self.inner.config.name,
        );
        log::info!(
            "pool \"{}\": shutdown complete, {} task(s) still pending",
            self.inner.config.name,
            self.inner.tasks_pending.load(Ordering::Relaxed),
        );
        self.shutdown_done = true;
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shutdown_internal();
    }
}

fn warn_overflow(pool: &Arc<PoolInner>, worker_id: usize) {
    if !pool.overflow_warned[worker_id].swap(true, Ordering::Relaxed) {
        log::warn!(
            "pool \"{}\": worker {worker_id}'s deque is full; falling back to inline execution \
             (further overflows on this worker won't be logged)",
            pool.config.name,
        );
    }
}

fn push_own_or_random(pool: &Arc<PoolInner>, task: Task) {
    let (victim, overflowed) = match local_worker_id_for(pool) {
        Some(id) => match pool.workers[id].deque.push_front(task) {
            Ok(()) => (id, None),
            Err(task) => (id, Some(task)),
        },
        None => {
            let n = pool.workers.len() as u32;
            let victim = fast_fit(pool.fallback_rng.next_u64() as u32, n) as usize;
            match pool.workers[victim].deque.push_back(task) {
                Ok(()) => (victim, None),
                Err(task) => (victim, Some(task)),
            }
        }
    };

    match overflowed {
        Some(task) => {
            warn_overflow(pool, victim);
            run_task(pool, task, usize::MAX);
        }
        None => {
            pool.tasks_pending.fetch_add(1, Ordering::Relaxed);
            pool.condition.notify(false);
        }
    }
}

pub(crate) fn dispatch(pool: &Arc<PoolInner>, task: Task) {
    push_own_or_random(pool, task);
}

fn steal(pool: &Arc<PoolInner>, exclude: Option<usize>) -> Option<Task> {
    let n = pool.workers.len();
    if n <= 1 {
        return None;
    }
    let rng = match exclude {
        Some(id) => &pool.workers[id].rng,
        None => &pool.fallback_rng,
    };
    let start = fast_fit(rng.next_u64() as u32, n as u32) as usize;
    let stride = pool.coprimes[fast_fit(rng.next_u64() as u32, pool.coprimes.len() as u32) as usize] as usize;

    let mut idx = start;
    for _ in 0..n {
        if Some(idx) != exclude {
            if let Some(task) = pool.workers[idx].deque.pop_back() {
                return Some(task);
            }
        }
        idx = (idx + stride) % n;
    }
    None
}

fn run_task(pool: &Arc<PoolInner>, task: Task, worker_id: usize) {
    pool.tasks_pending.fetch_sub(1, Ordering::Relaxed);
    if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)) {
        // A panicking observer is a double fault: the pool has no sane way
        // to report a failure in the thing it reports failures to, so this
        // is treated as an unrecoverable misuse of the API rather than
        // something to catch and log.
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (pool.observer)(worker_id, payload))).is_err() {
            log::error!("pool \"{}\": panic observer itself panicked; aborting", pool.config.name);
            std::process::abort();
        }
    }
}

pub(crate) fn join<'scope, A, B, RA>(pool: &Arc<PoolInner>, a: A, b: B) -> RA
where
    A: FnOnce() -> RA + Send + 'scope,
    B: FnOnce() + Send + 'scope,
    RA: Send,
{
    let done = Arc::new(AtomicBool::new(false));
    let done_for_b = Arc::clone(&done);

    let b_task: Box<dyn FnOnce() + Send + 'scope> = Box::new(move || {
        b();
        done_for_b.store(true, Ordering::Release);
    });
    // SAFETY: `join` does not return until `done` is observed `true` below,
    // i.e. until `b_task` (and everything it closed over) has finished
    // running, so this 'scope -> 'static cast never lets the task outlive
    // the data it borrows. This is the same scoped-lifetime trick the
    // scheduler's bounded/unbounded thread pools use for their `scope()`
    // APIs, just enforced by a join-style barrier instead of a drop guard.
    let b_task: Task = unsafe { std::mem::transmute::<Box<dyn FnOnce() + Send + 'scope>, Task>(b_task) };

    push_own_or_random(pool, b_task);

    let result = a();

    while !done.load(Ordering::Acquire) {
        let worker_id = local_worker_id_for(pool);
        let found = match worker_id {
            Some(id) => pool.workers[id].deque.pop_front().or_else(|| steal(pool, Some(id))),
            None => steal(pool, None),
        };
        match found {
            Some(task) => run_task(pool, task, worker_id.unwrap_or(usize::MAX)),
            None => {
                if done.load(Ordering::Acquire) {
                    break;
                }
                std::thread::yield_now();
            }
        }
    }

    result
}

fn compute_grain(pool: &Arc<PoolInner>, n: usize) -> usize {
    let p = pool.workers.len().max(1);
    let k = pool.config.grain_k.max(1);
    (n / (p * k)).max(1)
}

fn parallel_for_range<F>(pool: &Arc<PoolInner>, start: usize, end: usize, total: usize, grain: usize, body: &F)
where
    F: Fn(usize, usize) + Send + Sync,
{
    let len = end - start;
    if len <= grain {
        for i in start..end {
            body(i, total);
        }
        return;
    }
    let mid = start + len / 2;
    join(
        pool,
        || parallel_for_range(pool, start, mid, total, grain, body),
        || parallel_for_range(pool, mid, end, total, grain, body),
    );
}

pub(crate) fn parallel_for<F>(pool: &Arc<PoolInner>, n: usize, body: &F)
where
    F: Fn(usize, usize) + Send + Sync,
{
    if n == 0 {
        return;
    }
    let grain = compute_grain(pool, n);
    parallel_for_range(pool, 0, n, n, grain, body);
}

fn worker_loop(pool: Arc<PoolInner>, id: usize) {
    context::bind(&pool, id);
    pool.running_workers.fetch_add(1, Ordering::AcqRel);
    log::debug!("pool \"{}\": worker {id} starting", pool.config.name);

    loop {
        // `cancelled` is only consulted once a worker has genuinely found no
        // work (below): checking it here, before even trying `pop_front`,
        // would let a worker abandon tasks still sitting in its own deque or
        // stealable from others the instant `shutdown()` flips the flag,
        // violating "no lost tasks at shutdown".
        match pool.workers[id].deque.pop_front().or_else(|| steal(&pool, Some(id))) {
            Some(task) => run_task(&pool, task, id),
            None => {
                if spin_then_steal(&pool, id) {
                    continue;
                }

                pool.condition.pre_wait();
                if let Some(task) = steal(&pool, Some(id)) {
                    pool.condition.cancel_wait();
                    run_task(&pool, task, id);
                    continue;
                }
                if pool.cancelled.load(Ordering::Acquire) {
                    pool.condition.cancel_wait();
                    break;
                }
                pool.condition.commit_wait(id);
            }
        }
    }

    context::unbind();
    pool.running_workers.fetch_sub(1, Ordering::AcqRel);
    log::debug!("pool \"{}\": worker {id} exiting", pool.config.name);
}

fn spin_then_steal(pool: &Arc<PoolInner>, id: usize) -> bool {
    for _ in 0..pool.config.spin_iters {
        std::hint::spin_loop();
        if let Some(task) = steal(pool, Some(id)) {
            run_task(pool, task, id);
            return true;
        }
        if pool.cancelled.load(Ordering::Relaxed) {
            return false;
        }
    }
    false
}
