use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use compute_pool::{make_pool, PoolBuilder, PoolBuildError};

static LOG_INIT: Once = Once::new();

/// Routes the pool's `log` output (worker lifecycle, overflow warnings,
/// panic reports) to the terminal under `RUST_LOG=debug cargo test -- --nocapture`,
/// the conventional pairing for crates that only depend on the `log` facade.
fn init_logging() {
    LOG_INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

#[test]
fn dispatch_then_count_reaches_the_expected_total() {
    init_logging();
    let pool = make_pool("dispatch-count", 4).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..500 {
        let counter = Arc::clone(&counter);
        pool.dispatch(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });
    }

    // Give the workers time to drain; shutdown itself waits for threads to
    // exit but workers only exit once cancelled, so poll briefly first.
    for _ in 0..200 {
        if counter.load(Ordering::Relaxed) == 500 {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(counter.load(Ordering::Relaxed), 500);
    pool.shutdown();
}

#[test]
fn parallel_for_writes_every_index_exactly_once() {
    init_logging();
    let pool = make_pool("parallel-for", 6).unwrap();
    let n = 10_000;
    let seen = Arc::new((0..n).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>());

    let seen_for_body = Arc::clone(&seen);
    pool.parallel_for(n, move |i, total| {
        assert_eq!(total, n);
        seen_for_body[i].fetch_add(1, Ordering::Relaxed);
    });

    assert!(seen.iter().all(|c| c.load(Ordering::Relaxed) == 1));
    pool.shutdown();
}

#[test]
fn parallel_for_with_zero_elements_is_a_no_op() {
    init_logging();
    let pool = make_pool("parallel-for-empty", 2).unwrap();
    pool.parallel_for(0, |_, _| panic!("body should never run"));
    pool.shutdown();
}

#[test]
fn join_runs_both_sides_and_returns_a_result() {
    init_logging();
    let pool = make_pool("join", 4).unwrap();
    let b_ran = Arc::new(AtomicUsize::new(0));
    let b_ran_for_closure = Arc::clone(&b_ran);

    let result = pool.join(
        || 1 + 1,
        move || {
            b_ran_for_closure.fetch_add(1, Ordering::Relaxed);
        },
    );

    assert_eq!(result, 2);
    assert_eq!(b_ran.load(Ordering::Relaxed), 1);
    pool.shutdown();
}

#[test]
fn nested_join_reaches_every_leaf() {
    init_logging();
    let pool = make_pool("join-nested", 4).unwrap();
    let leaves = Arc::new(Mutex::new(Vec::new()));

    fn recurse(pool: &compute_pool::Pool, depth: u32, path: u32, leaves: &Arc<Mutex<Vec<u32>>>) {
        if depth == 0 {
            leaves.lock().unwrap().push(path);
            return;
        }
        let leaves_a = Arc::clone(leaves);
        let leaves_b = Arc::clone(leaves);
        pool.join(
            || recurse(pool, depth - 1, path * 2, &leaves_a),
            || recurse(pool, depth - 1, path * 2 + 1, &leaves_b),
        );
    }

    recurse(&pool, 4, 0, &leaves);

    let mut got = leaves.lock().unwrap().clone();
    got.sort_unstable();
    let expected: Vec<u32> = (0..16).collect();
    assert_eq!(got, expected);
    pool.shutdown();
}

#[test]
fn shutdown_with_no_pending_work_returns_promptly() {
    init_logging();
    let pool = make_pool("shutdown-empty", 3).unwrap();
    pool.shutdown();
}

#[test]
fn running_worker_count_drops_to_zero_after_shutdown() {
    init_logging();
    let pool = make_pool("activity", 17).unwrap();
    let activity = pool.activity();

    for _ in 0..200 {
        if activity.running_workers() == 17 {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(activity.running_workers(), 17);

    pool.shutdown();
    assert_eq!(activity.running_workers(), 0);
}

#[test]
fn shutdown_drains_in_flight_dispatches_before_stopping() {
    init_logging();
    let pool = make_pool("shutdown-drain", 3).unwrap();
    let done = Arc::new(AtomicUsize::new(0));

    for _ in 0..50 {
        let done = Arc::clone(&done);
        pool.dispatch(move || {
            std::thread::sleep(Duration::from_millis(1));
            done.fetch_add(1, Ordering::Relaxed);
        });
    }

    // Every dispatched task is guaranteed to run exactly once before
    // `shutdown()` returns: a worker only exits once its own deque is empty
    // and it fails to steal from anyone else's, not merely because
    // `cancelled` flipped.
    pool.shutdown();
    assert_eq!(done.load(Ordering::Relaxed), 50);
}

#[test]
fn panicking_task_invokes_the_observer_and_the_pool_keeps_running() {
    init_logging();
    let panics_seen = Arc::new(AtomicUsize::new(0));
    let panics_for_observer = Arc::clone(&panics_seen);

    let pool = PoolBuilder::new("panic-observer")
        .thread_count(2)
        .observer(move |_worker_id, _payload| {
            panics_for_observer.fetch_add(1, Ordering::Relaxed);
        })
        .build()
        .unwrap();

    pool.dispatch(|| panic!("boom"));

    let survived = Arc::new(AtomicU32::new(0));
    let survived_for_closure = Arc::clone(&survived);
    pool.dispatch(move || {
        survived_for_closure.store(1, Ordering::Relaxed);
    });

    for _ in 0..200 {
        if panics_seen.load(Ordering::Relaxed) == 1 && survived.load(Ordering::Relaxed) == 1 {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(panics_seen.load(Ordering::Relaxed), 1);
    assert_eq!(survived.load(Ordering::Relaxed), 1);
    pool.shutdown();
}

#[test]
fn building_a_pool_with_zero_threads_is_an_error() {
    init_logging();
    let err = PoolBuilder::new("zero").thread_count(0).build().unwrap_err();
    assert!(matches!(err, PoolBuildError::ZeroThreads));
}

#[test]
fn current_worker_context_is_only_some_from_inside_a_worker() {
    init_logging();
    assert!(compute_pool::current_worker_context().is_none());

    let pool = make_pool("context", 2).unwrap();
    let observed = Arc::new(Mutex::new(None));
    let observed_for_closure = Arc::clone(&observed);
    pool.dispatch(move || {
        *observed_for_closure.lock().unwrap() = compute_pool::current_worker_context().map(|c| c.worker_id);
    });

    for _ in 0..200 {
        if observed.lock().unwrap().is_some() {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    assert!(observed.lock().unwrap().is_some());
    pool.shutdown();
}
