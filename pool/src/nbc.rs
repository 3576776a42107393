//! A non-blocking condition variable.
//!
//! Ordinary condvars require the waiter to hold a lock while it re-checks
//! its predicate, which serializes every waiter against every notifier.
//! This one instead runs a Dekker-style handshake (`pre_wait` / `commit_wait`
//! / `cancel_wait`) over a single packed atomic word, so a thread can
//! announce "I might wait" without blocking anyone else, re-check its
//! predicate lock-free, and only actually block if the predicate still
//! doesn't hold. The protocol is the same one `std::sync::atomic`-based
//! schedulers in the wild use to avoid missed wakeups without a mutex on
//! the hot path; the actual blocking, once a thread commits to it, falls
//! back to a plain per-thread `Mutex` + `Condvar` pair, the same primitive
//! the scheduler's own `count_down_latch` module blocks on.
//!
//! State word layout (low to high bits):
//!   - `stack_top`  (14 bits) — index of the most recently parked waiter,
//!     or the all-ones sentinel if the waiter stack is empty.
//!   - `pre_wait`   (14 bits) — number of threads currently between
//!     `pre_wait()` and a matching `cancel_wait()`/wakeup.
//!   - `signal`     (14 bits) — number of wakeups available to be claimed
//!     by a thread that hasn't parked yet.
//!   - `epoch`      (22 bits) — bumped on every stack push/pop, so a
//!     compare-exchange can't mistake a pop-then-push of the same index
//!     for a no-op (the classic ABA hazard on an intrusive stack).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use crate::atomics::{seqcst_fence, Cursor};

const STACK_TOP_BITS: u32 = 14;
const PRE_WAIT_BITS: u32 = 14;
const SIGNAL_BITS: u32 = 14;
const EPOCH_BITS: u32 = 64 - STACK_TOP_BITS - PRE_WAIT_BITS - SIGNAL_BITS;

const STACK_TOP_MASK: u64 = (1 << STACK_TOP_BITS) - 1;
const PRE_WAIT_MASK: u64 = (1 << PRE_WAIT_BITS) - 1;
const SIGNAL_MASK: u64 = (1 << SIGNAL_BITS) - 1;
const EPOCH_MASK: u64 = (1 << EPOCH_BITS) - 1;

const STACK_SENTINEL: u64 = STACK_TOP_MASK;

/// Largest number of waiter slots a condition can be built with; the
/// all-ones value of the `stack_top` field is reserved as the empty-stack
/// sentinel, so one fewer index is usable than the field could otherwise
/// address.
pub(crate) const MAX_WAITERS: usize = (STACK_TOP_MASK - 1) as usize;

#[derive(Clone, Copy, PartialEq, Eq)]
struct State {
    stack_top: u64,
    pre_wait: u64,
    signal: u64,
    epoch: u64,
}

impl State {
    fn decode(word: u64) -> Self {
        Self {
            stack_top: word & STACK_TOP_MASK,
            pre_wait: (word >> STACK_TOP_BITS) & PRE_WAIT_MASK,
            signal: (word >> (STACK_TOP_BITS + PRE_WAIT_BITS)) & SIGNAL_MASK,
            epoch: (word >> (STACK_TOP_BITS + PRE_WAIT_BITS + SIGNAL_BITS)) & EPOCH_MASK,
        }
    }

    fn encode(self) -> u64 {
        (self.stack_top & STACK_TOP_MASK)
            | ((self.pre_wait & PRE_WAIT_MASK) << STACK_TOP_BITS)
            | ((self.signal & SIGNAL_MASK) << (STACK_TOP_BITS + PRE_WAIT_BITS))
            | ((self.epoch & EPOCH_MASK) << (STACK_TOP_BITS + PRE_WAIT_BITS + SIGNAL_BITS))
    }
}

fn encode_next(next_index_or_sentinel: u64, push_epoch: u64) -> u64 {
    (next_index_or_sentinel & STACK_TOP_MASK) | (push_epoch << STACK_TOP_BITS)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum WaitState {
    NotSignaled,
    Waiting,
    Signaled,
}

struct PerThread {
    /// Encodes this slot's successor on the waiter stack (low bits) plus
    /// the push epoch that was current when it joined (high bits), so a
    /// walker following the chain can't be fooled by a slot that left and
    /// rejoined the stack between reads.
    next: AtomicU64,
    push_count: AtomicU64,
    wait: Mutex<WaitState>,
    cond: Condvar,
}

impl PerThread {
    fn new() -> Self {
        Self {
            next: AtomicU64::new(encode_next(STACK_SENTINEL, 0)),
            push_count: AtomicU64::new(0),
            wait: Mutex::new(WaitState::NotSignaled),
            cond: Condvar::new(),
        }
    }
}

pub(crate) struct NonblockingCondition {
    state: Cursor,
    threads: Box<[PerThread]>,
}

impl NonblockingCondition {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(
            capacity <= MAX_WAITERS,
            "non-blocking condition capacity {capacity} exceeds the {MAX_WAITERS} waiter limit"
        );
        let threads = (0..capacity.max(1)).map(|_| PerThread::new()).collect();
        let initial = State {
            stack_top: STACK_SENTINEL,
            pre_wait: 0,
            signal: 0,
            epoch: 0,
        };
        Self {
            state: Cursor::new(initial.encode()),
            threads,
        }
    }

    /// Announces intent to wait. Must be followed by either `cancel_wait`
    /// (if a subsequent predicate check succeeds) or `commit_wait` (if it
    /// doesn't) — this is the first half of the Dekker handshake.
    pub(crate) fn pre_wait(&self) {
        loop {
            let word = self.state.load_seqcst();
            let mut s = State::decode(word);
            s.pre_wait = s
                .pre_wait
                .checked_add(1)
                .filter(|&v| v as usize <= self.threads.len())
                .expect("pre_wait count exceeds the condition's waiter capacity");
            if self.state.compare_exchange_seqcst(word, s.encode()).is_ok() {
                return;
            }
        }
    }

    /// Undoes a `pre_wait()` when the caller's predicate turned out to
    /// already hold, handing back a signal credit if one had been reserved
    /// for this waiter in the meantime.
    pub(crate) fn cancel_wait(&self) {
        loop {
            let word = self.state.load_acquire();
            let mut s = State::decode(word);
            let give_back_signal = s.signal == s.pre_wait;
            s.pre_wait = s
                .pre_wait
                .checked_sub(1)
                .expect("cancel_wait called without a matching pre_wait");
            if give_back_signal {
                s.signal = s.signal.checked_sub(1).expect("signal underflow in cancel_wait");
            }
            if self.state.compare_exchange_weak_acq_rel(word, s.encode()).is_ok() {
                return;
            }
        }
    }

    /// Commits to waiting. If a signal is already outstanding it's
    /// consumed immediately and this returns without blocking; otherwise
    /// the calling thread (identified by `id`, a slot index reserved for
    /// it for the lifetime of the pool) is pushed onto the waiter stack and
    /// parked until `notify` wakes it.
    pub(crate) fn commit_wait(&self, id: usize) {
        loop {
            let word = self.state.load_seqcst();
            let mut s = State::decode(word);

            if s.signal > 0 {
                s.signal -= 1;
                s.pre_wait = s
                    .pre_wait
                    .checked_sub(1)
                    .expect("commit_wait called without a matching pre_wait");
                if self.state.compare_exchange_weak_acq_rel(word, s.encode()).is_ok() {
                    return;
                }
                continue;
            }

            let thread = &self.threads[id];
            *thread.wait.lock().unwrap() = WaitState::NotSignaled;
            let push_epoch = thread.push_count.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            thread.next.store(encode_next(s.stack_top, push_epoch), Ordering::Relaxed);

            let mut next_state = s;
            next_state.stack_top = id as u64;
            next_state.epoch = next_state.epoch.wrapping_add(1);

            if self
                .state
                .compare_exchange_weak_acq_rel(word, next_state.encode())
                .is_err()
            {
                continue;
            }

            {
                let mut wait = thread.wait.lock().unwrap();
                // A notifier may have already popped us off the stack and
                // signaled us in the window between the CAS above and this
                // lock acquisition; only arm `Waiting` if that didn't happen,
                // otherwise we'd clobber `Signaled` back to `Waiting` and
                // park with nobody left who will ever notify us again.
                if *wait != WaitState::Signaled {
                    *wait = WaitState::Waiting;
                    while *wait == WaitState::Waiting {
                        wait = thread.cond.wait(wait).unwrap();
                    }
                }
            }

            // We were popped off the stack by a notifier; we're no longer
            // part of the waiting set it accounts for.
            loop {
                let word = self.state.load_acquire();
                let mut s = State::decode(word);
                s.pre_wait = s.pre_wait.checked_sub(1).expect("pre_wait underflow on wake");
                if self.state.compare_exchange_weak_acq_rel(word, s.encode()).is_ok() {
                    break;
                }
            }
            return;
        }
    }

    /// Wakes one waiter (`all == false`) or every waiter (`all == true`).
    /// Preferring to hand out a signal credit over popping an actually
    /// parked waiter (when both are possible) keeps the common case —
    /// notifying a thread that hasn't parked yet — allocation- and
    /// syscall-free.
    pub(crate) fn notify(&self, all: bool) {
        seqcst_fence();
        loop {
            let word = self.state.load_acquire();
            let mut s = State::decode(word);

            if s.stack_top == STACK_SENTINEL && s.signal == s.pre_wait {
                return;
            }

            let mut pop_one = None;
            let mut pop_all_from = None;

            if all {
                s.signal = s.pre_wait;
                pop_all_from = Some(s.stack_top);
                s.stack_top = STACK_SENTINEL;
                s.epoch = s.epoch.wrapping_add(1);
            } else if s.signal < s.pre_wait {
                s.signal += 1;
            } else if s.stack_top != STACK_SENTINEL {
                let top = s.stack_top;
                let next_word = self.threads[top as usize].next.load(Ordering::Acquire);
                s.stack_top = next_word & STACK_TOP_MASK;
                s.epoch = s.epoch.wrapping_add(1);
                pop_one = Some(top);
            } else {
                return;
            }

            if self.state.compare_exchange_weak_acq_rel(word, s.encode()).is_ok() {
                if let Some(from) = pop_all_from {
                    self.unpark_stack(from);
                } else if let Some(idx) = pop_one {
                    self.unpark_one(idx);
                }
                return;
            }
        }
    }

    fn unpark_one(&self, idx: u64) {
        let thread = &self.threads[idx as usize];
        let mut wait = thread.wait.lock().unwrap();
        *wait = WaitState::Signaled;
        thread.cond.notify_one();
    }

    fn unpark_stack(&self, top: u64) {
        let mut cur = top;
        while cur != STACK_SENTINEL {
            let next_word = self.threads[cur as usize].next.load(Ordering::Acquire);
            let next = next_word & STACK_TOP_MASK;
            self.unpark_one(cur);
            cur = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn pre_wait_then_cancel_wait_is_a_no_op() {
        let nbc = NonblockingCondition::new(4);
        nbc.pre_wait();
        nbc.cancel_wait();
        let s = State::decode(nbc.state.load_seqcst());
        assert_eq!(s.pre_wait, 0);
        assert_eq!(s.signal, 0);
    }

    #[test]
    fn notify_before_wait_is_remembered_as_a_signal_credit() {
        let nbc = NonblockingCondition::new(4);
        nbc.pre_wait();
        nbc.notify(false);
        // The credit is consumed without parking.
        nbc.commit_wait(0);
        let s = State::decode(nbc.state.load_seqcst());
        assert_eq!(s.pre_wait, 0);
        assert_eq!(s.signal, 0);
    }

    #[test]
    fn a_parked_waiter_wakes_on_notify() {
        let nbc = Arc::new(NonblockingCondition::new(4));
        let woke = Arc::new(AtomicBool::new(false));

        let nbc2 = Arc::clone(&nbc);
        let woke2 = Arc::clone(&woke);
        let waiter = thread::spawn(move || {
            nbc2.pre_wait();
            nbc2.commit_wait(0);
            woke2.store(true, Ordering::SeqCst);
        });

        // Give the waiter a chance to actually park before notifying.
        thread::sleep(Duration::from_millis(50));
        nbc.notify(false);
        waiter.join().unwrap();
        assert!(woke.load(Ordering::SeqCst));
    }

    #[test]
    fn notify_all_wakes_every_parked_waiter() {
        let nbc = Arc::new(NonblockingCondition::new(4));
        let woke_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let handles: Vec<_> = (0..3)
            .map(|id| {
                let nbc = Arc::clone(&nbc);
                let woke_count = Arc::clone(&woke_count);
                thread::spawn(move || {
                    nbc.pre_wait();
                    nbc.commit_wait(id);
                    woke_count.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        nbc.notify(true);
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(woke_count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn commit_wait_races_notify_without_a_sleep_and_still_wakes() {
        // No `thread::sleep` here on purpose: this hammers the window
        // between `commit_wait`'s stack-push CAS and its re-lock of
        // `thread.wait`, where a `notify` that wins the race can already
        // have marked the waiter `Signaled` before it parks.
        for _ in 0..2000 {
            let nbc = Arc::new(NonblockingCondition::new(4));
            let woke = Arc::new(AtomicBool::new(false));

            let nbc2 = Arc::clone(&nbc);
            let woke2 = Arc::clone(&woke);
            nbc2.pre_wait();
            let waiter = thread::spawn(move || {
                nbc2.commit_wait(0);
                woke2.store(true, Ordering::SeqCst);
            });

            nbc.notify(false);
            waiter.join().unwrap();
            assert!(woke.load(Ordering::SeqCst));
        }
    }
}
