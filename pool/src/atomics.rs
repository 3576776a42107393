//! Typed atomic primitives with explicit ordering at each call site.
//!
//! The deque and the non-blocking condition are both built on a handful of
//! atomic operations whose correctness depends on the exact memory
//! ordering used. Rather than threading bare `Ordering` values through the
//! rest of the crate, the small set of orderings actually needed is named
//! here once, so every call site reads as "acquire load" or "release
//! store" instead of a positional `Ordering::Acquire` argument that's easy
//! to get wrong during a refactor.

use std::sync::atomic::{fence, AtomicU64, AtomicU8, Ordering};

/// A `u64` cursor used for the deque's `front`/`back` indices and the
/// non-blocking condition's packed state word.
#[derive(Debug, Default)]
pub(crate) struct Cursor(AtomicU64);

impl Cursor {
    pub(crate) const fn new(v: u64) -> Self {
        Self(AtomicU64::new(v))
    }

    pub(crate) fn load_relaxed(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn load_acquire(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn load_seqcst(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn store_relaxed(&self, v: u64) {
        self.0.store(v, Ordering::Relaxed)
    }

    /// Compare-exchange used by the non-blocking condition's packed state
    /// word: acquire/release on success (to publish the new word and
    /// observe whatever the previous owner published), relaxed on failure
    /// (we're just going to reload and retry).
    pub(crate) fn compare_exchange_weak_acq_rel(&self, current: u64, new: u64) -> Result<u64, u64> {
        self.0
            .compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Relaxed)
    }

    /// Compare-exchange used by `pre_wait`, where both sides of the Dekker
    /// handshake need sequential consistency to avoid the classic
    /// store-then-load reordering that would let a producer and a waiter
    /// both miss each other.
    pub(crate) fn compare_exchange_seqcst(&self, current: u64, new: u64) -> Result<u64, u64> {
        self.0
            .compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
    }
}

/// The three-state interlock held by every deque slot. `Busy` exists purely
/// to let the owning end's index cursor advance while the payload itself is
/// still being written or read, so a concurrent reader on the other end
/// never observes a torn element.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    Empty = 0,
    Busy = 1,
    Ready = 2,
}

impl SlotState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SlotState::Empty,
            1 => SlotState::Busy,
            2 => SlotState::Ready,
            other => unreachable!("invalid slot state {other}"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct AtomicSlotState(AtomicU8);

impl AtomicSlotState {
    pub(crate) fn new(state: SlotState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn load_relaxed(&self) -> SlotState {
        SlotState::from_u8(self.0.load(Ordering::Relaxed))
    }

    pub(crate) fn load_acquire(&self) -> SlotState {
        SlotState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Strong compare-exchange with an acquire success ordering: the caller
    /// is about to read or write the slot's payload and must synchronize
    /// with whichever thread last released it.
    pub(crate) fn compare_exchange_acquire(&self, current: SlotState, new: SlotState) -> bool {
        self.0
            .compare_exchange(current as u8, new as u8, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn store_release(&self, new: SlotState) {
        self.0.store(new as u8, Ordering::Release);
    }
}

/// Bounds the reordering window of the deque's `is_empty()` snapshot retry
/// loop: after observing a torn `(front, back)` pair we re-fence before
/// retrying so the next pair of loads can't be satisfied by stale cached
/// values.
pub(crate) fn acquire_fence() {
    fence(Ordering::Acquire);
}

/// Establishes the Dekker-style ordering `notify()` needs against a racing
/// `pre_wait()`: without this fence, the producer's predicate write and the
/// waiter's predicate read could both be reordered past each other and
/// neither side would observe the other.
pub(crate) fn seqcst_fence() {
    fence(Ordering::SeqCst);
}
