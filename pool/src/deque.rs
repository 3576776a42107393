//! A fixed-capacity, cache-line-padded double-ended task queue.
//!
//! One end (`front`) is pushed and popped only by the worker that owns the
//! deque, lock-free. The other end (`back`) is pushed by dispatchers and
//! popped by thieves under a short-held mutex. Both ends are reconciled
//! through a three-state interlock (`Empty` -> `Busy` -> `Ready`) kept per
//! slot, so the two ends never need to agree on a single shared size
//! counter: the slot itself says whether it holds live data.
//!
//! This is deliberately simpler than a Chase-Lev growable deque (see the
//! classic `WorkStealingDeque` algorithm): capacity is fixed up front and
//! an overflowing push fails instead of reallocating, which keeps the
//! owner-side fast path free of any allocation or CAS loop.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::Mutex;

use crossbeam_utils::CachePadded;

use crate::atomics::{acquire_fence, AtomicSlotState, Cursor, SlotState};

pub(crate) const DEFAULT_CAPACITY: usize = 1024;
pub(crate) const MIN_CAPACITY: usize = 4;
pub(crate) const MAX_CAPACITY: usize = 1 << 16;

struct Slot<T> {
    state: AtomicSlotState,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    fn empty() -> Self {
        Self {
            state: AtomicSlotState::new(SlotState::Empty),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

// SAFETY: access to `value` is always gated by a successful transition out
// of `Empty`/`Ready` via the atomic `state` field, which is the only thing
// that makes a `Slot<T>` safe to share across threads regardless of `T`'s
// own thread-safety.
unsafe impl<T: Send> Sync for Slot<T> {}

/// Owner-front, any-thread-back fixed-capacity task deque.
///
/// `push_front`/`pop_front` must only ever be called by the single thread
/// that owns this deque; `push_back`/`pop_back` may be called by any
/// thread, including the owner itself.
pub(crate) struct TaskDeque<T> {
    front: CachePadded<Cursor>,
    back: CachePadded<Cursor>,
    back_lock: Mutex<()>,
    mask: u64,
    slots: Box<[CachePadded<Slot<T>>]>,
}

// SAFETY: `TaskDeque` only ever moves `T` through slots it has itself
// synchronized via `state`; it never exposes `&T` or `T` without first
// observing the `Ready` -> `Busy` transition.
unsafe impl<T: Send> Send for TaskDeque<T> {}
unsafe impl<T: Send> Sync for TaskDeque<T> {}

impl<T> TaskDeque<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "deque capacity must be a power of two, got {capacity}"
        );
        assert!(
            (MIN_CAPACITY..=MAX_CAPACITY).contains(&capacity),
            "deque capacity {capacity} outside [{MIN_CAPACITY}, {MAX_CAPACITY}]"
        );
        let slots = (0..capacity)
            .map(|_| CachePadded::new(Slot::empty()))
            .collect();
        Self {
            front: CachePadded::new(Cursor::new(0)),
            back: CachePadded::new(Cursor::new(0)),
            back_lock: Mutex::new(()),
            mask: capacity as u64 - 1,
            slots,
        }
    }

    fn index(&self, cursor: u64) -> usize {
        (cursor & self.mask) as usize
    }

    /// Owner-only. Writes `task` into the slot at the current `front`
    /// cursor and advances it. Fails (returning the task back) if that
    /// slot is not `Empty`, i.e. the deque is full.
    pub(crate) fn push_front(&self, task: T) -> Result<(), T> {
        let cur = self.front.load_relaxed();
        let slot = &self.slots[self.index(cur)];
        if slot.state.load_relaxed() != SlotState::Empty {
            return Err(task);
        }
        if !slot.state.compare_exchange_acquire(SlotState::Empty, SlotState::Busy) {
            return Err(task);
        }
        unsafe { (*slot.value.get()).write(task) };
        self.front.store_relaxed(cur.wrapping_add(1));
        slot.state.store_release(SlotState::Ready);
        Ok(())
    }

    /// Owner-only. Looks one slot behind the current `front` cursor (the
    /// most recently pushed element) and pops it if still `Ready`.
    pub(crate) fn pop_front(&self) -> Option<T> {
        let cur = self.front.load_relaxed();
        let prev = cur.wrapping_sub(1);
        let slot = &self.slots[self.index(prev)];
        if slot.state.load_relaxed() != SlotState::Ready {
            return None;
        }
        if !slot.state.compare_exchange_acquire(SlotState::Ready, SlotState::Busy) {
            // A thief won the race on this exact slot (only possible when
            // the deque holds zero or one elements and `back` coincides
            // with `front - 1`).
            return None;
        }
        let value = unsafe { (*slot.value.get()).assume_init_read() };
        slot.state.store_release(SlotState::Empty);
        self.front.store_relaxed(prev);
        Some(value)
    }

    /// Any thread. Writes `task` one slot behind the current `back` cursor
    /// and moves `back` to it. Serialized against other back-side pushers
    /// (and against a same-index front-side pop) by `back_lock`.
    pub(crate) fn push_back(&self, task: T) -> Result<(), T> {
        let _guard = self.back_lock.lock().unwrap();
        let cur = self.back.load_relaxed();
        let prev = cur.wrapping_sub(1);
        let slot = &self.slots[self.index(prev)];
        if slot.state.load_relaxed() != SlotState::Empty {
            return Err(task);
        }
        if !slot.state.compare_exchange_acquire(SlotState::Empty, SlotState::Busy) {
            return Err(task);
        }
        unsafe { (*slot.value.get()).write(task) };
        self.back.store_relaxed(prev);
        slot.state.store_release(SlotState::Ready);
        Ok(())
    }

    /// Any thread. Steals the element currently at `back`, if any. Bails
    /// out via a lock-free `is_empty` check first so a stream of failed
    /// steal attempts against an idle deque never touches the lock.
    pub(crate) fn pop_back(&self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let _guard = self.back_lock.lock().unwrap();
        let cur = self.back.load_relaxed();
        let slot = &self.slots[self.index(cur)];
        if slot.state.load_relaxed() != SlotState::Ready {
            // The owner's `pop_front` reached this same slot first.
            return None;
        }
        if !slot.state.compare_exchange_acquire(SlotState::Ready, SlotState::Busy) {
            return None;
        }
        let value = unsafe { (*slot.value.get()).assume_init_read() };
        slot.state.store_release(SlotState::Empty);
        self.back.store_relaxed(cur.wrapping_add(1));
        Some(value)
    }

    /// `front` and `back` index the same slot iff the deque is either
    /// completely empty or completely full; the slot's own state (not a
    /// separate counter) tells the two cases apart.
    pub(crate) fn is_empty(&self) -> bool {
        loop {
            let front1 = self.front.load_acquire();
            let back = self.back.load_acquire();
            let front2 = self.front.load_relaxed();
            if front1 != front2 {
                acquire_fence();
                continue;
            }
            let idx_front = self.index(front1);
            if idx_front != self.index(back) {
                return false;
            }
            return self.slots[idx_front].state.load_acquire() == SlotState::Empty;
        }
    }
}

impl<T> Drop for TaskDeque<T> {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            if slot.state.load_relaxed() == SlotState::Ready {
                unsafe { (*slot.value.get()).assume_init_drop() };
            }
        }
    }
}
