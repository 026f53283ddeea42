// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Atomic state cells.
//!
//! Every primitive keeps its shared state as an immutable value behind an
//! `Arc`. Writers build the next value from the one they loaded and publish
//! it with a single compare-and-swap; a losing writer reloads and decides
//! again. Holding the loaded `Arc` keeps its address alive, so a successful
//! swap can never be an ABA false positive.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

/// Immutable state swapped atomically.
pub(crate) struct Snapshot<S> {
    cell: ArcSwap<S>,
}

impl<S> Snapshot<S> {
    pub fn new(initial: S) -> Self {
        Self {
            cell: ArcSwap::from_pointee(initial),
        }
    }

    /// Current state.
    pub fn load(&self) -> Arc<S> {
        self.cell.load_full()
    }

    /// Publish `next` if the state is still `current`. Returns false when
    /// another writer got there first.
    pub fn replace(&self, current: &Arc<S>, next: S) -> bool {
        let previous = self.cell.compare_and_swap(current, Arc::new(next));
        Arc::ptr_eq(&*previous, current)
    }
}

/// A value that can be moved out exactly once through a shared reference.
///
/// Snapshots are shared, so a value parked in one cannot be moved out of it
/// directly. Whoever removed the parcel from the published state takes it.
pub(crate) struct Parcel<T> {
    taken: AtomicBool,
    value: UnsafeCell<Option<T>>,
}

// SAFETY: the value is only touched by the single thread that flips `taken`.
unsafe impl<T: Send> Sync for Parcel<T> {}

impl<T> Parcel<T> {
    pub fn new(value: T) -> Self {
        Self {
            taken: AtomicBool::new(false),
            value: UnsafeCell::new(Some(value)),
        }
    }

    pub fn take(&self) -> Option<T> {
        if self.taken.swap(true, Ordering::AcqRel) {
            return None;
        }
        // SAFETY: the swap above granted exclusive access.
        unsafe { (*self.value.get()).take() }
    }

    pub fn is_taken(&self) -> bool {
        self.taken.load(Ordering::Acquire)
    }
}
