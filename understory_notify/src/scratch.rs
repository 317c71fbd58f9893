// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Reusable per-cycle scratch buffers.

use alloc::vec::Vec;
use core::hash::Hash;
use core::ops::{Deref, DerefMut};

use hashbrown::HashSet;

/// Scratch storage reused by every notify cycle.
///
/// The buffers retain capacity across cycles but carry no information from
/// one cycle to the next: they are cleared when a cycle starts and again on
/// every exit path through [`CycleGuard`].
#[derive(Debug)]
pub(crate) struct NotifyScratch<K, C>
where
    K: Copy + Eq + Hash,
    C: Copy + Eq + Hash,
{
    /// Observers to invoke this cycle, in execution order.
    pub(crate) call_list: Vec<K>,
    /// Components written by an observer already on the call list.
    pub(crate) dirty: HashSet<C>,
    /// Set while a cycle is in flight.
    in_cycle: bool,
}

impl<K, C> NotifyScratch<K, C>
where
    K: Copy + Eq + Hash,
    C: Copy + Eq + Hash,
{
    pub(crate) fn new() -> Self {
        Self {
            call_list: Vec::new(),
            dirty: HashSet::new(),
            in_cycle: false,
        }
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            call_list: Vec::with_capacity(capacity),
            dirty: HashSet::with_capacity(capacity),
            in_cycle: false,
        }
    }

    pub(crate) fn in_cycle(&self) -> bool {
        self.in_cycle
    }

    #[cfg(test)]
    pub(crate) fn is_clear(&self) -> bool {
        !self.in_cycle && self.call_list.is_empty() && self.dirty.is_empty()
    }

    /// Marks a cycle as started and returns the guard that ends it.
    pub(crate) fn enter(&mut self) -> CycleGuard<'_, K, C> {
        debug_assert!(!self.in_cycle, "notify cycles must not overlap");
        self.reset();
        self.in_cycle = true;
        CycleGuard { scratch: self }
    }

    fn reset(&mut self) {
        self.call_list.clear();
        self.dirty.clear();
    }
}

/// Ends a notify cycle when dropped, whether it returned, failed or unwound.
pub(crate) struct CycleGuard<'a, K, C>
where
    K: Copy + Eq + Hash,
    C: Copy + Eq + Hash,
{
    scratch: &'a mut NotifyScratch<K, C>,
}

impl<K, C> Deref for CycleGuard<'_, K, C>
where
    K: Copy + Eq + Hash,
    C: Copy + Eq + Hash,
{
    type Target = NotifyScratch<K, C>;

    fn deref(&self) -> &Self::Target {
        self.scratch
    }
}

impl<K, C> DerefMut for CycleGuard<'_, K, C>
where
    K: Copy + Eq + Hash,
    C: Copy + Eq + Hash,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.scratch
    }
}

impl<K, C> Drop for CycleGuard<'_, K, C>
where
    K: Copy + Eq + Hash,
    C: Copy + Eq + Hash,
{
    fn drop(&mut self) {
        self.scratch.reset();
        self.scratch.in_cycle = false;
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    #[test]
    fn guard_clears_buffers_on_drop() {
        let mut scratch = NotifyScratch::<u32, u32>::with_capacity(4);
        {
            let mut guard = scratch.enter();
            assert!(guard.in_cycle());
            guard.call_list.push(1);
            guard.dirty.insert(2);
        }
        assert!(scratch.is_clear());
        assert!(scratch.call_list.capacity() >= 4);
    }

    #[test]
    fn guard_clears_buffers_when_unwinding() {
        let mut scratch = NotifyScratch::<u32, u32>::new();
        let result = catch_unwind::<_, ()>(AssertUnwindSafe(|| {
            let mut guard = scratch.enter();
            guard.call_list.push(7);
            panic!("observer panicked");
        }));
        assert!(result.is_err());
        assert!(scratch.is_clear());
    }
}
