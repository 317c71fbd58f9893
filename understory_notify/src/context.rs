// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-call context handed to a running observer.

use core::fmt;

/// Context for one observer invocation.
///
/// The manager builds a fresh context for every [`Observer::run`] call. It
/// carries the host state for the duration of the call and names the observer
/// being run, so diagnostics never need a global "current observer".
///
/// [`Observer::run`]: crate::Observer::run
pub struct NotifyContext<'a, S: ?Sized, K> {
    state: &'a mut S,
    observer: K,
    cycle: u64,
}

impl<'a, S: ?Sized, K: Copy> NotifyContext<'a, S, K> {
    /// Creates a context for running `observer` during `cycle`.
    ///
    /// Hosts normally never build one; it is public so observers can be
    /// driven directly in tests.
    #[must_use]
    pub fn new(state: &'a mut S, observer: K, cycle: u64) -> Self {
        Self {
            state,
            observer,
            cycle,
        }
    }

    /// Returns the host state.
    #[must_use]
    pub fn state(&self) -> &S {
        self.state
    }

    /// Returns the host state mutably.
    #[must_use]
    pub fn state_mut(&mut self) -> &mut S {
        self.state
    }

    /// Returns the key of the observer being run.
    #[must_use]
    pub fn observer(&self) -> K {
        self.observer
    }

    /// Returns the notify cycle number, starting at 1.
    #[must_use]
    pub fn cycle(&self) -> u64 {
        self.cycle
    }
}

impl<S: ?Sized, K: fmt::Debug> fmt::Debug for NotifyContext<'_, S, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifyContext")
            .field("observer", &self.observer)
            .field("cycle", &self.cycle)
            .finish_non_exhaustive()
    }
}
