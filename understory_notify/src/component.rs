// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The contract consumed from versioned state components.

use alloc::boxed::Box;
use core::fmt::Debug;
use core::hash::{BuildHasher, Hash};

use hashbrown::HashMap;

use crate::version::{ChangeSeverity, VersionToken};

/// A versioned container of mutable state.
///
/// The notification manager never looks inside a component. It only needs the
/// version counter, the identity hash, a way to classify how much changed since
/// a bookmark, and a way to tell the component which history is no longer
/// needed.
///
/// Implementors must keep [`current_version`](Self::current_version)
/// monotonically non-decreasing for a given identity.
pub trait StateComponent {
    /// Returns the current version counter.
    fn current_version(&self) -> u64;

    /// Returns a hash that is stable for the component's logical identity.
    ///
    /// Replacing or resetting the component should produce a new identity.
    fn identity_hash(&self) -> u64;

    /// Returns the component's current `(identity, counter)` token.
    fn version_token(&self) -> VersionToken {
        VersionToken::new(self.identity_hash(), self.current_version())
    }

    /// Returns `true` if stored changesets describe every change after `counter`.
    ///
    /// Components that keep no history return `false`, which makes every
    /// change look [`Complete`](ChangeSeverity::Complete).
    fn has_changes_since(&self, counter: u64) -> bool {
        let _ = counter;
        false
    }

    /// Classifies what changed since `last` was recorded.
    ///
    /// - `None` if `last` matches the current identity and counter.
    /// - `Complete` if the identity differs or no describable delta exists.
    /// - `Partial` if the identity matches and changesets cover the gap.
    fn change_severity(&self, last: VersionToken) -> ChangeSeverity {
        if last.identity() != self.identity_hash() {
            return ChangeSeverity::Complete;
        }
        if last.counter() == self.current_version() {
            return ChangeSeverity::None;
        }
        if self.has_changes_since(last.counter()) {
            ChangeSeverity::Partial
        } else {
            ChangeSeverity::Complete
        }
    }

    /// Discards history strictly older than `earliest_needed`.
    ///
    /// `current` is the component's current version at the time of the call.
    /// Components without changeset history keep the default no-op.
    fn purge_changesets_before(&mut self, earliest_needed: u64, current: u64) {
        let _ = (earliest_needed, current);
    }
}

impl<T: StateComponent + ?Sized> StateComponent for Box<T> {
    fn current_version(&self) -> u64 {
        (**self).current_version()
    }

    fn identity_hash(&self) -> u64 {
        (**self).identity_hash()
    }

    fn version_token(&self) -> VersionToken {
        (**self).version_token()
    }

    fn has_changes_since(&self, counter: u64) -> bool {
        (**self).has_changes_since(counter)
    }

    fn change_severity(&self, last: VersionToken) -> ChangeSeverity {
        (**self).change_severity(last)
    }

    fn purge_changesets_before(&mut self, earliest_needed: u64, current: u64) {
        (**self).purge_changesets_before(earliest_needed, current);
    }
}

/// Lookup of state components by key.
///
/// The host owns its state; the manager borrows it for the duration of a
/// notify cycle and hands it to each observer through
/// [`NotifyContext`](crate::NotifyContext).
pub trait StateStore {
    /// The key observers use to name a component.
    type Key: Copy + Eq + Hash + Debug;

    /// Returns the component stored under `key`, if any.
    fn component(&self, key: Self::Key) -> Option<&dyn StateComponent>;

    /// Returns the component stored under `key` mutably, if any.
    fn component_mut(&mut self, key: Self::Key) -> Option<&mut dyn StateComponent>;
}

impl<C, T, H> StateStore for HashMap<C, T, H>
where
    C: Copy + Eq + Hash + Debug,
    T: StateComponent,
    H: BuildHasher,
{
    type Key = C;

    fn component(&self, key: C) -> Option<&dyn StateComponent> {
        self.get(&key).map(|c| c as &dyn StateComponent)
    }

    fn component_mut(&mut self, key: C) -> Option<&mut dyn StateComponent> {
        self.get_mut(&key).map(|c| c as &mut dyn StateComponent)
    }
}
