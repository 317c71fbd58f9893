// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Changeset history and a reference versioned component.

use alloc::collections::VecDeque;
use core::hash::BuildHasher;

use hashbrown::DefaultHashBuilder;

use crate::component::StateComponent;
use crate::version::VersionToken;

/// An ordered history of deltas keyed by the version they produced.
///
/// The log covers a contiguous range: every change after [`base`](Self::base)
/// is recorded. Purging moves the base forward; a change that cannot be
/// described (see [`break_history`](Self::break_history)) resets it.
///
/// # Example
///
/// ```
/// use understory_notify::ChangesetLog;
///
/// let mut log = ChangesetLog::new(0);
/// log.record(1, "a");
/// log.record(2, "b");
///
/// assert!(log.has_changes_since(0));
/// assert_eq!(log.since(1).unwrap().collect::<Vec<_>>(), vec![&"b"]);
///
/// log.purge_before(1);
/// assert!(!log.has_changes_since(0));
/// assert_eq!(log.len(), 1);
/// ```
#[derive(Clone, Debug)]
pub struct ChangesetLog<D> {
    base: u64,
    entries: VecDeque<(u64, D)>,
}

impl<D> ChangesetLog<D> {
    /// Creates an empty log that covers every change after `base`.
    #[must_use]
    pub fn new(base: u64) -> Self {
        Self {
            base,
            entries: VecDeque::new(),
        }
    }

    /// Returns the version after which history is complete.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Records the delta that produced `version`.
    ///
    /// Versions must be recorded in increasing order.
    pub fn record(&mut self, version: u64, delta: D) {
        debug_assert!(
            self.entries.back().is_none_or(|(v, _)| *v < version),
            "changesets must be recorded in increasing version order"
        );
        self.entries.push_back((version, delta));
    }

    /// Drops all history; only changes after `version` will be describable.
    pub fn break_history(&mut self, version: u64) {
        self.entries.clear();
        self.base = version;
    }

    /// Returns `true` if every change after `counter` is recorded.
    #[must_use]
    pub fn has_changes_since(&self, counter: u64) -> bool {
        counter >= self.base
    }

    /// Returns the deltas recorded after `counter`, oldest first.
    ///
    /// Returns `None` if part of that range has been purged or was never
    /// describable.
    pub fn since(&self, counter: u64) -> Option<impl Iterator<Item = &D> + '_> {
        if !self.has_changes_since(counter) {
            return None;
        }
        Some(
            self.entries
                .iter()
                .skip_while(move |(v, _)| *v <= counter)
                .map(|(_, d)| d),
        )
    }

    /// Discards deltas that every reader has already seen.
    ///
    /// A reader bookmarked at `earliest_needed` only needs changes with a
    /// greater version, so entries at or before it are dropped.
    pub fn purge_before(&mut self, earliest_needed: u64) {
        while self
            .entries
            .front()
            .is_some_and(|(v, _)| *v <= earliest_needed)
        {
            self.entries.pop_front();
        }
        self.base = self.base.max(earliest_needed);
    }

    /// Returns the number of stored deltas.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no deltas are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every stored delta.
    ///
    /// The base advances to the newest dropped version, so only readers that
    /// had already seen everything keep a describable history.
    pub fn clear(&mut self) {
        if let Some((newest, _)) = self.entries.back() {
            self.base = self.base.max(*newest);
        }
        self.entries.clear();
    }
}

/// A value with a version counter, an identity and changeset history.
///
/// `Versioned` is a ready-made [`StateComponent`] for hosts that do not have
/// their own versioning scheme.
///
/// - [`modify`](Self::modify) records a delta; observers bookmarked within
///   the retained history see [`Partial`](crate::ChangeSeverity::Partial).
/// - [`touch`](Self::touch) bumps the version without a delta; older
///   bookmarks see [`Complete`](crate::ChangeSeverity::Complete).
/// - [`reset`](Self::reset) replaces the value under a new identity; every
///   prior bookmark becomes stale.
///
/// # Example
///
/// ```
/// use understory_notify::{ChangeSeverity, StateComponent, Versioned};
///
/// let mut counter = Versioned::<i32, i32>::new(1, 0);
/// let seen = counter.version_token();
///
/// counter.modify(5, |v| *v += 5);
/// assert_eq!(*counter.get(), 5);
/// assert_eq!(counter.change_severity(seen), ChangeSeverity::Partial);
/// assert_eq!(counter.changes_since(seen).unwrap().collect::<Vec<_>>(), vec![&5]);
///
/// counter.reset(0);
/// assert_eq!(counter.change_severity(seen), ChangeSeverity::Complete);
/// ```
#[derive(Clone, Debug)]
pub struct Versioned<T, D = ()> {
    value: T,
    identity: u64,
    version: u64,
    log: ChangesetLog<D>,
}

impl<T, D> Versioned<T, D> {
    /// Creates a component at version 0 with the given identity.
    ///
    /// `identity` must be non-zero so it cannot collide with
    /// [`VersionToken::UNSEEN`].
    #[must_use]
    pub fn new(identity: u64, value: T) -> Self {
        debug_assert_ne!(identity, 0, "identity 0 is reserved for unseen bookmarks");
        Self {
            value,
            identity,
            version: 0,
            log: ChangesetLog::new(0),
        }
    }

    /// Returns the current value.
    #[must_use]
    pub fn get(&self) -> &T {
        &self.value
    }

    /// Mutates the value and records `delta` as the describing changeset.
    ///
    /// Returns the new version.
    pub fn modify(&mut self, delta: D, f: impl FnOnce(&mut T)) -> u64 {
        f(&mut self.value);
        self.version += 1;
        self.log.record(self.version, delta);
        self.version
    }

    /// Mutates the value without a describable delta.
    ///
    /// Returns the new version.
    pub fn touch(&mut self, f: impl FnOnce(&mut T)) -> u64 {
        f(&mut self.value);
        self.version += 1;
        self.log.break_history(self.version);
        self.version
    }

    /// Replaces the value under a fresh identity.
    ///
    /// The version counter keeps increasing; the identity change alone makes
    /// all earlier bookmarks stale.
    pub fn reset(&mut self, value: T) {
        self.value = value;
        self.version += 1;
        let mut identity = DefaultHashBuilder::default().hash_one((self.identity, self.version));
        if identity == 0 || identity == self.identity {
            identity = self.identity.wrapping_add(1).max(1);
        }
        self.identity = identity;
        self.log.break_history(self.version);
    }

    /// Returns the deltas an observer holding `since` has not seen yet.
    ///
    /// Returns `None` if the token belongs to another identity or the needed
    /// history is gone; the observer must then assume everything changed.
    pub fn changes_since(&self, since: VersionToken) -> Option<impl Iterator<Item = &D> + '_> {
        if since.identity() != self.identity {
            return None;
        }
        self.log.since(since.counter())
    }

    /// Returns the stored changeset history.
    #[must_use]
    pub fn changesets(&self) -> &ChangesetLog<D> {
        &self.log
    }
}

impl<T, D> StateComponent for Versioned<T, D> {
    fn current_version(&self) -> u64 {
        self.version
    }

    fn identity_hash(&self) -> u64 {
        self.identity
    }

    fn has_changes_since(&self, counter: u64) -> bool {
        counter <= self.version && self.log.has_changes_since(counter)
    }

    fn purge_changesets_before(&mut self, earliest_needed: u64, current: u64) {
        self.log.purge_before(earliest_needed.min(current));
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::version::ChangeSeverity;
    use alloc::vec;
    use alloc::vec::Vec;

    #[test]
    fn bookmark_at_current_version_reports_none_then_partial() {
        let mut s = Versioned::<u32, &str>::new(42, 0);
        for _ in 0..5 {
            s.modify("step", |v| *v += 1);
        }
        assert_eq!(s.current_version(), 5);

        let bookmark = s.version_token();
        assert_eq!(s.change_severity(bookmark), ChangeSeverity::None);

        s.modify("bump", |v| *v += 1);
        assert_eq!(s.current_version(), 6);
        assert_eq!(s.change_severity(bookmark), ChangeSeverity::Partial);
    }

    #[test]
    fn touch_breaks_history_for_older_bookmarks_only() {
        let mut s = Versioned::<u32, u32>::new(1, 0);
        let before = s.version_token();
        s.touch(|v| *v = 10);
        let at_touch = s.version_token();
        s.modify(1, |v| *v += 1);

        assert_eq!(s.change_severity(before), ChangeSeverity::Complete);
        assert_eq!(s.change_severity(at_touch), ChangeSeverity::Partial);
        assert!(s.changes_since(before).is_none());
        assert_eq!(
            s.changes_since(at_touch).unwrap().collect::<Vec<_>>(),
            vec![&1]
        );
    }

    #[test]
    fn reset_changes_identity() {
        let mut s = Versioned::<u32>::new(1, 0);
        let old = s.version_token();
        s.reset(3);
        assert!(!old.same_identity(s.version_token()));
        assert_ne!(s.identity_hash(), 0);
        assert_eq!(s.change_severity(old), ChangeSeverity::Complete);
        assert_eq!(s.current_version(), 1);
    }

    #[test]
    fn purge_keeps_what_the_oldest_reader_needs() {
        let mut s = Versioned::<u32, u64>::new(1, 0);
        for i in 1..=4 {
            s.modify(i, |v| *v += 1);
        }
        s.purge_changesets_before(2, 4);

        assert_eq!(s.changesets().len(), 2);
        assert_eq!(s.change_severity(VersionToken::new(1, 2)), ChangeSeverity::Partial);
        assert_eq!(s.change_severity(VersionToken::new(1, 1)), ChangeSeverity::Complete);
        assert_eq!(
            s.changes_since(VersionToken::new(1, 2))
                .unwrap()
                .copied()
                .collect::<Vec<_>>(),
            vec![3, 4]
        );
    }

    #[test]
    fn purge_to_current_empties_the_log() {
        let mut log = ChangesetLog::new(0);
        log.record(1, ());
        log.record(2, ());
        log.purge_before(2);
        assert!(log.is_empty());
        assert_eq!(log.base(), 2);
        assert!(log.has_changes_since(2));
        assert_eq!(log.since(2).unwrap().count(), 0);
    }

    #[test]
    fn clear_moves_the_base_to_the_newest_entry() {
        let mut log = ChangesetLog::new(1);
        log.record(2, 'a');
        log.record(3, 'b');
        log.clear();
        assert!(log.is_empty());
        assert!(!log.has_changes_since(2));
        assert!(log.has_changes_since(3));
    }
}
