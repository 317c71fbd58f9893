// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Version tokens and change severity.

use core::fmt;
use core::ops::{BitOr, BitOrAssign};

/// A bookmark of what an observer last saw of a state component.
///
/// A token pairs the component's identity hash with its version counter. Two
/// tokens are equal only if both fields match, so a bookmark taken against a
/// previous incarnation of a component (one that was replaced or reset) is
/// recognized as stale instead of being compared against an unrelated counter.
///
/// # Example
///
/// ```
/// use understory_notify::VersionToken;
///
/// let seen = VersionToken::new(7, 3);
/// assert_eq!(seen, VersionToken::new(7, 3));
/// assert_ne!(seen, VersionToken::new(8, 3));
/// assert_ne!(seen, VersionToken::new(7, 4));
/// ```
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct VersionToken {
    identity: u64,
    counter: u64,
}

impl VersionToken {
    /// The bookmark held before an observer has looked at a component.
    ///
    /// Hosts should not hand out identity `0` to live components, so this
    /// never matches a real component's token.
    pub const UNSEEN: Self = Self::new(0, 0);

    /// Creates a token from an identity hash and a version counter.
    #[inline]
    #[must_use]
    pub const fn new(identity: u64, counter: u64) -> Self {
        Self { identity, counter }
    }

    /// Returns the identity hash half of the token.
    #[inline]
    #[must_use]
    pub const fn identity(self) -> u64 {
        self.identity
    }

    /// Returns the version counter half of the token.
    #[inline]
    #[must_use]
    pub const fn counter(self) -> u64 {
        self.counter
    }

    /// Returns `true` if both tokens refer to the same component identity.
    #[inline]
    #[must_use]
    pub const fn same_identity(self, other: Self) -> bool {
        self.identity == other.identity
    }
}

impl fmt::Debug for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VersionToken({:#x}@{})", self.identity, self.counter)
    }
}

/// How much an observer must assume changed since its last look.
///
/// Severities are ordered `None < Partial < Complete`; combining two
/// severities yields the larger one.
///
/// # Example
///
/// ```
/// use understory_notify::ChangeSeverity;
///
/// assert_eq!(
///     ChangeSeverity::None | ChangeSeverity::Partial,
///     ChangeSeverity::Partial
/// );
/// assert_eq!(
///     ChangeSeverity::Partial.combine(ChangeSeverity::Complete),
///     ChangeSeverity::Complete
/// );
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum ChangeSeverity {
    /// Nothing changed.
    #[default]
    None,
    /// A describable subset changed; the component's changesets cover it.
    Partial,
    /// Assume everything changed.
    Complete,
}

impl ChangeSeverity {
    /// Returns the larger of the two severities.
    #[inline]
    #[must_use]
    pub fn combine(self, other: Self) -> Self {
        self.max(other)
    }

    /// Returns `true` for anything other than [`ChangeSeverity::None`].
    #[inline]
    #[must_use]
    pub fn is_changed(self) -> bool {
        self != Self::None
    }
}

impl BitOr for ChangeSeverity {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.combine(rhs)
    }
}

impl BitOrAssign for ChangeSeverity {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.combine(rhs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_combines_to_maximum() {
        use ChangeSeverity::*;
        assert_eq!(None.combine(None), None);
        assert_eq!(None.combine(Partial), Partial);
        assert_eq!(Complete.combine(Partial), Complete);

        let mut acc = None;
        acc |= Partial;
        acc |= None;
        assert_eq!(acc, Partial);
        assert!(acc.is_changed());
        assert!(!None.is_changed());
    }

    #[test]
    fn tokens_differ_on_either_field() {
        let a = VersionToken::new(1, 5);
        assert!(a.same_identity(VersionToken::new(1, 9)));
        assert!(!a.same_identity(VersionToken::new(2, 5)));
        assert_ne!(a, VersionToken::UNSEEN);
        assert_eq!(VersionToken::default(), VersionToken::UNSEEN);
    }
}
