// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The observer contract and per-component bookmarks.

use core::fmt;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use smallvec::SmallVec;

use crate::component::{StateComponent, StateStore};
use crate::context::NotifyContext;
use crate::order::ObserverSets;
use crate::version::{ChangeSeverity, VersionToken};

/// A unit of reactive logic with declared read and write sets.
///
/// Observers are polymorphic purely through this flat interface: two ordered
/// component sets, a callback, and bookmark accessors. The sets must not
/// change while the observer is registered; unregister and register again to
/// change them.
///
/// The manager reads bookmarks through [`last_seen`](Self::last_seen) to
/// decide whether to run the observer and how much changeset history to keep.
/// It never updates them itself. An observer is expected to bookmark every
/// component it actually consulted during [`run`](Self::run), through
/// [`Bookmarks::observe`] for read-only inputs and [`Bookmarks::scope`] or
/// [`Bookmarks::track`] for components it also writes.
pub trait Observer<S: StateStore + ?Sized, K> {
    /// The error returned from a failed run.
    type Error;

    /// Components this observer reads, in declaration order.
    fn observed(&self) -> &[S::Key];

    /// Components this observer may write, in declaration order.
    fn modified(&self) -> &[S::Key];

    /// Performs the observer's application logic.
    ///
    /// Writing a modified component should advance its version.
    fn run(&mut self, cx: &mut NotifyContext<'_, S, K>) -> Result<(), Self::Error>;

    /// Returns the token this observer last recorded for `component`.
    fn last_seen(&self, component: S::Key) -> VersionToken;

    /// Records `token` as the last seen version of `component`.
    fn set_last_seen(&mut self, component: S::Key, token: VersionToken);
}

/// Last-seen version tokens, one per observed component.
///
/// Components are kept in declaration order with a parallel token array.
/// Every bookmark starts as [`VersionToken::UNSEEN`].
///
/// There are two ways to advance a bookmark from inside a run:
///
/// - [`observe`](Self::observe) for components the run only reads: the
///   bookmark moves to the current token immediately.
/// - [`scope`](Self::scope) or [`track`](Self::track) for components the run
///   may also write: the bookmark moves to the token the component has when
///   the scope closes, so the observer's own writes are not reported back to
///   it on the next cycle.
///
/// # Example
///
/// ```
/// use understory_notify::{Bookmarks, ChangeSeverity, StateComponent, Versioned};
///
/// let mut doc = Versioned::<String>::new(1, String::new());
/// let mut bookmarks = Bookmarks::new(["doc"]);
///
/// // First look: nothing was seen before.
/// assert_eq!(bookmarks.observe("doc", &doc), ChangeSeverity::Complete);
/// assert_eq!(bookmarks.get("doc"), doc.version_token());
/// assert_eq!(bookmarks.observe("doc", &doc), ChangeSeverity::None);
///
/// doc.touch(|s| s.push('!'));
/// assert_eq!(bookmarks.observe("doc", &doc), ChangeSeverity::Complete);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bookmarks<C> {
    components: SmallVec<[C; 4]>,
    tokens: SmallVec<[VersionToken; 4]>,
}

impl<C: Copy + PartialEq> Bookmarks<C> {
    /// Creates unseen bookmarks for the given components.
    ///
    /// Duplicates are ignored.
    #[must_use]
    pub fn new(observed: impl IntoIterator<Item = C>) -> Self {
        let mut components: SmallVec<[C; 4]> = SmallVec::new();
        for c in observed {
            if !components.contains(&c) {
                components.push(c);
            }
        }
        let tokens = components.iter().map(|_| VersionToken::UNSEEN).collect();
        Self { components, tokens }
    }

    /// Returns the bookmarked components in declaration order.
    #[must_use]
    pub fn components(&self) -> &[C] {
        &self.components
    }

    /// Iterates `(component, token)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (C, VersionToken)> + '_ {
        self.components.iter().copied().zip(self.tokens.iter().copied())
    }

    /// Returns the bookmark for `component`.
    ///
    /// Components that are not bookmarked report [`VersionToken::UNSEEN`].
    #[must_use]
    pub fn get(&self, component: C) -> VersionToken {
        self.components
            .iter()
            .position(|&c| c == component)
            .map_or(VersionToken::UNSEEN, |i| self.tokens[i])
    }

    /// Sets the bookmark for `component`.
    ///
    /// Returns `false` (and stores nothing) if `component` is not bookmarked.
    pub fn set(&mut self, component: C, token: VersionToken) -> bool {
        match self.components.iter().position(|&c| c == component) {
            Some(i) => {
                self.tokens[i] = token;
                true
            }
            None => false,
        }
    }

    /// Returns how much `component` changed since its bookmark and advances
    /// the bookmark to the component's current token.
    ///
    /// A write made to the component after this call is reported as a change
    /// on the next cycle; use [`scope`](Self::scope) around such writes.
    pub fn observe(&mut self, component: C, state: &dyn StateComponent) -> ChangeSeverity {
        let severity = state.change_severity(self.get(component));
        self.set(component, state.version_token());
        severity
    }

    /// [`observe`](Self::observe) for a component looked up in `state`.
    ///
    /// Returns `None`, leaving the bookmark alone, if the store has no such
    /// component.
    pub fn observe_in<S>(&mut self, state: &S, component: C) -> Option<ChangeSeverity>
    where
        S: StateStore<Key = C> + ?Sized,
    {
        let found = state.component(component)?;
        Some(self.observe(component, found))
    }

    /// Opens a bookmark scope for `component`.
    ///
    /// The change severity is computed now, against the stored bookmark. The
    /// returned guard derefs to the context, so the run can go on reading and
    /// writing state through it. When the guard is dropped, including while
    /// unwinding, the bookmark is advanced to the token the component has at
    /// that point.
    ///
    /// Returns `None` if the store has no such component.
    pub fn scope<'a, 'cx, S, K>(
        &'a mut self,
        cx: &'a mut NotifyContext<'cx, S, K>,
        component: C,
    ) -> Option<BookmarkScope<'a, 'cx, S, K>>
    where
        S: StateStore<Key = C> + ?Sized,
        K: Copy,
    {
        let found = cx.state().component(component)?;
        let previous = self.get(component);
        let severity = found.change_severity(previous);
        Some(BookmarkScope {
            bookmarks: self,
            cx,
            component,
            previous,
            severity,
        })
    }

    /// Runs `f` with the change severity of `component`, then advances the
    /// bookmark to the component's token after `f`.
    ///
    /// This is the closure form of [`scope`](Self::scope). Returns `None`
    /// without calling `f` if the store has no such component.
    ///
    /// # Example
    ///
    /// ```
    /// use hashbrown::HashMap;
    /// use understory_notify::{Bookmarks, ChangeSeverity, NotifyContext, Versioned};
    ///
    /// type State = HashMap<&'static str, Versioned<u32, u32>>;
    ///
    /// let mut state = State::new();
    /// state.insert("total", Versioned::new(1, 0));
    /// let mut bookmarks = Bookmarks::new(["total"]);
    /// let mut cx = NotifyContext::new(&mut state, (), 1);
    ///
    /// // An accumulator reads and writes the same component.
    /// bookmarks.track(&mut cx, "total", |cx, severity| {
    ///     assert_eq!(severity, ChangeSeverity::Complete);
    ///     if let Some(total) = cx.state_mut().get_mut("total") {
    ///         total.modify(5, |v| *v += 5);
    ///     }
    /// });
    ///
    /// // Its own write is already absorbed.
    /// let next = bookmarks.track(&mut cx, "total", |_, severity| severity);
    /// assert_eq!(next, Some(ChangeSeverity::None));
    /// ```
    pub fn track<S, K, R, F>(
        &mut self,
        cx: &mut NotifyContext<'_, S, K>,
        component: C,
        f: F,
    ) -> Option<R>
    where
        S: StateStore<Key = C> + ?Sized,
        K: Copy,
        F: FnOnce(&mut NotifyContext<'_, S, K>, ChangeSeverity) -> R,
    {
        let mut scope = self.scope(cx, component)?;
        let severity = scope.severity;
        Some(f(&mut *scope, severity))
    }
}

/// Guard returned by [`Bookmarks::scope`].
///
/// Derefs to the [`NotifyContext`] it was opened on. Writes the component's
/// token at drop time back to the bookmark; if the component is gone by then,
/// the bookmark is left as it was.
pub struct BookmarkScope<'a, 'cx, S, K>
where
    S: StateStore + ?Sized,
    K: Copy,
{
    bookmarks: &'a mut Bookmarks<S::Key>,
    cx: &'a mut NotifyContext<'cx, S, K>,
    component: S::Key,
    previous: VersionToken,
    severity: ChangeSeverity,
}

impl<S, K> BookmarkScope<'_, '_, S, K>
where
    S: StateStore + ?Sized,
    K: Copy,
{
    /// How much changed since the previous bookmark.
    #[must_use]
    pub fn severity(&self) -> ChangeSeverity {
        self.severity
    }

    /// The bookmark held before this scope was opened.
    #[must_use]
    pub fn previous(&self) -> VersionToken {
        self.previous
    }

    /// The bookmarked component.
    #[must_use]
    pub fn component(&self) -> S::Key {
        self.component
    }
}

impl<'cx, S, K> Deref for BookmarkScope<'_, 'cx, S, K>
where
    S: StateStore + ?Sized,
    K: Copy,
{
    type Target = NotifyContext<'cx, S, K>;

    fn deref(&self) -> &Self::Target {
        self.cx
    }
}

impl<S, K> DerefMut for BookmarkScope<'_, '_, S, K>
where
    S: StateStore + ?Sized,
    K: Copy,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.cx
    }
}

impl<S, K> Drop for BookmarkScope<'_, '_, S, K>
where
    S: StateStore + ?Sized,
    K: Copy,
{
    fn drop(&mut self) {
        if let Some(found) = self.cx.state().component(self.component) {
            let seen = found.version_token();
            self.bookmarks.set(self.component, seen);
        }
    }
}

impl<S, K> fmt::Debug for BookmarkScope<'_, '_, S, K>
where
    S: StateStore + ?Sized,
    K: Copy + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BookmarkScope")
            .field("component", &self.component)
            .field("previous", &self.previous)
            .field("severity", &self.severity)
            .field("cx", &self.cx)
            .finish_non_exhaustive()
    }
}

/// A closure-backed [`Observer`].
///
/// Owns its declared sets and bookmarks; the closure receives the call
/// context and the bookmarks on every run.
///
/// # Example
///
/// ```
/// use understory_notify::{Bookmarks, FnObserver, NotifyContext, Observer, Versioned};
/// use hashbrown::HashMap;
///
/// type State = HashMap<&'static str, Versioned<u32>>;
///
/// let mut observer = FnObserver::new(
///     ["input"],
///     [],
///     |cx: &mut NotifyContext<'_, State, u8>, bookmarks: &mut Bookmarks<&'static str>| {
///         if let Some(scope) = bookmarks.scope(cx, "input") {
///             assert!(scope.severity().is_changed());
///         }
///         Ok::<(), ()>(())
///     },
/// );
///
/// let mut state = State::new();
/// state.insert("input", Versioned::new(1, 0));
/// observer.run(&mut NotifyContext::new(&mut state, 0, 1)).unwrap();
/// assert_eq!(observer.last_seen("input").identity(), 1);
/// ```
pub struct FnObserver<S: StateStore + ?Sized, K, E, F> {
    sets: ObserverSets<S::Key>,
    bookmarks: Bookmarks<S::Key>,
    run: F,
    _marker: PhantomData<fn(&mut S, K) -> E>,
}

impl<S, K, E, F> FnObserver<S, K, E, F>
where
    S: StateStore + ?Sized,
    F: FnMut(&mut NotifyContext<'_, S, K>, &mut Bookmarks<S::Key>) -> Result<(), E>,
{
    /// Creates an observer from its declared sets and run closure.
    #[must_use]
    pub fn new(
        observed: impl IntoIterator<Item = S::Key>,
        modified: impl IntoIterator<Item = S::Key>,
        run: F,
    ) -> Self {
        let sets = ObserverSets::new(observed, modified);
        let bookmarks = Bookmarks::new(sets.observed().iter().copied());
        Self {
            sets,
            bookmarks,
            run,
            _marker: PhantomData,
        }
    }

    /// Returns the observer's bookmarks.
    #[must_use]
    pub fn bookmarks(&self) -> &Bookmarks<S::Key> {
        &self.bookmarks
    }
}

impl<S, K, E, F> Observer<S, K> for FnObserver<S, K, E, F>
where
    S: StateStore + ?Sized,
    F: FnMut(&mut NotifyContext<'_, S, K>, &mut Bookmarks<S::Key>) -> Result<(), E>,
{
    type Error = E;

    fn observed(&self) -> &[S::Key] {
        self.sets.observed()
    }

    fn modified(&self) -> &[S::Key] {
        self.sets.modified()
    }

    fn run(&mut self, cx: &mut NotifyContext<'_, S, K>) -> Result<(), E> {
        (self.run)(cx, &mut self.bookmarks)
    }

    fn last_seen(&self, component: S::Key) -> VersionToken {
        self.bookmarks.get(component)
    }

    fn set_last_seen(&mut self, component: S::Key, token: VersionToken) {
        self.bookmarks.set(component, token);
    }
}

impl<S: StateStore + ?Sized, K, E, F> fmt::Debug for FnObserver<S, K, E, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnObserver")
            .field("sets", &self.sets)
            .field("bookmarks", &self.bookmarks)
            .finish_non_exhaustive()
    }
}
