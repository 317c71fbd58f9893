// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The notification manager: registry, cached order and per-cycle pass.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt::{self, Debug};
use core::hash::Hash;

use hashbrown::{HashMap, HashSet};

use crate::component::StateStore;
use crate::context::NotifyContext;
use crate::observer::Observer;
use crate::order::{CyclePolicy, CycleReport, ExecutionOrder, ObserverSets, sort_observers};
use crate::scratch::NotifyScratch;

/// A registered observer, boxed for storage in the manager.
pub type BoxedObserver<S, K, E> = Box<dyn Observer<S, K, Error = E>>;

/// Error returned when an observer key is registered twice.
///
/// The failed registration leaves the manager unchanged.
#[derive(Clone, PartialEq, Eq)]
pub struct RegisterError<K, C> {
    /// The observer key that is already registered.
    pub observer: K,
    /// An observed component the key is already registered against, if the
    /// duplicate was found in a per-component list.
    pub component: Option<C>,
}

impl<K: Debug, C: Debug> Debug for RegisterError<K, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RegisterError {{ observer: {:?}, component: {:?} }}",
            self.observer, self.component
        )
    }
}

impl<K: Debug, C: Debug> fmt::Display for RegisterError<K, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.component {
            Some(component) => write!(
                f,
                "observer {:?} is already registered against component {:?}",
                self.observer, component
            ),
            None => write!(f, "observer {:?} is already registered", self.observer),
        }
    }
}

impl<K: Debug, C: Debug> core::error::Error for RegisterError<K, C> {}

/// Error returned when an observer's run fails.
///
/// Observers after the failing one in that cycle's call list were not run,
/// and the changeset purge for the cycle was skipped.
#[derive(Clone, PartialEq, Eq)]
pub struct NotifyError<K, E> {
    /// The observer whose run failed.
    pub observer: K,
    /// The error it returned.
    pub error: E,
}

impl<K, E> NotifyError<K, E> {
    /// Returns the observer's error.
    pub fn into_inner(self) -> E {
        self.error
    }
}

impl<K: Debug, E: Debug> Debug for NotifyError<K, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NotifyError {{ observer: {:?}, error: {:?} }}",
            self.observer, self.error
        )
    }
}

impl<K: Debug, E: fmt::Display> fmt::Display for NotifyError<K, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer {:?} failed: {}", self.observer, self.error)
    }
}

impl<K: Debug, E: core::error::Error + 'static> core::error::Error for NotifyError<K, E> {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// What a call to [`NotifyManager::notify`] did.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// A cycle was already in flight; nothing happened.
    Reentrant,
    /// The cycle ran to completion.
    Completed {
        /// Number of observers invoked.
        invoked: usize,
        /// Whether the changeset purge pass ran.
        purged: bool,
    },
}

impl NotifyOutcome {
    /// Returns the number of observers invoked.
    #[must_use]
    pub fn invoked(self) -> usize {
        match self {
            Self::Reentrant => 0,
            Self::Completed { invoked, .. } => invoked,
        }
    }
}

struct Registration<S: StateStore + ?Sized, K, E> {
    observer: BoxedObserver<S, K, E>,
    sets: ObserverSets<S::Key>,
}

/// Observers that declared a component as observed, in registration order.
#[derive(Debug)]
struct Subscribers<C, K> {
    component: C,
    observers: Vec<K>,
}

/// Observer storage plus the component -> observers mapping.
struct Registry<S: StateStore + ?Sized, K, E> {
    entries: HashMap<K, Registration<S, K, E>>,
    /// Keys in registration order.
    registered: Vec<K>,
    /// One entry per observed component, in first-registration order.
    subscribers: Vec<Subscribers<S::Key, K>>,
    index: HashMap<S::Key, usize>,
}

impl<S, K, E> Registry<S, K, E>
where
    S: StateStore + ?Sized,
    K: Copy + Eq + Hash + Debug,
{
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            registered: Vec::new(),
            subscribers: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            registered: Vec::with_capacity(capacity),
            subscribers: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
        }
    }

    fn subscribers_of(&self, component: S::Key) -> &[K] {
        self.index
            .get(&component)
            .map_or(&[], |&i| self.subscribers[i].observers.as_slice())
    }

    fn insert(&mut self, key: K, registration: Registration<S, K, E>) {
        for &component in registration.sets.observed() {
            let i = *self.index.entry(component).or_insert_with(|| {
                self.subscribers.push(Subscribers {
                    component,
                    observers: Vec::new(),
                });
                self.subscribers.len() - 1
            });
            self.subscribers[i].observers.push(key);
        }
        self.registered.push(key);
        self.entries.insert(key, registration);
    }

    /// Removes `key` from every list it appears in.
    ///
    /// Does not trust the observer's declared sets: every per-component list
    /// is scanned.
    fn remove(&mut self, key: K) -> Option<Registration<S, K, E>> {
        let mut emptied = false;
        for entry in &mut self.subscribers {
            entry.observers.retain(|&k| k != key);
            emptied |= entry.observers.is_empty();
        }
        if emptied {
            self.subscribers.retain(|entry| !entry.observers.is_empty());
            self.index.clear();
            for (i, entry) in self.subscribers.iter().enumerate() {
                self.index.insert(entry.component, i);
            }
        }
        self.registered.retain(|&k| k != key);
        self.entries.remove(&key)
    }

    /// Distinct observers in first-seen order across components, followed by
    /// observers that observe nothing, in registration order.
    fn working_list(&self) -> Vec<(K, &ObserverSets<S::Key>)> {
        let mut seen: HashSet<K> = HashSet::with_capacity(self.entries.len());
        let mut out = Vec::with_capacity(self.entries.len());
        let by_component = self
            .subscribers
            .iter()
            .flat_map(|entry| entry.observers.iter().copied());
        for key in by_component.chain(self.registered.iter().copied()) {
            if !seen.insert(key) {
                continue;
            }
            if let Some(registration) = self.entries.get(&key) {
                out.push((key, &registration.sets));
            }
        }
        out
    }

    /// The oldest counter any observer of `component` may still need.
    ///
    /// Every registered bookmark counts, including ones taken against an
    /// earlier identity. Never exceeds the current counter.
    fn earliest_needed(&self, component: S::Key, current: u64) -> u64 {
        self.subscribers_of(component)
            .iter()
            .filter_map(|key| self.entries.get(key))
            .map(|registration| registration.observer.last_seen(component).counter())
            .fold(current, u64::min)
    }

    fn purge_changesets(&self, state: &mut S, live: &[S::Key]) {
        for &component in live {
            let Some(store) = state.component_mut(component) else {
                log::trace!("live component {component:?} is not in the state store");
                continue;
            };
            let current = store.current_version();
            let earliest = self.earliest_needed(component, current);
            log::trace!("purging changesets of {component:?} before {earliest}");
            store.purge_changesets_before(earliest, current);
        }
    }
}

/// Returns `true` if `component` changed since the observer's bookmark.
fn observed_change<S, K, E>(state: &S, registration: &Registration<S, K, E>, component: S::Key) -> bool
where
    S: StateStore + ?Sized,
{
    match state.component(component) {
        Some(found) => found
            .change_severity(registration.observer.last_seen(component))
            .is_changed(),
        None => {
            log::trace!("observed component {component:?} is not in the state store");
            false
        }
    }
}

/// Runs observers in dependency order, only when their inputs changed.
///
/// The manager owns registered observers, keyed by a host-chosen `K`. It
/// derives an execution order from the observers' declared sets, caches it
/// until the registry changes, and on each [`notify`](Self::notify) call:
///
/// 1. Builds the call list: an observer is called if it was registered since
///    the last cycle, if an observer earlier in this cycle's call list
///    declared a component it observes as modified, or if any observed
///    component changed since its bookmark.
/// 2. Runs the call list in order, stopping at the first error.
/// 3. If every run succeeded and at least one observer ran, lets every live
///    component drop changeset history older than its oldest bookmark.
///
/// # Type Parameters
///
/// - `S`: The host's [`StateStore`].
/// - `K`: The observer key. Must be `Copy + Eq + Hash + Debug`.
/// - `E`: The error type observers return.
///
/// # Example
///
/// ```
/// use hashbrown::HashMap;
/// use understory_notify::{
///     Bookmarks, NotifyContext, NotifyManager, Observer, Versioned, VersionToken,
/// };
///
/// type State = HashMap<&'static str, Versioned<i32, i32>>;
///
/// /// Copies `celsius` into `fahrenheit`.
/// struct Convert {
///     bookmarks: Bookmarks<&'static str>,
/// }
///
/// impl Observer<State, u32> for Convert {
///     type Error = core::convert::Infallible;
///
///     fn observed(&self) -> &[&'static str] {
///         &["celsius"]
///     }
///
///     fn modified(&self) -> &[&'static str] {
///         &["fahrenheit"]
///     }
///
///     fn run(&mut self, cx: &mut NotifyContext<'_, State, u32>) -> Result<(), Self::Error> {
///         let celsius = *cx.state()["celsius"].get();
///         self.bookmarks.observe_in(cx.state(), "celsius");
///         let fahrenheit = celsius * 9 / 5 + 32;
///         cx.state_mut()
///             .get_mut("fahrenheit")
///             .unwrap()
///             .modify(fahrenheit, |v| *v = fahrenheit);
///         Ok(())
///     }
///
///     fn last_seen(&self, component: &'static str) -> VersionToken {
///         self.bookmarks.get(component)
///     }
///
///     fn set_last_seen(&mut self, component: &'static str, token: VersionToken) {
///         self.bookmarks.set(component, token);
///     }
/// }
///
/// let mut state = State::new();
/// state.insert("celsius", Versioned::new(1, 100));
/// state.insert("fahrenheit", Versioned::new(2, 0));
/// let live = ["celsius", "fahrenheit"];
///
/// let mut manager = NotifyManager::new();
/// manager
///     .register(0, Convert { bookmarks: Bookmarks::new(["celsius"]) })
///     .unwrap();
///
/// // A new observer always runs once.
/// assert_eq!(manager.notify(&mut state, &live).unwrap().invoked(), 1);
/// assert_eq!(*state["fahrenheit"].get(), 212);
///
/// // Nothing changed since.
/// assert_eq!(manager.notify(&mut state, &live).unwrap().invoked(), 0);
///
/// state.get_mut("celsius").unwrap().modify(-100, |v| *v = 0);
/// assert_eq!(manager.notify(&mut state, &live).unwrap().invoked(), 1);
/// assert_eq!(*state["fahrenheit"].get(), 32);
/// ```
pub struct NotifyManager<S, K, E>
where
    S: StateStore + ?Sized,
    K: Copy + Eq + Hash + Debug,
{
    registry: Registry<S, K, E>,
    order: ExecutionOrder<K>,
    order_valid: bool,
    /// Registered since the last cycle; guaranteed one run.
    first_run: HashSet<K>,
    scratch: NotifyScratch<K, S::Key>,
    cycle_policy: CyclePolicy,
    cycle: u64,
}

impl<S, K, E> Default for NotifyManager<S, K, E>
where
    S: StateStore + ?Sized,
    K: Copy + Eq + Hash + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S, K, E> NotifyManager<S, K, E>
where
    S: StateStore + ?Sized,
    K: Copy + Eq + Hash + Debug,
{
    /// Creates an empty manager with the default cycle policy.
    #[must_use]
    pub fn new() -> Self {
        Self::with_cycle_policy(CyclePolicy::default())
    }

    /// Creates an empty manager with the given cycle policy.
    #[must_use]
    pub fn with_cycle_policy(cycle_policy: CyclePolicy) -> Self {
        Self {
            registry: Registry::new(),
            order: ExecutionOrder::empty(),
            order_valid: true,
            first_run: HashSet::new(),
            scratch: NotifyScratch::new(),
            cycle_policy,
            cycle: 0,
        }
    }

    /// Creates an empty manager with room for `capacity` observers.
    ///
    /// `capacity` is a best-effort hint for the registry and the per-cycle
    /// scratch buffers.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            registry: Registry::with_capacity(capacity),
            scratch: NotifyScratch::with_capacity(capacity),
            first_run: HashSet::with_capacity(capacity),
            ..Self::new()
        }
    }

    /// Returns the current cycle policy.
    #[must_use]
    pub fn cycle_policy(&self) -> CyclePolicy {
        self.cycle_policy
    }

    /// Sets how cycles found by future order rebuilds are reported.
    pub fn set_cycle_policy(&mut self, policy: CyclePolicy) {
        self.cycle_policy = policy;
    }

    /// Registers `observer` under `key`.
    ///
    /// The observer's declared sets are captured now and must not change
    /// while it stays registered. It is guaranteed to run in the next cycle.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError`] if `key` is already registered. Nothing is
    /// changed in that case.
    pub fn register<O>(&mut self, key: K, observer: O) -> Result<(), RegisterError<K, S::Key>>
    where
        O: Observer<S, K, Error = E> + 'static,
    {
        self.register_boxed(key, Box::new(observer))
    }

    /// Registers an already boxed observer under `key`.
    ///
    /// # Errors
    ///
    /// See [`register`](Self::register).
    pub fn register_boxed(
        &mut self,
        key: K,
        observer: BoxedObserver<S, K, E>,
    ) -> Result<(), RegisterError<K, S::Key>> {
        let sets = ObserverSets::new(
            observer.observed().iter().copied(),
            observer.modified().iter().copied(),
        );

        if let Some(&component) = sets
            .observed()
            .iter()
            .find(|&&c| self.registry.subscribers_of(c).contains(&key))
        {
            return Err(RegisterError {
                observer: key,
                component: Some(component),
            });
        }
        if self.registry.entries.contains_key(&key) {
            return Err(RegisterError {
                observer: key,
                component: None,
            });
        }

        log::trace!(
            "registering observer {key:?}: observes {:?}, modifies {:?}",
            sets.observed(),
            sets.modified()
        );
        self.registry.insert(key, Registration { observer, sets });
        self.first_run.insert(key);
        self.invalidate_order();
        Ok(())
    }

    /// Unregisters the observer under `key` and returns it.
    ///
    /// The key is removed from every per-component list, whatever the
    /// observer currently declares. Returns `None` if `key` was not
    /// registered.
    pub fn unregister(&mut self, key: K) -> Option<BoxedObserver<S, K, E>> {
        let removed = self.registry.remove(key);
        self.first_run.remove(&key);
        self.invalidate_order();
        if removed.is_some() {
            log::trace!("unregistered observer {key:?}");
        }
        removed.map(|registration| registration.observer)
    }

    /// Returns `true` if an observer is registered under `key`.
    #[must_use]
    pub fn contains(&self, key: K) -> bool {
        self.registry.entries.contains_key(&key)
    }

    /// Returns the number of registered observers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.entries.len()
    }

    /// Returns `true` if no observers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registry.entries.is_empty()
    }

    /// Returns the observer registered under `key`.
    #[must_use]
    pub fn observer(&self, key: K) -> Option<&(dyn Observer<S, K, Error = E> + 'static)> {
        self.registry
            .entries
            .get(&key)
            .map(|registration| &*registration.observer)
    }

    /// Returns the observer registered under `key` mutably.
    ///
    /// Useful for seeding or inspecting bookmarks; the declared sets must
    /// not be changed through it.
    #[must_use]
    pub fn observer_mut(
        &mut self,
        key: K,
    ) -> Option<&mut (dyn Observer<S, K, Error = E> + 'static)> {
        self.registry
            .entries
            .get_mut(&key)
            .map(|registration| &mut *registration.observer)
    }

    /// Returns the observers registered against `component`, in registration
    /// order.
    #[must_use]
    pub fn observers_of(&self, component: S::Key) -> &[K] {
        self.registry.subscribers_of(component)
    }

    /// Returns `true` if `key` has not had its guaranteed first run yet.
    #[must_use]
    pub fn is_pending_first_run(&self, key: K) -> bool {
        self.first_run.contains(&key)
    }

    /// Returns `true` if the cached execution order is up to date.
    #[must_use]
    pub fn is_order_valid(&self) -> bool {
        self.order_valid
    }

    /// Discards the cached execution order; the next use rebuilds it.
    pub fn invalidate_order(&mut self) {
        self.order_valid = false;
    }

    /// Returns the execution order, rebuilding it if it was invalidated.
    pub fn execution_order(&mut self) -> &ExecutionOrder<K> {
        self.refresh_order();
        &self.order
    }

    /// Returns the cycles found by the most recent order rebuild.
    #[must_use]
    pub fn cycle_reports(&self) -> &[CycleReport<K>] {
        self.order.cycles()
    }

    /// Returns `true` while a notify cycle is in flight.
    ///
    /// [`notify`](Self::notify) borrows the manager mutably and clears the flag
    /// on every exit path, unwinding included, so any caller able to borrow
    /// the manager sees `false`. The flag is what backs the
    /// [`NotifyOutcome::Reentrant`] no-op.
    #[must_use]
    pub fn is_notifying(&self) -> bool {
        self.scratch.in_cycle()
    }

    /// Returns the number of notify cycles started so far.
    #[must_use]
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    fn refresh_order(&mut self) {
        if self.order_valid {
            return;
        }
        let working = self.registry.working_list();
        self.order = sort_observers(working, self.cycle_policy);
        self.order_valid = true;
        log::debug!(
            "rebuilt observer order: {} observers, {} stalled passes",
            self.order.len(),
            self.order.cycles().len()
        );
    }

    /// Runs one notification cycle over the host state.
    ///
    /// `live` must enumerate every currently live component so the purge
    /// pass can consider components no observer is dirty on.
    ///
    /// Returns [`NotifyOutcome::Reentrant`] without doing anything if a
    /// cycle is already in flight.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError`] with the first observer error. Observers after
    /// it are not run and no changesets are purged. The manager is ready for
    /// the next call either way.
    pub fn notify(&mut self, state: &mut S, live: &[S::Key]) -> Result<NotifyOutcome, NotifyError<K, E>> {
        if self.scratch.in_cycle() {
            log::debug!("notify called during an active cycle, ignoring");
            return Ok(NotifyOutcome::Reentrant);
        }
        self.refresh_order();
        self.cycle += 1;
        let cycle = self.cycle;

        let Self {
            registry,
            order,
            first_run,
            scratch,
            ..
        } = self;
        let mut guard = scratch.enter();

        for key in order.iter() {
            let Some(registration) = registry.entries.get(&key) else {
                continue;
            };
            let observed = registration.sets.observed();
            let needed = first_run.contains(&key)
                || observed.iter().any(|c| guard.dirty.contains(c))
                || observed
                    .iter()
                    .any(|&c| observed_change(&*state, registration, c));
            if needed {
                guard.call_list.push(key);
                guard
                    .dirty
                    .extend(registration.sets.modified().iter().copied());
            }
        }
        first_run.clear();

        if guard.call_list.is_empty() {
            log::trace!("cycle {cycle}: no observers to run");
            return Ok(NotifyOutcome::Completed {
                invoked: 0,
                purged: false,
            });
        }

        for &key in &guard.call_list {
            let Some(registration) = registry.entries.get_mut(&key) else {
                continue;
            };
            let mut cx = NotifyContext::new(&mut *state, key, cycle);
            if let Err(error) = registration.observer.run(&mut cx) {
                log::debug!("cycle {cycle}: observer {key:?} failed, skipping the rest");
                return Err(NotifyError {
                    observer: key,
                    error,
                });
            }
        }

        let invoked = guard.call_list.len();
        registry.purge_changesets(state, live);
        log::debug!("cycle {cycle}: ran {invoked} observers");
        Ok(NotifyOutcome::Completed {
            invoked,
            purged: true,
        })
    }
}

impl<S, K, E> Debug for NotifyManager<S, K, E>
where
    S: StateStore + ?Sized,
    K: Copy + Eq + Hash + Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifyManager")
            .field("observers", &self.registry.registered)
            .field("components", &self.registry.subscribers.len())
            .field("order", &self.order)
            .field("order_valid", &self.order_valid)
            .field("first_run", &self.first_run)
            .field("cycle_policy", &self.cycle_policy)
            .field("cycle", &self.cycle)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::changeset::Versioned;
    use crate::component::StateComponent;
    use crate::observer::{Bookmarks, FnObserver};
    use crate::version::{ChangeSeverity, VersionToken};
    use alloc::rc::Rc;
    use alloc::vec;
    use core::cell::{Cell, RefCell};
    use std::panic::{AssertUnwindSafe, catch_unwind};

    type Key = &'static str;
    type State = HashMap<Key, Versioned<i64, i64>>;
    type Calls = Rc<RefCell<Vec<Key>>>;

    #[derive(Clone, Debug, PartialEq, Eq)]
    struct Failed(Key);

    type Manager = NotifyManager<State, Key, Failed>;

    fn state(components: &[Key]) -> State {
        components
            .iter()
            .enumerate()
            .map(|(i, &name)| (name, Versioned::new(i as u64 + 1, 0)))
            .collect()
    }

    fn bump(state: &mut State, component: Key) {
        state.get_mut(component).unwrap().modify(1, |v| *v += 1);
    }

    /// Records its runs and bookmarks everything it observes, absorbing its
    /// own writes to components it also observes.
    struct Probe {
        name: Key,
        observed: Vec<Key>,
        modified: Vec<Key>,
        bookmarks: Bookmarks<Key>,
        calls: Calls,
        writes: bool,
        fail: Rc<Cell<bool>>,
    }

    impl Probe {
        fn new(name: Key, observed: &[Key], modified: &[Key], calls: &Calls) -> Self {
            Self {
                name,
                observed: observed.to_vec(),
                modified: modified.to_vec(),
                bookmarks: Bookmarks::new(observed.iter().copied()),
                calls: calls.clone(),
                writes: false,
                fail: Rc::new(Cell::new(false)),
            }
        }

        /// Also bumps every modified component when run.
        fn writing(mut self) -> Self {
            self.writes = true;
            self
        }

        fn failing(mut self, fail: &Rc<Cell<bool>>) -> Self {
            self.fail = fail.clone();
            self
        }
    }

    impl Observer<State, Key> for Probe {
        type Error = Failed;

        fn observed(&self) -> &[Key] {
            &self.observed
        }

        fn modified(&self) -> &[Key] {
            &self.modified
        }

        fn run(&mut self, cx: &mut NotifyContext<'_, State, Key>) -> Result<(), Failed> {
            assert_eq!(cx.observer(), self.name);
            self.calls.borrow_mut().push(self.name);
            if self.fail.get() {
                return Err(Failed(self.name));
            }
            for &c in &self.observed {
                let writes = self.writes && self.modified.contains(&c);
                let _ = self.bookmarks.track(cx, c, |cx, _| {
                    if writes {
                        bump(cx.state_mut(), c);
                    }
                });
            }
            if self.writes {
                for &c in &self.modified {
                    if !self.observed.contains(&c) {
                        bump(cx.state_mut(), c);
                    }
                }
            }
            Ok(())
        }

        fn last_seen(&self, component: Key) -> VersionToken {
            self.bookmarks.get(component)
        }

        fn set_last_seen(&mut self, component: Key, token: VersionToken) {
            self.bookmarks.set(component, token);
        }
    }

    fn take(calls: &Calls) -> Vec<Key> {
        core::mem::take(&mut *calls.borrow_mut())
    }

    #[test]
    fn fresh_observer_runs_once_even_without_changes() {
        let calls = Calls::default();
        let mut st = state(&["x"]);
        let mut m = Manager::new();
        m.register("a", Probe::new("a", &["x"], &[], &calls)).unwrap();
        assert!(m.is_pending_first_run("a"));

        let outcome = m.notify(&mut st, &["x"]).unwrap();
        assert_eq!(
            outcome,
            NotifyOutcome::Completed {
                invoked: 1,
                purged: true
            }
        );
        assert_eq!(take(&calls), vec!["a"]);
        assert!(!m.is_pending_first_run("a"));

        let outcome = m.notify(&mut st, &["x"]).unwrap();
        assert_eq!(
            outcome,
            NotifyOutcome::Completed {
                invoked: 0,
                purged: false
            }
        );
        assert!(take(&calls).is_empty());
        assert!(m.scratch.is_clear());
    }

    #[test]
    fn second_notify_without_mutation_is_empty() {
        let calls = Calls::default();
        let mut st = state(&["a", "b"]);
        let mut m = Manager::new();
        m.register("reader", Probe::new("reader", &["b"], &[], &calls)).unwrap();
        m.register("writer", Probe::new("writer", &["a"], &["b"], &calls).writing()).unwrap();

        assert_eq!(m.notify(&mut st, &["a", "b"]).unwrap().invoked(), 2);
        assert_eq!(take(&calls), vec!["writer", "reader"]);

        assert_eq!(m.notify(&mut st, &["a", "b"]).unwrap().invoked(), 0);
        assert!(take(&calls).is_empty());
    }

    #[test]
    fn host_change_propagates_in_dependency_order() {
        let calls = Calls::default();
        let mut st = state(&["a", "b", "c"]);
        let mut m = Manager::new();
        // Registered downstream-first on purpose.
        m.register("c", Probe::new("c", &["c"], &[], &calls)).unwrap();
        m.register("b", Probe::new("b", &["b"], &["c"], &calls).writing()).unwrap();
        m.register("a", Probe::new("a", &["a"], &["b"], &calls).writing()).unwrap();
        m.register("idle", Probe::new("idle", &["z"], &[], &calls)).unwrap();
        m.notify(&mut st, &["a", "b", "c"]).unwrap();
        take(&calls);

        bump(&mut st, "a");
        m.notify(&mut st, &["a", "b", "c"]).unwrap();
        assert_eq!(take(&calls), vec!["a", "b", "c"]);
    }

    #[test]
    fn declared_write_marks_dirty_even_without_a_bump() {
        let calls = Calls::default();
        let mut st = state(&["a", "b"]);
        let mut m = Manager::new();
        // Declares "b" as modified but never writes it.
        m.register("w", Probe::new("w", &["a"], &["b"], &calls)).unwrap();
        m.register("r", Probe::new("r", &["b"], &[], &calls)).unwrap();
        m.notify(&mut st, &["a", "b"]).unwrap();
        take(&calls);

        bump(&mut st, "a");
        m.notify(&mut st, &["a", "b"]).unwrap();
        assert_eq!(take(&calls), vec!["w", "r"]);
        assert_eq!(st["b"].current_version(), 0);
    }

    #[test]
    fn two_cycle_runs_both_and_reports_once() {
        let calls = Calls::default();
        let mut st = state(&["s1", "s2"]);
        let mut m = Manager::new();
        m.register("o1", Probe::new("o1", &["s1"], &["s2"], &calls)).unwrap();
        m.register("o2", Probe::new("o2", &["s2"], &["s1"], &calls)).unwrap();

        assert_eq!(m.notify(&mut st, &["s1", "s2"]).unwrap().invoked(), 2);
        assert_eq!(take(&calls), vec!["o1", "o2"]);
        assert_eq!(m.cycle_reports().len(), 1);
        assert_eq!(m.cycle_reports()[0].unresolved, vec!["o1", "o2"]);

        // The cached order is reused; no second sort.
        assert!(m.is_order_valid());
        m.notify(&mut st, &["s1", "s2"]).unwrap();
        assert_eq!(m.cycle_reports().len(), 1);
    }

    #[test]
    fn self_modifying_observer_absorbs_its_own_write() {
        let calls = Calls::default();
        let mut st = state(&["x"]);
        let mut m = Manager::new();
        m.register("acc", Probe::new("acc", &["x"], &["x"], &calls).writing()).unwrap();

        assert_eq!(m.execution_order().as_slice(), &["acc"]);
        assert!(m.cycle_reports().is_empty());

        m.notify(&mut st, &["x"]).unwrap();
        assert_eq!(st["x"].current_version(), 1);
        let seen = m.observer("acc").unwrap().last_seen("x");
        assert_eq!(seen, st["x"].version_token());
        assert_eq!(st["x"].change_severity(seen), ChangeSeverity::None);
        assert_eq!(take(&calls), vec!["acc"]);
    }

    #[test]
    fn self_modifying_observer_idles_without_host_changes() {
        let mut st = state(&["x"]);
        let mut m = NotifyManager::<State, Key, ()>::new();
        m.register(
            "acc",
            FnObserver::new(
                ["x"],
                ["x"],
                |cx: &mut NotifyContext<'_, State, Key>, bookmarks: &mut Bookmarks<Key>| {
                    if let Some(mut scope) = bookmarks.scope(cx, "x") {
                        if let Some(x) = scope.state_mut().get_mut("x") {
                            x.modify(1, |v| *v += 1);
                        }
                    }
                    Ok::<(), ()>(())
                },
            ),
        )
        .unwrap();

        let invoked: Vec<usize> = (0..4)
            .map(|_| m.notify(&mut st, &["x"]).unwrap().invoked())
            .collect();
        assert_eq!(invoked, vec![1, 0, 0, 0]);
        assert_eq!(*st["x"].get(), 1);

        // A host write wakes it up again, once.
        bump(&mut st, "x");
        assert_eq!(m.notify(&mut st, &["x"]).unwrap().invoked(), 1);
        assert_eq!(m.notify(&mut st, &["x"]).unwrap().invoked(), 0);
        assert_eq!(*st["x"].get(), 3);
    }

    #[test]
    fn duplicate_registration_is_rejected_without_side_effects() {
        let calls = Calls::default();
        let mut m = Manager::new();
        m.register("a", Probe::new("a", &["x", "y"], &[], &calls)).unwrap();
        m.execution_order();
        assert!(m.is_order_valid());

        let err = m
            .register("a", Probe::new("a", &["y"], &["z"], &calls))
            .unwrap_err();
        assert_eq!(
            err,
            RegisterError {
                observer: "a",
                component: Some("y")
            }
        );

        let err = m
            .register("a", Probe::new("a", &[], &[], &calls))
            .unwrap_err();
        assert_eq!(err.component, None);

        assert_eq!(m.len(), 1);
        assert_eq!(m.observers_of("y"), &["a"]);
        assert!(m.observers_of("z").is_empty());
        assert!(m.is_order_valid());
    }

    #[test]
    fn unregister_removes_from_every_list() {
        let calls = Calls::default();
        let mut st = state(&["x", "y"]);
        let mut m = Manager::new();
        m.register("a", Probe::new("a", &["x", "y"], &[], &calls)).unwrap();
        m.register("b", Probe::new("b", &["x"], &[], &calls)).unwrap();
        m.notify(&mut st, &["x", "y"]).unwrap();
        take(&calls);

        assert!(m.unregister("a").is_some());
        assert!(!m.is_order_valid());
        assert_eq!(m.observers_of("x"), &["b"]);
        assert!(m.observers_of("y").is_empty());
        assert!(m.unregister("a").is_none());

        bump(&mut st, "x");
        bump(&mut st, "y");
        m.notify(&mut st, &["x", "y"]).unwrap();
        assert_eq!(take(&calls), vec!["b"]);
        assert_eq!(m.execution_order().position("a"), None);
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn unregistered_before_first_run_is_never_invoked() {
        let calls = Calls::default();
        let mut st = state(&["x"]);
        let mut m = Manager::new();
        m.register("a", Probe::new("a", &["x"], &[], &calls)).unwrap();
        let observer = m.unregister("a").unwrap();
        assert_eq!(observer.observed(), &["x"]);

        assert_eq!(m.notify(&mut st, &["x"]).unwrap().invoked(), 0);
        assert!(take(&calls).is_empty());
        assert!(m.is_empty());
    }

    #[test]
    fn failing_observer_aborts_the_cycle_and_skips_purge() {
        let calls = Calls::default();
        let fail = Rc::new(Cell::new(true));
        let mut st = state(&["x", "y", "z"]);
        bump(&mut st, "z");

        let mut m = Manager::new();
        m.register("f", Probe::new("f", &["x"], &["y"], &calls).failing(&fail)).unwrap();
        m.register("r", Probe::new("r", &["y"], &[], &calls)).unwrap();

        let err = m.notify(&mut st, &["x", "y", "z"]).unwrap_err();
        assert_eq!(
            err,
            NotifyError {
                observer: "f",
                error: Failed("f")
            }
        );
        assert_eq!(take(&calls), vec!["f"]);
        // No purge: "z" still holds its history.
        assert_eq!(st["z"].changesets().len(), 1);
        assert!(m.scratch.is_clear());

        // The manager is usable again; "r" lost its first-run guarantee but
        // has never bookmarked anything, so it still runs.
        fail.set(false);
        assert_eq!(m.notify(&mut st, &["x", "y", "z"]).unwrap().invoked(), 2);
        assert_eq!(take(&calls), vec!["f", "r"]);
        assert!(st["z"].changesets().is_empty());
    }

    #[test]
    fn panicking_observer_leaves_the_manager_usable() {
        type PanicManager = NotifyManager<State, Key, ()>;

        fn panicky(
            armed: Rc<Cell<bool>>,
        ) -> impl Observer<State, Key, Error = ()> + 'static {
            FnObserver::new(
                ["x"],
                [],
                move |cx: &mut NotifyContext<'_, State, Key>, bookmarks: &mut Bookmarks<Key>| {
                    bookmarks.track(cx, "x", |_, _| {
                        assert!(!armed.get(), "observer exploded");
                    });
                    Ok::<(), ()>(())
                },
            )
        }

        let armed = Rc::new(Cell::new(true));
        let mut st = state(&["x"]);
        let mut m = PanicManager::new();
        m.register("p", panicky(armed.clone())).unwrap();

        let result = catch_unwind(AssertUnwindSafe(|| m.notify(&mut st, &["x"])));
        assert!(result.is_err());
        assert!(m.scratch.is_clear());
        assert!(!m.is_notifying());

        // The scope guard still recorded what the observer saw.
        let seen = m.observer("p").unwrap().last_seen("x");
        assert_eq!(seen, st["x"].version_token());

        armed.set(false);
        bump(&mut st, "x");
        assert_eq!(m.notify(&mut st, &["x"]).unwrap().invoked(), 1);
    }

    #[test]
    fn purge_keeps_history_for_the_oldest_bookmark() {
        let calls = Calls::default();
        let mut st = state(&["x"]);
        let mut m = Manager::new();
        // "reader" runs first and bookmarks x; "acc" then writes x.
        m.register("acc", Probe::new("acc", &["x"], &["x"], &calls).writing()).unwrap();
        m.register("reader", Probe::new("reader", &["x"], &[], &calls)).unwrap();
        assert_eq!(m.execution_order().as_slice(), &["reader", "acc"]);

        m.notify(&mut st, &["x"]).unwrap();
        let reader_seen = m.observer("reader").unwrap().last_seen("x");
        assert_eq!(reader_seen.counter(), 0);
        assert_eq!(st["x"].current_version(), 1);

        // Nothing older than the reader's bookmark is needed; the write
        // after it must survive.
        assert_eq!(st["x"].changesets().base(), 0);
        assert_eq!(st["x"].changesets().len(), 1);
        assert_eq!(st["x"].change_severity(reader_seen), ChangeSeverity::Partial);
    }

    #[test]
    fn purge_never_passes_the_minimum_bookmark() {
        let calls = Calls::default();
        let mut st = state(&["x"]);
        for _ in 0..3 {
            bump(&mut st, "x");
        }
        let identity = st["x"].identity_hash();

        let mut m = Manager::new();
        m.register("a", Probe::new("a", &["x"], &[], &calls)).unwrap();
        // Runs every cycle but never advances its bookmark.
        m.register(
            "lazy",
            FnObserver::new(
                ["x"],
                [],
                |_: &mut NotifyContext<'_, State, Key>, _: &mut Bookmarks<Key>| {
                    Ok::<(), Failed>(())
                },
            ),
        )
        .unwrap();
        m.observer_mut("lazy")
            .unwrap()
            .set_last_seen("x", VersionToken::new(identity, 1));

        m.notify(&mut st, &["x"]).unwrap();
        assert_eq!(m.observer("a").unwrap().last_seen("x").counter(), 3);

        let log = st["x"].changesets();
        assert_eq!(log.base(), 1);
        assert_eq!(log.len(), 2);
        assert_eq!(
            st["x"].change_severity(VersionToken::new(identity, 1)),
            ChangeSeverity::Partial
        );
    }

    #[test]
    fn stale_identity_bookmarks_still_bound_the_purge() {
        let calls = Calls::default();
        let mut st = state(&["x"]);
        bump(&mut st, "x");
        let mut m = Manager::new();
        m.register("a", Probe::new("a", &["x"], &[], &calls)).unwrap();
        m.register(
            "stale",
            FnObserver::new(
                ["x"],
                [],
                |_: &mut NotifyContext<'_, State, Key>, _: &mut Bookmarks<Key>| {
                    Ok::<(), Failed>(())
                },
            ),
        )
        .unwrap();
        // A bookmark from a component that has since been replaced.
        m.observer_mut("stale")
            .unwrap()
            .set_last_seen("x", VersionToken::new(0xdead, 0));

        m.notify(&mut st, &["x"]).unwrap();
        assert_eq!(st["x"].changesets().base(), 0);
        assert_eq!(st["x"].changesets().len(), 1);

        m.observer_mut("stale")
            .unwrap()
            .set_last_seen("x", st["x"].version_token());
        bump(&mut st, "x");
        m.notify(&mut st, &["x"]).unwrap();
        // "stale" runs without bookmarking, so it still holds counter 1.
        assert_eq!(st["x"].changesets().base(), 1);
        assert_eq!(st["x"].changesets().len(), 1);
    }

    #[test]
    fn unobserved_live_components_are_purged_when_a_cycle_runs() {
        let calls = Calls::default();
        let mut st = state(&["x", "orphan"]);
        let mut m = Manager::new();
        m.register("a", Probe::new("a", &["x"], &[], &calls)).unwrap();
        m.notify(&mut st, &["x", "orphan"]).unwrap();

        bump(&mut st, "orphan");
        // Nobody runs, so nothing is purged.
        assert_eq!(
            m.notify(&mut st, &["x", "orphan"]).unwrap(),
            NotifyOutcome::Completed {
                invoked: 0,
                purged: false
            }
        );
        assert_eq!(st["orphan"].changesets().len(), 1);

        bump(&mut st, "x");
        m.notify(&mut st, &["x", "orphan"]).unwrap();
        assert!(st["orphan"].changesets().is_empty());
    }

    #[test]
    fn replaced_component_triggers_a_run() {
        let calls = Calls::default();
        let mut st = state(&["x"]);
        let mut m = Manager::new();
        m.register("a", Probe::new("a", &["x"], &[], &calls)).unwrap();
        m.notify(&mut st, &["x"]).unwrap();
        take(&calls);

        st.get_mut("x").unwrap().reset(0);
        assert_eq!(m.notify(&mut st, &["x"]).unwrap().invoked(), 1);
        assert_eq!(take(&calls), vec!["a"]);
    }

    #[test]
    fn missing_components_do_not_keep_observers_running() {
        let calls = Calls::default();
        let mut st = state(&[]);
        let mut m = Manager::new();
        m.register("ghost", Probe::new("ghost", &["gone"], &[], &calls)).unwrap();
        m.register("blind", Probe::new("blind", &[], &[], &calls)).unwrap();

        assert_eq!(m.notify(&mut st, &["gone"]).unwrap().invoked(), 2);
        assert_eq!(take(&calls), vec!["ghost", "blind"]);
        assert_eq!(m.notify(&mut st, &["gone"]).unwrap().invoked(), 0);
    }

    #[test]
    fn context_carries_the_cycle_number() {
        let cycles = Rc::new(RefCell::new(Vec::new()));
        let record = cycles.clone();
        let mut st = state(&["x"]);
        let mut m = NotifyManager::<State, u8, ()>::with_capacity(4);
        m.register(
            7,
            FnObserver::new(
                ["x"],
                [],
                move |cx: &mut NotifyContext<'_, State, u8>, bookmarks: &mut Bookmarks<Key>| {
                    record.borrow_mut().push((cx.observer(), cx.cycle()));
                    let _ = bookmarks.observe_in(cx.state(), "x");
                    Ok::<(), ()>(())
                },
            ),
        )
        .unwrap();

        m.notify(&mut st, &["x"]).unwrap();
        m.notify(&mut st, &["x"]).unwrap();
        bump(&mut st, "x");
        m.notify(&mut st, &["x"]).unwrap();

        assert_eq!(m.cycle(), 3);
        assert_eq!(*cycles.borrow(), vec![(7, 1), (7, 3)]);
    }

    #[test]
    fn cycle_policy_is_configurable() {
        let calls = Calls::default();
        let mut m = Manager::with_cycle_policy(CyclePolicy::Silent);
        assert_eq!(m.cycle_policy(), CyclePolicy::Silent);
        m.register("o1", Probe::new("o1", &["s1"], &["s2"], &calls)).unwrap();
        m.register("o2", Probe::new("o2", &["s2"], &["s1"], &calls)).unwrap();
        assert!(!m.execution_order().is_acyclic());

        m.set_cycle_policy(CyclePolicy::Warn);
        m.invalidate_order();
        assert_eq!(m.execution_order().len(), 2);
    }
}
