// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Execution order: a cycle-tolerant constrained topological sort.

use alloc::vec::Vec;
use core::fmt::Debug;
use core::hash::Hash;

use hashbrown::HashMap;
use smallvec::SmallVec;

/// Inline capacity for per-observer component sets.
const INLINE_COMPONENTS: usize = 4;

/// The declared read and write sets of one observer.
///
/// Both sets are ordered and deduplicated; the first occurrence of a
/// component wins.
///
/// # Example
///
/// ```
/// use understory_notify::ObserverSets;
///
/// let sets = ObserverSets::new([1, 2, 1], [2]);
/// assert_eq!(sets.observed(), &[1, 2]);
/// assert!(sets.is_self_modifying());
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObserverSets<C> {
    observed: SmallVec<[C; INLINE_COMPONENTS]>,
    modified: SmallVec<[C; INLINE_COMPONENTS]>,
}

fn dedup_ordered<C: PartialEq>(
    items: impl IntoIterator<Item = C>,
) -> SmallVec<[C; INLINE_COMPONENTS]> {
    let mut out = SmallVec::new();
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

impl<C: Copy + PartialEq> ObserverSets<C> {
    /// Builds the sets from declared observed and modified components.
    #[must_use]
    pub fn new(observed: impl IntoIterator<Item = C>, modified: impl IntoIterator<Item = C>) -> Self {
        Self {
            observed: dedup_ordered(observed),
            modified: dedup_ordered(modified),
        }
    }

    /// Components the observer reads.
    #[must_use]
    pub fn observed(&self) -> &[C] {
        &self.observed
    }

    /// Components the observer may write.
    #[must_use]
    pub fn modified(&self) -> &[C] {
        &self.modified
    }

    /// Returns `true` if the observer reads `component`.
    #[must_use]
    pub fn observes(&self, component: C) -> bool {
        self.observed.contains(&component)
    }

    /// Returns `true` if the observer may write `component`.
    #[must_use]
    pub fn modifies(&self, component: C) -> bool {
        self.modified.contains(&component)
    }

    /// Returns `true` if some component is both observed and modified.
    ///
    /// Such observers are scheduled in a relaxed pass that lets them see
    /// their own prior writes without counting as a cycle.
    #[must_use]
    pub fn is_self_modifying(&self) -> bool {
        self.observed.iter().any(|c| self.modified.contains(c))
    }
}

/// How a dependency cycle found while ordering observers is reported.
///
/// A cycle never stops scheduling: the unresolved observers are appended in
/// their declared order regardless of the policy.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum CyclePolicy {
    /// Emit a `log::warn!` for each stalled pass.
    #[default]
    Warn,
    /// Panic in debug builds, warn in release builds.
    DebugAssert,
    /// Record the cycle in the [`ExecutionOrder`] without logging.
    Silent,
}

/// Observers a sorting pass could not linearize.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CycleReport<K> {
    /// The pass tolerance: `0` for normal observers, `1` for self-modifying ones.
    pub tolerance: usize,
    /// The unresolved observers, in the fallback order they were appended.
    pub unresolved: Vec<K>,
}

/// A linear execution order for registered observers.
///
/// Produced by [`sort_observers`]. If any pass stalled on a cycle, the order
/// still contains every observer and [`cycles`](Self::cycles) describes the
/// stall.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionOrder<K> {
    order: Vec<K>,
    cycles: Vec<CycleReport<K>>,
}

impl<K: Copy + Eq> ExecutionOrder<K> {
    pub(crate) fn empty() -> Self {
        Self {
            order: Vec::new(),
            cycles: Vec::new(),
        }
    }

    /// Returns the order as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[K] {
        &self.order
    }

    /// Iterates the observers in execution order.
    pub fn iter(&self) -> impl Iterator<Item = K> + '_ {
        self.order.iter().copied()
    }

    /// Returns the number of ordered observers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns `true` if no observers are ordered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Returns the position of `key` in the order.
    #[must_use]
    pub fn position(&self, key: K) -> Option<usize> {
        self.order.iter().position(|&k| k == key)
    }

    /// Returns one report per stalled pass.
    #[must_use]
    pub fn cycles(&self) -> &[CycleReport<K>] {
        &self.cycles
    }

    /// Returns `true` if both passes linearized all their observers.
    #[must_use]
    pub fn is_acyclic(&self) -> bool {
        self.cycles.is_empty()
    }
}

/// Computes an execution order from each observer's declared sets.
///
/// `observers` is the working list: distinct observers in a deterministic
/// order. It is split into normal observers and self-modifying ones (see
/// [`ObserverSets::is_self_modifying`]). Normal observers are sorted first
/// with tolerance 0, then self-modifying observers with tolerance 1, and the
/// two results are concatenated.
///
/// Within a pass, an observer is ready once every component it observes is
/// still pending modification by at most `tolerance` unscheduled observers of
/// that pass. When a full scan schedules nothing, the remaining observers are
/// appended in their current relative order and the stall is reported per
/// `policy`.
///
/// # Example
///
/// ```
/// use understory_notify::{CyclePolicy, ObserverSets, sort_observers};
///
/// // "layout" reads 1 and writes 2; "paint" reads 2.
/// let layout = ObserverSets::new([1], [2]);
/// let paint = ObserverSets::new([2], []);
///
/// let order = sort_observers([("paint", &paint), ("layout", &layout)], CyclePolicy::Silent);
/// assert_eq!(order.as_slice(), &["layout", "paint"]);
/// assert!(order.is_acyclic());
/// ```
pub fn sort_observers<'a, K, C, I>(observers: I, policy: CyclePolicy) -> ExecutionOrder<K>
where
    K: Copy + Eq + Debug,
    C: Copy + Eq + Hash + 'a,
    I: IntoIterator<Item = (K, &'a ObserverSets<C>)>,
{
    let mut normal: Vec<(K, &'a ObserverSets<C>)> = Vec::new();
    let mut self_modifying: Vec<(K, &'a ObserverSets<C>)> = Vec::new();
    for entry in observers {
        if entry.1.is_self_modifying() {
            self_modifying.push(entry);
        } else {
            normal.push(entry);
        }
    }

    let mut order = Vec::with_capacity(normal.len() + self_modifying.len());
    let mut cycles = Vec::new();
    let mut pending = HashMap::new();

    for (mut remaining, tolerance) in [(normal, 0), (self_modifying, 1)] {
        if let Some(unresolved) = sort_pass(&mut remaining, tolerance, &mut pending, &mut order) {
            report_cycle(&unresolved, tolerance, policy);
            cycles.push(CycleReport {
                tolerance,
                unresolved,
            });
        }
    }

    ExecutionOrder { order, cycles }
}

/// Runs one tolerance-constrained pass, appending to `out`.
///
/// Returns the unresolved observers if the pass stalled.
fn sort_pass<K, C>(
    remaining: &mut Vec<(K, &ObserverSets<C>)>,
    tolerance: usize,
    pending: &mut HashMap<C, usize>,
    out: &mut Vec<K>,
) -> Option<Vec<K>>
where
    K: Copy,
    C: Copy + Eq + Hash,
{
    pending.clear();
    for (_, sets) in remaining.iter() {
        for &c in sets.modified() {
            *pending.entry(c).or_insert(0) += 1;
        }
    }

    while !remaining.is_empty() {
        let before = remaining.len();
        remaining.retain(|&(key, sets)| {
            let ready = sets
                .observed()
                .iter()
                .all(|c| pending.get(c).copied().unwrap_or(0) <= tolerance);
            if ready {
                for c in sets.modified() {
                    if let Some(count) = pending.get_mut(c) {
                        *count -= 1;
                    }
                }
                out.push(key);
            }
            !ready
        });

        if remaining.len() == before {
            let unresolved: Vec<K> = remaining.drain(..).map(|(key, _)| key).collect();
            out.extend_from_slice(&unresolved);
            return Some(unresolved);
        }
    }

    None
}

fn report_cycle<K: Debug>(unresolved: &[K], tolerance: usize, policy: CyclePolicy) {
    match policy {
        CyclePolicy::Silent => {}
        CyclePolicy::DebugAssert => {
            debug_assert!(
                false,
                "observer dependency cycle among {unresolved:?} (tolerance {tolerance})"
            );
            warn_cycle(unresolved, tolerance);
        }
        CyclePolicy::Warn => warn_cycle(unresolved, tolerance),
    }
}

fn warn_cycle<K: Debug>(unresolved: &[K], tolerance: usize) {
    log::warn!(
        "observer dependency cycle among {} observers (tolerance {tolerance}), \
         running them in declared order: {unresolved:?}",
        unresolved.len()
    );
}
