// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Understory Notify: dependency-ordered observer notification over versioned state.
//!
//! Application state is split into independently versioned components. Units of
//! reactive logic (observers) declare which components they read and which they
//! may write. On every notification cycle the [`NotifyManager`] runs exactly the
//! observers whose inputs changed, in an order where writers precede readers, and
//! then trims per-component change history that no observer can still ask for.
//!
//! The crate is built from these pieces:
//!
//! - **Version tokens** ([`VersionToken`], [`ChangeSeverity`]): an identity plus a
//!   monotonic counter, and a three-level answer to "what changed since then?".
//! - **State components** ([`StateComponent`], [`StateStore`]): the host's view of
//!   its state, looked up by a host-chosen key.
//! - **Changesets** ([`Versioned`], [`ChangesetLog`]): a ready-made component that
//!   records deltas so a reader can tell partial changes from complete ones.
//! - **Observers** ([`Observer`], [`FnObserver`], [`Bookmarks`]): declared read and
//!   write sets, a run callback, and per-component last-seen tokens.
//! - **Ordering** ([`sort_observers`], [`ExecutionOrder`], [`CyclePolicy`]): a
//!   tolerance-based topological sort that degrades deterministically on cycles.
//! - **The manager** ([`NotifyManager`]): registration, the cached order, and the
//!   per-cycle call list, run and purge passes.
//!
//! ## Quick Start
//!
//! ```rust
//! use hashbrown::HashMap;
//! use understory_notify::{Bookmarks, FnObserver, NotifyContext, NotifyManager, Versioned};
//!
//! type State = HashMap<&'static str, Versioned<u32>>;
//!
//! let mut state = State::new();
//! state.insert("clicks", Versioned::new(1, 0));
//! state.insert("label", Versioned::new(2, 0));
//! let live = ["clicks", "label"];
//!
//! let mut manager = NotifyManager::<State, &'static str, ()>::new();
//! manager
//!     .register(
//!         "render",
//!         FnObserver::new(
//!             ["clicks"],
//!             ["label"],
//!             |cx: &mut NotifyContext<'_, State, &'static str>, bookmarks: &mut Bookmarks<&'static str>| {
//!                 let clicks = *cx.state()["clicks"].get();
//!                 bookmarks.observe_in(cx.state(), "clicks");
//!                 if let Some(label) = cx.state_mut().get_mut("label") {
//!                     label.touch(|v| *v = clicks);
//!                 }
//!                 Ok(())
//!             },
//!         ),
//!     )
//!     .unwrap();
//!
//! // Newly registered observers run once.
//! assert_eq!(manager.notify(&mut state, &live).unwrap().invoked(), 1);
//! // Nothing changed, nothing runs.
//! assert_eq!(manager.notify(&mut state, &live).unwrap().invoked(), 0);
//!
//! state.get_mut("clicks").unwrap().modify((), |v| *v += 1);
//! assert_eq!(manager.notify(&mut state, &live).unwrap().invoked(), 1);
//! assert_eq!(*state["label"].get(), 1);
//! ```
//!
//! ## Ordering and Cycles
//!
//! An observer that modifies a component another observer reads is scheduled
//! first. Observers that modify a component they also read are sorted after all
//! others, tolerating their own write. When no observer can be scheduled, the
//! remaining ones are appended in a stable order and the stall is recorded as a
//! [`CycleReport`]; how loudly is controlled by [`CyclePolicy`]:
//!
//! - `Warn` (default): Logs a warning through the `log` facade.
//! - `DebugAssert`: Panics in debug builds, warns in release.
//! - `Silent`: Records the report only.
//!
//! ## Logging
//!
//! Diagnostics go through the [`log`](https://docs.rs/log) facade. The crate
//! never installs a logger.
//!
//! ## `no_std` Support
//!
//! This crate is `no_std` and uses `alloc`. It does not depend on `std`.

#![no_std]

extern crate alloc;

mod changeset;
mod component;
mod context;
mod manager;
mod observer;
mod order;
mod scratch;
mod version;

pub use changeset::{ChangesetLog, Versioned};
pub use component::{StateComponent, StateStore};
pub use context::NotifyContext;
pub use manager::{BoxedObserver, NotifyError, NotifyManager, NotifyOutcome, RegisterError};
pub use observer::{BookmarkScope, Bookmarks, FnObserver, Observer};
pub use order::{CyclePolicy, CycleReport, ExecutionOrder, ObserverSets, sort_observers};
pub use version::{ChangeSeverity, VersionToken};
