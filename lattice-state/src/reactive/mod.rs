//! Reactive Primitives
//!
//! This module implements the building blocks of the state core: cells,
//! the dependency tracker, memos, effects and derived cells.
//!
//! # Concepts
//!
//! ## Cells
//!
//! A Cell is a container for mutable state with a version counter. Writing a
//! cell always advances its version and synchronously notifies every
//! subscriber.
//!
//! ## Tracking
//!
//! Reading a cell while a [`Tracker`] frame is installed records the cell and
//! the version that was read. The recorded [`DependencySet`] is what memos
//! and effects compare against later to decide whether they are stale.
//!
//! ## Memos
//!
//! A Memo caches a derived value, keyed either by an explicit dependency
//! list or by the cells its computation read.
//!
//! ## Effects and Derived cells
//!
//! An Effect re-runs a side effect whenever a cell it read advances. A
//! Derived cell is a memo kept up to date eagerly, publishing its result into
//! a cell of its own so that further computations can depend on it.

mod cell;
mod tracker;
mod subscriber;
mod memo;
mod effect;
mod derived;

pub use cell::{Cell, CellId, CellKey};
pub use tracker::{Dependency, DependencySet, Tracker, TrackerGuard};
pub use subscriber::{Change, Observe, Observer, SubscriberId, Subscription};
pub use memo::{Memo, MemoState};
pub use effect::{Cleanup, Effect};
pub use derived::Derived;

pub(crate) use subscriber::Callback;
