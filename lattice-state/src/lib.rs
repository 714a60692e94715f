//! Lattice State
//!
//! This crate provides the state core of the Lattice reactive UI framework.
//! It implements:
//!
//! - Versioned reactive cells with synchronous notification
//! - Automatic dependency tracking
//! - Memoization, effects and derived cells
//! - Reducer-driven stores with nested scopes
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: Cells, the dependency tracker, memos and effects
//! - `store`: Stores, scopes, reducers and observer registration
//! - `value`: The dynamically typed [`Value`] that store cells hold
//! - `config`: Store tunables
//! - `error`: The crate-wide error type
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! use lattice_state::{Action, Change, Observer, State, Store, Value};
//!
//! let store = Store::builder()
//!     .cell("counter", 0)
//!     .cell("step", 1)
//!     .reducer(|state: &State, action: &Action| {
//!         let counter = state.int("counter").unwrap_or(0);
//!         let step = state.int("step").unwrap_or(1);
//!         Ok(match action.kind() {
//!             "INCREMENT_COUNTER" => state.with("counter", counter + step),
//!             "INCREMENT_STEP" => state.with("step", step + 1),
//!             _ => state.clone(),
//!         })
//!     })
//!     .build();
//!
//! let renders = Arc::new(AtomicUsize::new(0));
//! let seen = renders.clone();
//! let observer = Observer::new(move |_: &Change<Value>| {
//!     seen.fetch_add(1, Ordering::SeqCst);
//!     Ok(())
//! });
//! store.subscribe(&["counter"], &observer).unwrap();
//!
//! store.dispatch(&Action::new("INCREMENT_COUNTER")).unwrap();
//! store.dispatch(&Action::new("INCREMENT_STEP")).unwrap();
//! store.dispatch(&Action::new("INCREMENT_COUNTER")).unwrap();
//!
//! assert_eq!(store.read("counter").unwrap().as_i64(), Some(3));
//! assert_eq!(renders.load(Ordering::SeqCst), 2);
//! ```

pub mod config;
pub mod error;
pub mod reactive;
pub mod store;
pub mod value;

pub use config::StoreConfig;
pub use error::{BoxError, ComputeError, ObserverError, ObserverFailure, Result, StateError};
pub use reactive::{
    Cell, CellKey, Change, Derived, Effect, Memo, MemoState, Observer, Subscription, Tracker,
};
pub use store::{Action, Lifecycle, ObserverHandle, Reducer, State, Store, StoreBuilder};
pub use value::Value;
