//! Reducer-driven stores built on top of [`reactive`](crate::reactive) cells.
//!
//! - [`State`] and [`Action`] are the reducer's inputs and output
//! - [`Reducer`] maps `(state, action)` to the next state
//! - [`Store`] owns named cells, applies actions and manages child scopes

mod reducer;
mod scope;
mod state;

pub use reducer::Reducer;
pub use scope::{Lifecycle, ObserverHandle, Store, StoreBuilder};
pub use state::{Action, State};
