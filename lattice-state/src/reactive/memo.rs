//! Memo Implementation
//!
//! A Memo caches a derived value and recomputes it only when its inputs
//! changed. Inputs come in two flavours:
//!
//! - **Explicit**: the caller passes a dependency list on every call. The
//!   list is compared element-wise with the previous one using shallow
//!   (identity) equality, like a hook dependency array.
//!
//! - **Tracked**: no list is passed. The computation runs under the
//!   [`Tracker`], and the memo stays valid while every cell it read is still
//!   at the version it saw.
//!
//! # Failures
//!
//! A failing computation caches nothing. The previous value (if any) stays
//! valid, and is returned by the next call whose inputs still match it.
//!
//! # Thread Safety
//!
//! The entry lock is never held while the computation runs, so a
//! computation may freely read cells or consult other memos.

use std::convert::Infallible;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use super::subscriber::SubscriberId;
use super::tracker::{DependencySet, Tracker};
use crate::error::{BoxError, ComputeError};
use crate::value::{shallow_eq_slices, Value};

/// Cache state of a memo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoState {
    /// Nothing has been computed yet (or the memo was invalidated).
    Empty,

    /// A tracked input moved; the next tracked call recomputes.
    Stale,

    /// The cached value matches the recorded inputs.
    Clean,
}

enum Inputs {
    Explicit(SmallVec<[Value; 4]>),
    Tracked(DependencySet),
}

struct MemoEntry<T> {
    value: T,
    inputs: Inputs,
}

/// A cached derived value.
///
/// # Example
///
/// ```rust
/// use lattice_state::reactive::{Cell, Memo};
///
/// let count = Cell::new("count", 2);
/// let doubled = Memo::new();
///
/// assert_eq!(doubled.get(|| count.read() * 2), 4);
/// count.write(5).unwrap();
/// assert_eq!(doubled.get(|| count.read() * 2), 10);
/// ```
pub struct Memo<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Identifies the memo in traces.
    id: SubscriberId,

    entry: Arc<Mutex<Option<MemoEntry<T>>>>,

    /// Number of times a computation ran to completion.
    computations: Arc<AtomicUsize>,
}

impl<T> Memo<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an empty memo. Nothing runs until the first call.
    pub fn new() -> Self {
        Self {
            id: SubscriberId::new(),
            entry: Arc::new(Mutex::new(None)),
            computations: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Return the cached value if its inputs are unchanged, otherwise run
    /// `compute` exactly once and cache the result.
    ///
    /// With `deps`, inputs are compared shallowly against the list passed on
    /// the previous call. Without, inputs are the cells `compute` reads.
    pub fn get_or_compute<F, E>(&self, compute: F, deps: Option<&[Value]>) -> Result<T, ComputeError>
    where
        F: FnOnce() -> Result<T, E>,
        E: Into<BoxError>,
    {
        self.resolve(deps, compute).map_err(ComputeError::new)
    }

    /// Tracked memoization of an infallible computation.
    pub fn get(&self, compute: impl FnOnce() -> T) -> T {
        match self.resolve(None, || Ok::<T, Infallible>(compute())) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Explicit-dependency memoization of an infallible computation.
    pub fn get_with_deps(&self, deps: &[Value], compute: impl FnOnce() -> T) -> T {
        match self.resolve(Some(deps), || Ok::<T, Infallible>(compute())) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    fn resolve<F, E>(&self, deps: Option<&[Value]>, compute: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        if let Some(entry) = self.entry.lock().as_ref() {
            match (&entry.inputs, deps) {
                (Inputs::Explicit(previous), Some(deps)) if shallow_eq_slices(previous, deps) => {
                    return Ok(entry.value.clone());
                }
                (Inputs::Tracked(set), None) if !set.is_stale() => {
                    Tracker::record_all(set);
                    return Ok(entry.value.clone());
                }
                _ => {}
            }
        }

        let (value, inputs) = match deps {
            Some(deps) => {
                let value = Tracker::untracked(compute)?;
                (value, Inputs::Explicit(deps.iter().cloned().collect()))
            }
            None => {
                let (result, set) = Tracker::track(compute);
                let value = result?;
                Tracker::record_all(&set);
                (value, Inputs::Tracked(set))
            }
        };

        *self.entry.lock() = Some(MemoEntry {
            value: value.clone(),
            inputs,
        });
        let computations = self.computations.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(memo = %self.id, computations, "memo recomputed");

        Ok(value)
    }

    /// Drop the cached value; the next call recomputes.
    pub fn invalidate(&self) {
        *self.entry.lock() = None;
    }

    /// Get the current cache state.
    pub fn state(&self) -> MemoState {
        match self.entry.lock().as_ref() {
            None => MemoState::Empty,
            Some(MemoEntry {
                inputs: Inputs::Tracked(set),
                ..
            }) if set.is_stale() => MemoState::Stale,
            Some(_) => MemoState::Clean,
        }
    }

    /// Check if the memo has a cached value.
    pub fn has_value(&self) -> bool {
        self.entry.lock().is_some()
    }

    /// The cells read by the last tracked computation.
    pub fn dependencies(&self) -> Option<DependencySet> {
        match self.entry.lock().as_ref() {
            Some(MemoEntry {
                inputs: Inputs::Tracked(set),
                ..
            }) => Some(set.clone()),
            _ => None,
        }
    }

    /// How many times a computation ran to completion.
    pub fn computations(&self) -> usize {
        self.computations.load(Ordering::Relaxed)
    }
}

impl<T> Default for Memo<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Memo<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            entry: Arc::clone(&self.entry),
            computations: Arc::clone(&self.computations),
        }
    }
}

impl<T> Debug for Memo<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memo")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("computations", &self.computations())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
