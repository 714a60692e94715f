//! Error types for the state core.
//!
//! Every fallible operation returns [`StateError`]. Observer failures are
//! never raised one at a time: all subscribers of a write run first and the
//! failures are then reported together as an [`ObserverError`].

use std::sync::Arc;

use thiserror::Error;

use crate::reactive::{CellKey, SubscriberId};

/// Boxed error used for failures raised by user code (observers, reducers,
/// computations).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias used throughout the crate.
pub type Result<T, E = StateError> = std::result::Result<T, E>;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum StateError {
    /// The key is declared neither in this store nor in an ancestor scope.
    #[error("cell `{0}` is not declared in this store or any ancestor scope")]
    NotFound(CellKey),

    /// The store has been torn down.
    #[error("store `{store}` is torn down; `{operation}` is no longer valid")]
    Lifecycle {
        store: Arc<str>,
        operation: &'static str,
    },

    /// One or more observers failed during a write or dispatch.
    #[error(transparent)]
    Observer(#[from] ObserverError),

    /// A memoized computation failed.
    #[error(transparent)]
    Compute(#[from] ComputeError),

    /// The reducer rejected the action. Nothing was written.
    #[error("reducer failed: {0}")]
    Reducer(#[source] BoxError),

    /// `dispatch` was called on a store chain without a reducer.
    #[error("store `{store}` has no reducer")]
    MissingReducer { store: Arc<str> },

    /// `declare` was called with a key this store already owns.
    #[error("cell `{0}` is already declared in this scope")]
    AlreadyDeclared(CellKey),

    /// A dispatch stopped on an error after some of its writes, or the
    /// writes of dispatches queued behind it, had already committed.
    #[error("dispatch `{action}` stopped after {writes} committed write(s): {source}", writes = .committed.len())]
    Interrupted {
        action: String,
        /// Keys written before the failure, in commit order.
        committed: Vec<CellKey>,
        /// Observer failures collected before the failure.
        observers: Option<ObserverError>,
        source: Box<StateError>,
    },

    /// Notification recursed past the configured limit.
    #[error("notification depth exceeded {limit} while writing `{key}`")]
    DepthExceeded { key: CellKey, limit: usize },

    /// Configuration could not be parsed.
    #[error("invalid store config: {0}")]
    Config(#[from] serde_json::Error),
}

/// A single subscriber failure collected during a notification pass.
#[derive(Debug)]
pub struct ObserverFailure {
    /// Key of the cell being written.
    pub key: CellKey,
    /// Version the subscriber was being notified about.
    pub version: u64,
    /// The failing subscriber.
    pub subscriber: SubscriberId,
    /// Optional human readable name given at subscription time.
    pub name: Option<Arc<str>>,
    /// The error the subscriber returned.
    pub source: BoxError,
}

impl std::fmt::Display for ObserverFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "observer `{name}`")?,
            None => write!(f, "observer {}", self.subscriber)?,
        }
        write!(f, " failed on `{}`@{}: {}", self.key, self.version, self.source)
    }
}

/// Aggregate of every subscriber failure raised by one write (or by all
/// writes of one dispatch).
#[derive(Debug, Error)]
#[error("{} observer(s) failed: {}", .failures.len(), summarize(.failures))]
pub struct ObserverError {
    failures: Vec<ObserverFailure>,
}

fn summarize(failures: &[ObserverFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ObserverError {
    pub(crate) fn new(failures: Vec<ObserverFailure>) -> Self {
        debug_assert!(!failures.is_empty());
        Self { failures }
    }

    /// All collected failures, in notification order.
    pub fn failures(&self) -> &[ObserverFailure] {
        &self.failures
    }

    /// Consume the aggregate, returning its failures.
    pub fn into_failures(self) -> Vec<ObserverFailure> {
        self.failures
    }

    /// Whether a subscriber with the given name failed.
    pub fn names(&self, name: &str) -> bool {
        self.failures
            .iter()
            .any(|failure| failure.name.as_deref() == Some(name))
    }
}

/// A computation passed to a memo or effect failed.
///
/// The memo's previous cache (if any) is left untouched.
#[derive(Debug, Error)]
#[error("computation failed: {source}")]
pub struct ComputeError {
    #[source]
    source: BoxError,
}

impl ComputeError {
    pub(crate) fn new(source: impl Into<BoxError>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// The error raised by the computation.
    pub fn inner(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.source.as_ref()
    }
}
