//! Effect Implementation
//!
//! An Effect is a side-effecting computation that re-runs whenever a cell it
//! read during its last run is written.
//!
//! # How Effects Work
//!
//! 1. When created, the effect runs its function immediately under the
//!    [`Tracker`] to establish its dependencies.
//!
//! 2. The effect subscribes to every cell it read. When one of them is
//!    written and the recorded versions no longer match, the effect re-runs
//!    synchronously and re-subscribes to whatever the new run read.
//!
//! 3. A run may return a cleanup closure. The cleanup runs before the next
//!    run and when the effect is disposed or dropped.
//!
//! # Differences from Memo
//!
//! - Memos return a value; effects do not.
//! - Memos are lazy (compute on access); effects are eager (run when deps change).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::cell::CellKey;
use super::subscriber::{SubscriberId, Subscription};
use super::tracker::{DependencySet, Tracker};
use crate::error::{BoxError, ComputeError};

/// Closure returned by an effect run, called before the next run.
pub type Cleanup = Box<dyn FnOnce() + Send>;

type RunFn = Box<dyn Fn() -> Result<Option<Cleanup>, BoxError> + Send + Sync>;

/// A side-effecting computation that runs when dependencies change.
///
/// # Example
///
/// ```rust
/// use lattice_state::reactive::{Cell, Effect};
///
/// let count = Cell::new("count", 0);
/// let reader = count.clone();
/// let effect = Effect::new(move || {
///     println!("count is {}", reader.read());
///     Ok::<_, std::convert::Infallible>(())
/// })
/// .unwrap();
///
/// count.write(5).unwrap(); // prints "count is 5"
/// assert_eq!(effect.run_count(), 2);
/// ```
pub struct Effect {
    inner: Arc<EffectInner>,
}

struct EffectInner {
    id: SubscriberId,

    /// The effect function.
    run: RunFn,

    /// Cells read by the last successful run.
    dependencies: Mutex<DependencySet>,

    /// Watchers attached to those cells.
    subscriptions: Mutex<Vec<Subscription>>,

    cleanup: Mutex<Option<Cleanup>>,

    disposed: AtomicBool,

    run_count: AtomicUsize,
}

impl Effect {
    /// Create an effect and run it immediately.
    pub fn new<F, E>(run: F) -> Result<Self, ComputeError>
    where
        F: Fn() -> Result<(), E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        let effect = Self::new_lazy(run);
        effect.execute()?;
        Ok(effect)
    }

    /// Create an effect whose runs return a cleanup closure, and run it
    /// immediately.
    pub fn with_cleanup<F, C, E>(run: F) -> Result<Self, ComputeError>
    where
        F: Fn() -> Result<C, E> + Send + Sync + 'static,
        C: FnOnce() + Send + 'static,
        E: Into<BoxError>,
    {
        let effect = Self::from_run(Box::new(move || match run() {
            Ok(cleanup) => Ok(Some(Box::new(cleanup) as Cleanup)),
            Err(err) => Err(err.into()),
        }));
        effect.execute()?;
        Ok(effect)
    }

    /// Create a new effect without running it.
    ///
    /// It tracks nothing until [`Effect::execute`] is first called.
    pub fn new_lazy<F, E>(run: F) -> Self
    where
        F: Fn() -> Result<(), E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        Self::from_run(Box::new(move || run().map(|()| None).map_err(Into::into)))
    }

    fn from_run(run: RunFn) -> Self {
        Self {
            inner: Arc::new(EffectInner {
                id: SubscriberId::new(),
                run,
                dependencies: Mutex::new(DependencySet::new()),
                subscriptions: Mutex::new(Vec::new()),
                cleanup: Mutex::new(None),
                disposed: AtomicBool::new(false),
                run_count: AtomicUsize::new(0),
            }),
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.inner.id
    }

    /// Run the effect now, regardless of whether its inputs changed.
    pub fn execute(&self) -> Result<(), ComputeError> {
        self.inner.execute()
    }

    /// Dispose of the effect: run the pending cleanup and stop watching.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.release();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Number of completed runs.
    pub fn run_count(&self) -> usize {
        self.inner.run_count.load(Ordering::SeqCst)
    }

    /// Number of cells read by the last successful run.
    pub fn dependency_count(&self) -> usize {
        self.inner.dependencies.lock().len()
    }
}

impl EffectInner {
    fn execute(self: &Arc<Self>) -> Result<(), ComputeError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Ok(());
        }

        let previous = self.cleanup.lock().take();
        if let Some(cleanup) = previous {
            cleanup();
        }

        let (result, dependencies) = Tracker::track(|| (self.run)());
        // On failure the old dependencies stay, so the next write retries.
        let cleanup = result.map_err(ComputeError::new)?;

        *self.cleanup.lock() = cleanup;
        self.watch(&dependencies);
        *self.dependencies.lock() = dependencies;
        let runs = self.run_count.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::trace!(effect = %self.id, runs, "effect ran");
        Ok(())
    }

    /// Replace the watchers with one per cell in `dependencies`.
    fn watch(self: &Arc<Self>, dependencies: &DependencySet) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut subscriptions = self.subscriptions.lock();
        for subscription in subscriptions.drain(..) {
            subscription.unsubscribe();
        }

        for dependency in dependencies.iter() {
            let Some(source) = dependency.source().upgrade() else {
                continue;
            };
            let id = SubscriberId::new();
            let weak = weak.clone();
            source.watch(
                id,
                None,
                Arc::new(move |_: &CellKey, _: u64| match weak.upgrade() {
                    Some(effect) => effect.on_change(),
                    None => Ok(()),
                }),
            );
            subscriptions.push(Subscription::new(
                id,
                dependency.key().clone(),
                dependency.source().clone(),
            ));
        }
    }

    fn on_change(self: &Arc<Self>) -> Result<(), BoxError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let stale = self.dependencies.lock().is_stale();
        if stale {
            self.execute()?;
        }
        Ok(())
    }

    fn release(&self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
        let cleanup = self.cleanup.lock().take();
        if let Some(cleanup) = cleanup {
            cleanup();
        }
    }
}

impl Drop for EffectInner {
    fn drop(&mut self) {
        self.release();
    }
}

impl Clone for Effect {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.inner.id)
            .field("run_count", &self.run_count())
            .field("dependency_count", &self.dependency_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
