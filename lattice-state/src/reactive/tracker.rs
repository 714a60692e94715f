//! Dependency Tracker
//!
//! The tracker records which cells a computation reads while it runs. This
//! is what lets a memo or effect know exactly which cells it depends on
//! without the caller declaring them.
//!
//! # Implementation
//!
//! We use a thread-local stack of frames. [`Tracker::track`] pushes a frame,
//! runs the computation and pops the frame, returning every cell read in
//! between together with the version observed at read time. The pop happens
//! in a drop guard, so a failing or panicking computation never leaves a
//! frame behind for an unrelated computation to pick up.
//!
//! Frames nest: a memo evaluated inside another computation records into its
//! own frame, then re-records its dependency set into the enclosing one.

use std::cell::RefCell;
use std::fmt;
use std::sync::Weak;

use smallvec::SmallVec;

use super::cell::{CellId, CellKey, Source};

thread_local! {
    static TRACKER_STACK: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// An entry in the tracker stack.
struct Frame {
    /// `false` for frames pushed by [`Tracker::untracked`].
    recording: bool,
    dependencies: DependencySet,
}

/// A cell read by a computation, with the version seen at read time.
#[derive(Clone)]
pub struct Dependency {
    key: CellKey,
    cell: CellId,
    version: u64,
    source: Weak<dyn Source>,
}

impl Dependency {
    pub(crate) fn new(key: CellKey, cell: CellId, version: u64, source: Weak<dyn Source>) -> Self {
        Self {
            key,
            cell,
            version,
            source,
        }
    }

    pub fn key(&self) -> &CellKey {
        &self.key
    }

    pub fn cell(&self) -> CellId {
        self.cell
    }

    /// Version of the cell when it was read.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether the cell has been written since it was read. A cell that no
    /// longer exists counts as changed.
    pub fn is_stale(&self) -> bool {
        self.source
            .upgrade()
            .map(|source| source.version() != self.version)
            .unwrap_or(true)
    }

    pub(crate) fn source(&self) -> &Weak<dyn Source> {
        &self.source
    }
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.key, self.version)
    }
}

/// The ordered (cell, version) pairs a computation read during its last run.
///
/// An empty set is always stale: a computation that read nothing is never
/// served from cache.
#[derive(Clone, Default)]
pub struct DependencySet {
    entries: SmallVec<[Dependency; 4]>,
}

impl DependencySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a dependency, keeping the first read of each cell.
    pub(crate) fn insert(&mut self, dependency: Dependency) {
        if !self.contains(dependency.cell) {
            self.entries.push(dependency);
        }
    }

    pub(crate) fn extend(&mut self, other: &DependencySet) {
        for dependency in other.iter() {
            self.insert(dependency.clone());
        }
    }

    pub fn contains(&self, cell: CellId) -> bool {
        self.entries.iter().any(|entry| entry.cell == cell)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dependency> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &CellKey> {
        self.entries.iter().map(|entry| &entry.key)
    }

    /// Whether any recorded cell moved past its captured version.
    pub fn is_stale(&self) -> bool {
        self.entries.is_empty() || self.entries.iter().any(Dependency::is_stale)
    }
}

impl fmt::Debug for DependencySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.iter()).finish()
    }
}

/// Guard that pops its frame when dropped.
pub struct TrackerGuard {
    depth: usize,
    finished: bool,
}

impl TrackerGuard {
    /// Pop the frame and return what it recorded.
    pub fn finish(mut self) -> DependencySet {
        self.finished = true;
        TRACKER_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            debug_assert_eq!(stack.len(), self.depth, "tracker frames popped out of order");
            stack
                .pop()
                .map(|frame| frame.dependencies)
                .unwrap_or_default()
        })
    }
}

impl Drop for TrackerGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        TRACKER_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            debug_assert_eq!(stack.len(), self.depth, "tracker frames popped out of order");
            stack.pop();
        });
    }
}

/// Entry points to the ambient tracker.
pub struct Tracker;

impl Tracker {
    /// Install a recording frame. Reads are recorded until the guard is
    /// finished or dropped.
    pub fn enter() -> TrackerGuard {
        Self::push(true)
    }

    fn push(recording: bool) -> TrackerGuard {
        let depth = TRACKER_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.push(Frame {
                recording,
                dependencies: DependencySet::new(),
            });
            stack.len()
        });
        TrackerGuard {
            depth,
            finished: false,
        }
    }

    /// Run `f` and return its result with every cell it read.
    pub fn track<R>(f: impl FnOnce() -> R) -> (R, DependencySet) {
        let guard = Self::enter();
        let result = f();
        (result, guard.finish())
    }

    /// Run `f` without recording any reads into the enclosing computation.
    pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
        let _guard = Self::push(false);
        f()
    }

    /// Whether reads are currently being recorded.
    pub fn is_active() -> bool {
        TRACKER_STACK.with(|stack| {
            stack
                .borrow()
                .last()
                .map(|frame| frame.recording)
                .unwrap_or(false)
        })
    }

    /// Record a read into the innermost frame.
    pub(crate) fn record(dependency: Dependency) {
        TRACKER_STACK.with(|stack| {
            if let Some(frame) = stack.borrow_mut().last_mut() {
                if frame.recording {
                    frame.dependencies.insert(dependency);
                }
            }
        });
    }

    /// Re-record a whole dependency set into the innermost frame.
    pub(crate) fn record_all(dependencies: &DependencySet) {
        TRACKER_STACK.with(|stack| {
            if let Some(frame) = stack.borrow_mut().last_mut() {
                if frame.recording {
                    frame.dependencies.extend(dependencies);
                }
            }
        });
    }
}
