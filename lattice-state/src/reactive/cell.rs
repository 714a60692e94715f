//! Cell Implementation
//!
//! A Cell is the fundamental unit of state. It holds a value, a version
//! counter and the list of subscribers that want to hear about writes.
//!
//! # How Cells Work
//!
//! 1. Reading a cell while a [`Tracker`] frame is installed records the cell
//!    and its current version as a dependency of the running computation.
//!
//! 2. Writing a cell always commits: the value is replaced and the version
//!    advances, even if the new value equals the old one.
//!
//! 3. After the commit, every subscriber is called synchronously with the
//!    change. Subscribers may write other cells; those notify depth-first
//!    before the outer write returns.
//!
//! # Reentrancy
//!
//! No lock is held while subscribers run, so a subscriber may read, write or
//! (un)subscribe the very cell that notified it. A write to a cell that is
//! already in its own notification pass is committed at once and its pass is
//! queued behind the running one. Subscribers therefore see each cell's
//! versions in commit order.
//!
//! # Failures
//!
//! A failing subscriber never stops its siblings. Failures are collected and
//! returned from the write as one [`ObserverError`].
//!
//! Nesting and queued passes are bounded by the cell's notify limit. The
//! write that would go past it is rejected before it commits, so every
//! committed version is still delivered.

use std::borrow::Borrow;
use std::cell::Cell as StdCell;
use std::collections::VecDeque;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::subscriber::{Callback, Change, SubscriberId, Subscription};
use super::tracker::{Dependency, Tracker};
use crate::config::DEFAULT_MAX_NOTIFY_DEPTH;
use crate::error::{BoxError, ObserverError, ObserverFailure, Result, StateError};

/// Name of a cell, unique within one store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellKey(Arc<str>);

impl CellKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CellKey {
    fn from(key: &str) -> Self {
        Self(Arc::from(key))
    }
}

impl From<String> for CellKey {
    fn from(key: String) -> Self {
        Self(Arc::from(key))
    }
}

impl From<&CellKey> for CellKey {
    fn from(key: &CellKey) -> Self {
        key.clone()
    }
}

impl Borrow<str> for CellKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for CellKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for CellKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for CellKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::from)
    }
}

/// Process-unique identity of a cell.
///
/// Keys can be shadowed by nested scopes; ids cannot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellId(u64);

impl CellId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Watcher callback that only cares about which cell moved to which version.
pub(crate) type Watcher = Arc<dyn Fn(&CellKey, u64) -> Result<(), BoxError> + Send + Sync>;

/// Type-erased view of a cell, used by dependency sets and subscriptions.
pub(crate) trait Source: Send + Sync {
    fn version(&self) -> u64;
    fn watch(&self, id: SubscriberId, name: Option<Arc<str>>, watcher: Watcher);
    fn detach(&self, id: SubscriberId) -> bool;
    fn is_attached(&self, id: SubscriberId) -> bool;
}

thread_local! {
    /// Number of writes currently notifying on this thread's call stack.
    static NOTIFY_DEPTH: StdCell<usize> = const { StdCell::new(0) };
}

/// Guard holding one level of notification depth.
struct DepthGuard;

impl DepthGuard {
    fn enter(limit: usize) -> Option<Self> {
        NOTIFY_DEPTH.with(|depth| {
            if depth.get() >= limit {
                None
            } else {
                depth.set(depth.get() + 1);
                Some(DepthGuard)
            }
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        NOTIFY_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Committed changes waiting for a notification pass.
struct Queue<T> {
    changes: VecDeque<Change<T>>,
    /// A pass is running for this cell somewhere up the stack.
    draining: bool,
    /// Changes accepted since the running pass started.
    accepted: usize,
}

/// Ends the running pass even if a subscriber panics. Undelivered changes
/// stay queued for the next writer's pass.
struct PassGuard<'a, T>(&'a Mutex<Queue<T>>);

impl<T> Drop for PassGuard<'_, T> {
    fn drop(&mut self) {
        self.0.lock().draining = false;
    }
}

struct Slot<T> {
    value: T,
    version: u64,
}

#[derive(Clone)]
struct Entry<T> {
    name: Option<Arc<str>>,
    callback: Callback<T>,
}

struct CellInner<T> {
    id: CellId,
    key: CellKey,
    slot: RwLock<Slot<T>>,
    subscribers: RwLock<IndexMap<SubscriberId, Entry<T>>>,
    /// Committed changes waiting for their notification pass.
    queue: Mutex<Queue<T>>,
    max_depth: AtomicUsize,
}

/// A named, versioned unit of mutable state.
///
/// Cloning a cell produces another handle to the same state.
///
/// # Example
///
/// ```rust
/// use lattice_state::reactive::Cell;
///
/// let count = Cell::new("count", 0);
/// count.write(5).unwrap();
/// assert_eq!(count.read(), 5);
/// assert_eq!(count.version(), 1);
/// ```
pub struct Cell<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<CellInner<T>>,
}

impl<T> Cell<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new cell at version 0.
    pub fn new(key: impl Into<CellKey>, value: T) -> Self {
        Self {
            inner: Arc::new(CellInner {
                id: CellId::next(),
                key: key.into(),
                slot: RwLock::new(Slot { value, version: 0 }),
                subscribers: RwLock::new(IndexMap::new()),
                queue: Mutex::new(Queue {
                    changes: VecDeque::new(),
                    draining: false,
                    accepted: 0,
                }),
                max_depth: AtomicUsize::new(DEFAULT_MAX_NOTIFY_DEPTH),
            }),
        }
    }

    /// Bound how deeply writes may recurse through this cell's subscribers.
    pub fn with_notify_limit(self, limit: usize) -> Self {
        self.inner.max_depth.store(limit.max(1), Ordering::Relaxed);
        self
    }

    pub fn id(&self) -> CellId {
        self.inner.id
    }

    pub fn key(&self) -> &CellKey {
        &self.inner.key
    }

    /// Number of committed writes so far.
    pub fn version(&self) -> u64 {
        self.inner.slot.read().version
    }

    /// Get the current value, recording a dependency if a tracker is active.
    pub fn read(&self) -> T {
        self.with(T::clone)
    }

    /// Borrow the current value, recording a dependency if a tracker is
    /// active.
    ///
    /// `f` runs on a snapshot, so it may write this cell.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let value = {
            let slot = self.inner.slot.read();
            if Tracker::is_active() {
                Tracker::record(Dependency::new(
                    self.inner.key.clone(),
                    self.inner.id,
                    slot.version,
                    self.source(),
                ));
            }
            slot.value.clone()
        };
        f(&value)
    }

    /// Get the current value without recording a dependency.
    pub fn read_untracked(&self) -> T {
        self.inner.slot.read().value.clone()
    }

    /// Replace the value and notify subscribers.
    ///
    /// Returns the new version. If any subscriber failed, the write is still
    /// committed and the aggregate failure is returned once every subscriber
    /// has run.
    ///
    /// A write past the notification limit fails with
    /// [`StateError::DepthExceeded`] and commits nothing.
    pub fn write(&self, value: T) -> Result<u64> {
        let limit = self.inner.max_depth.load(Ordering::Relaxed);
        let exceeded = || StateError::DepthExceeded {
            key: self.inner.key.clone(),
            limit,
        };
        let _depth = DepthGuard::enter(limit).ok_or_else(exceeded)?;

        // Held across the commit so the version order matches queue order.
        let mut queue = self.inner.queue.lock();
        if queue.draining && queue.accepted >= limit {
            return Err(exceeded());
        }

        let change = {
            let mut slot = self.inner.slot.write();
            let old = std::mem::replace(&mut slot.value, value);
            slot.version += 1;
            Change {
                key: self.inner.key.clone(),
                old,
                new: slot.value.clone(),
                version: slot.version,
            }
        };
        let version = change.version;
        tracing::trace!(key = %change.key, version, "cell write committed");

        queue.changes.push_back(change);
        if queue.draining {
            // The pass already running for this cell delivers it.
            queue.accepted += 1;
            return Ok(version);
        }
        queue.draining = true;
        queue.accepted = 1;
        drop(queue);

        self.inner.drain()?;
        Ok(version)
    }

    /// Read-modify-write.
    pub fn update<F>(&self, f: F) -> Result<u64>
    where
        F: FnOnce(&T) -> T,
    {
        let current = self.read_untracked();
        self.write(f(&current))
    }

    /// Register a callback invoked after every committed write.
    pub fn subscribe<F>(&self, f: F) -> Subscription
    where
        F: Fn(&Change<T>) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.attach(None, Arc::new(f))
    }

    /// Like [`Cell::subscribe`], reporting failures under `name`.
    pub fn subscribe_named<F>(&self, name: impl Into<Arc<str>>, f: F) -> Subscription
    where
        F: Fn(&Change<T>) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.attach(Some(name.into()), Arc::new(f))
    }

    /// Remove a subscription. Unknown or already removed handles are ignored.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.inner.subscribers.write().shift_remove(&subscription.id());
    }

    /// Get the number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// Whether both handles refer to the same cell.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn attach(&self, name: Option<Arc<str>>, callback: Callback<T>) -> Subscription {
        let id = SubscriberId::new();
        self.inner
            .subscribers
            .write()
            .insert(id, Entry { name, callback });
        Subscription::new(id, self.inner.key.clone(), self.source())
    }

    pub(crate) fn clear_subscribers(&self) {
        self.inner.subscribers.write().clear();
    }

    pub(crate) fn source(&self) -> Weak<dyn Source> {
        let weak: Weak<CellInner<T>> = Arc::downgrade(&self.inner);
        weak
    }
}

impl<T> CellInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Deliver queued changes until the queue is empty.
    fn drain(&self) -> Result<()> {
        let _pass = PassGuard(&self.queue);
        let mut failures = Vec::new();

        loop {
            let change = {
                let mut queue = self.queue.lock();
                match queue.changes.pop_front() {
                    Some(change) => change,
                    None => {
                        queue.draining = false;
                        break;
                    }
                }
            };

            let snapshot: Vec<(SubscriberId, Entry<T>)> = self
                .subscribers
                .read()
                .iter()
                .map(|(id, entry)| (*id, entry.clone()))
                .collect();

            for (id, entry) in snapshot {
                // A sibling may have unsubscribed it earlier in this pass.
                if !self.subscribers.read().contains_key(&id) {
                    continue;
                }
                if let Err(source) = (entry.callback)(&change) {
                    tracing::warn!(
                        key = %change.key,
                        version = change.version,
                        subscriber = %id,
                        observer = entry.name.as_deref().unwrap_or(""),
                        error = %source,
                        "observer failed"
                    );
                    failures.push(ObserverFailure {
                        key: change.key.clone(),
                        version: change.version,
                        subscriber: id,
                        name: entry.name.clone(),
                        source,
                    });
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ObserverError::new(failures).into())
        }
    }
}

impl<T> Source for CellInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn version(&self) -> u64 {
        self.slot.read().version
    }

    fn watch(&self, id: SubscriberId, name: Option<Arc<str>>, watcher: Watcher) {
        let callback: Callback<T> = Arc::new(move |change: &Change<T>| watcher(&change.key, change.version));
        self.subscribers.write().insert(id, Entry { name, callback });
    }

    fn detach(&self, id: SubscriberId) -> bool {
        self.subscribers.write().shift_remove(&id).is_some()
    }

    fn is_attached(&self, id: SubscriberId) -> bool {
        self.subscribers.read().contains_key(&id)
    }
}

impl<T> Clone for Cell<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Cell<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.inner.slot.read();
        f.debug_struct("Cell")
            .field("key", &self.inner.key)
            .field("value", &slot.value)
            .field("version", &slot.version)
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn cell_read_and_write() {
        let cell = Cell::new("count", 0);
        assert_eq!(cell.read(), 0);
        assert_eq!(cell.version(), 0);

        assert_eq!(cell.write(42).unwrap(), 1);
        assert_eq!(cell.read(), 42);
        assert_eq!(cell.version(), 1);
    }

    #[test]
    fn equal_writes_still_advance_the_version() {
        let cell = Cell::new("count", 7);
        cell.write(7).unwrap();
        cell.write(7).unwrap();
        assert_eq!(cell.version(), 2);
    }

    #[test]
    fn cell_update() {
        let cell = Cell::new("count", 10);
        cell.update(|v| v + 5).unwrap();
        assert_eq!(cell.read(), 15);
    }

    #[test]
    fn subscribers_receive_old_and_new_values() {
        let cell = Cell::new("name", String::from("a"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        cell.subscribe(move |change: &Change<String>| {
            seen_clone
                .lock()
                .push((change.old.clone(), change.new.clone(), change.version));
            Ok(())
        });

        cell.write("b".into()).unwrap();
        cell.write("c".into()).unwrap();

        assert_eq!(
            *seen.lock(),
            vec![
                ("a".to_string(), "b".to_string(), 1),
                ("b".to_string(), "c".to_string(), 2),
            ]
        );
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let cell = Cell::new("count", 0);
        let call_count = Arc::new(AtomicI32::new(0));
        let call_count_clone = call_count.clone();

        let subscription = cell.subscribe(move |_| {
            call_count_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        cell.write(1).unwrap();
        assert_eq!(call_count.load(Ordering::SeqCst), 1);

        cell.unsubscribe(&subscription);
        cell.unsubscribe(&subscription);
        subscription.unsubscribe();
        assert!(!subscription.is_active());

        cell.write(2).unwrap();
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
        assert_eq!(cell.subscriber_count(), 0);
    }

    #[test]
    fn failing_subscriber_does_not_starve_siblings() {
        let cell = Cell::new("count", 0);
        let b_calls = Arc::new(AtomicI32::new(0));
        let b_clone = b_calls.clone();

        cell.subscribe_named("A", |_| Err("A exploded".into()));
        cell.subscribe_named("B", move |_| {
            b_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let err = cell.write(1).unwrap_err();
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
        assert_eq!(cell.read(), 1);

        match err {
            StateError::Observer(aggregate) => {
                assert_eq!(aggregate.failures().len(), 1);
                assert!(aggregate.names("A"));
                assert!(aggregate.to_string().contains("A exploded"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn subscriber_can_read_the_cell_it_observes() {
        let cell = Cell::new("count", 0);
        let reader = cell.clone();
        let observed = Arc::new(AtomicI32::new(-1));
        let observed_clone = observed.clone();

        cell.subscribe(move |_| {
            observed_clone.store(reader.read(), Ordering::SeqCst);
            Ok(())
        });

        cell.write(9).unwrap();
        assert_eq!(observed.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn reentrant_writes_are_delivered_in_commit_order() {
        let cell = Cell::new("count", 0);
        let writer = cell.clone();
        let log = Arc::new(Mutex::new(Vec::new()));

        // The first subscriber bumps the cell once more after version 1.
        cell.subscribe(move |change: &Change<i32>| {
            if change.version == 1 {
                writer.write(change.new + 1)?;
            }
            Ok(())
        });
        let log_clone = log.clone();
        cell.subscribe(move |change: &Change<i32>| {
            log_clone.lock().push(change.version);
            Ok(())
        });

        cell.write(1).unwrap();
        assert_eq!(*log.lock(), vec![1, 2]);
        assert_eq!(cell.read(), 2);
    }

    #[test]
    fn nested_writes_notify_depth_first() {
        let a = Cell::new("a", 0);
        let b = Cell::new("b", 0);
        let log = Arc::new(Mutex::new(Vec::new()));

        let b_writer = b.clone();
        let log_a = log.clone();
        a.subscribe(move |change: &Change<i32>| {
            log_a.lock().push("a:start");
            b_writer.write(change.new * 10)?;
            log_a.lock().push("a:end");
            Ok(())
        });
        let log_b = log.clone();
        b.subscribe(move |_| {
            log_b.lock().push("b");
            Ok(())
        });

        a.write(1).unwrap();
        assert_eq!(*log.lock(), vec!["a:start", "b", "a:end"]);
        assert_eq!(b.read(), 10);
    }

    #[test]
    fn runaway_recursion_is_bounded() {
        let a = Cell::new("a", 0).with_notify_limit(8);
        let b = Cell::new("b", 0).with_notify_limit(8);

        let b_writer = b.clone();
        a.subscribe(move |change: &Change<i32>| {
            b_writer.write(change.new + 1)?;
            Ok(())
        });
        let a_writer = a.clone();
        b.subscribe(move |change: &Change<i32>| {
            a_writer.write(change.new + 1)?;
            Ok(())
        });

        let err = a.write(1).unwrap_err();
        assert!(matches!(err, StateError::Observer(_)));
        assert!(err.to_string().contains("notification depth exceeded 8"));
    }

    #[test]
    fn write_past_the_limit_commits_nothing() {
        let cell = Cell::new("a", 0).with_notify_limit(4);
        let writer = cell.clone();
        let observed = Arc::new(Mutex::new(Vec::new()));

        cell.subscribe(move |change: &Change<i32>| {
            writer.write(change.new + 1)?;
            Ok(())
        });
        let observed_clone = observed.clone();
        cell.subscribe(move |change: &Change<i32>| {
            observed_clone.lock().push(change.version);
            Ok(())
        });

        let err = cell.write(1).unwrap_err();
        match &err {
            StateError::Observer(aggregate) => {
                let source = &aggregate.failures()[0].source;
                assert!(matches!(
                    source.downcast_ref::<StateError>(),
                    Some(StateError::DepthExceeded { limit: 4, .. })
                ));
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(*observed.lock(), vec![1, 2, 3, 4]);
        assert_eq!(observed.lock().last().copied(), Some(cell.version()));
        assert_eq!(cell.read(), 4);
    }

    #[test]
    fn closures_may_write_the_cell_they_read() {
        let cell = Cell::new("count", 1);

        let version = cell.with(|value| cell.write(value + 1)).unwrap();
        assert_eq!(version, 1);
        assert_eq!(cell.read(), 2);

        cell.update(|value| {
            cell.write(100).unwrap();
            value * 10
        })
        .unwrap();
        assert_eq!(cell.read(), 20);
        assert_eq!(cell.version(), 3);
    }

    #[test]
    fn cell_clone_shares_state() {
        let cell1 = Cell::new("shared", 0);
        let cell2 = cell1.clone();

        cell1.write(42).unwrap();
        assert_eq!(cell2.read(), 42);
        assert!(cell1.ptr_eq(&cell2));
        assert_eq!(cell1.id(), cell2.id());
    }

    #[test]
    fn cell_ids_are_unique() {
        let c1 = Cell::new("x", 0);
        let c2 = Cell::new("x", 0);
        assert_ne!(c1.id(), c2.id());
    }
}
