//! Store and scoped stores.
//!
//! A [`Store`] owns a set of named cells and applies actions to them through
//! a reducer. [`Store::create_scope`] produces a child store that owns only
//! the keys it overrides and resolves every other key through its parent.
//! Writes to a delegated key land in the parent's cell, so every scope sees
//! a single version history for a shared key.
//!
//! # Lifecycle
//!
//! A store is `Active` until [`Store::teardown`] is called (or its last
//! handle is dropped). Teardown cascades to live child scopes, removes the
//! store's own cells and deregisters every observer registered through it,
//! including registrations on delegated parent cells. After teardown every
//! operation other than `teardown` fails with [`StateError::Lifecycle`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::{Mutex, ReentrantMutex, RwLock};

use super::reducer::Reducer;
use super::state::{Action, State};
use crate::config::StoreConfig;
use crate::error::{BoxError, ObserverError, ObserverFailure, Result, StateError};
use crate::reactive::{Cell, CellKey, Observer, Subscription, Tracker};
use crate::value::Value;

/// Lifecycle state of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    TornDown,
}

/// A handle to a store. Cloning shares the store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    name: Arc<str>,
    parent: Option<Store>,
    config: StoreConfig,
    /// `None` in scopes, which use the nearest ancestor's reducer.
    reducer: Option<Arc<dyn Reducer>>,
    /// Locally owned cells.
    cells: RwLock<IndexMap<CellKey, Cell<Value>>>,
    /// Observer registrations made through this store.
    registrations: Mutex<Vec<Subscription>>,
    children: Mutex<Vec<Weak<StoreInner>>>,
    scopes_created: AtomicUsize,
    torn_down: AtomicBool,
    /// Shared by the whole scope chain: one dispatch in flight at a time.
    dispatch_lock: Arc<ReentrantMutex<RefCell<DispatchQueue>>>,
}

#[derive(Default)]
struct DispatchQueue {
    committing: bool,
    /// Dispatches made by observers while `committing` was set.
    queued: VecDeque<(Store, Action)>,
}

/// Ends the commit phase, dropping anything still queued if it failed.
struct CommitGuard<'a>(&'a RefCell<DispatchQueue>);

impl Drop for CommitGuard<'_> {
    fn drop(&mut self) {
        let dropped = {
            let mut queue = self.0.borrow_mut();
            queue.committing = false;
            std::mem::take(&mut queue.queued)
        };
        if !dropped.is_empty() {
            tracing::debug!(dropped = dropped.len(), "queued dispatches discarded");
        }
    }
}

/// What one outermost dispatch (and everything queued behind it) did.
#[derive(Default)]
struct DispatchReport {
    committed: Vec<CellKey>,
    failures: Vec<ObserverFailure>,
}

impl DispatchReport {
    fn finish(self, action: &Action, result: Result<()>) -> Result<()> {
        match result {
            Err(source) if self.committed.is_empty() && self.failures.is_empty() => Err(source),
            Err(source) => Err(StateError::Interrupted {
                action: action.kind().to_string(),
                committed: self.committed,
                observers: (!self.failures.is_empty()).then(|| ObserverError::new(self.failures)),
                source: Box::new(source),
            }),
            Ok(()) if self.failures.is_empty() => Ok(()),
            Ok(()) => Err(ObserverError::new(self.failures).into()),
        }
    }
}

/// Builder for a root store.
pub struct StoreBuilder {
    name: String,
    config: StoreConfig,
    reducer: Option<Arc<dyn Reducer>>,
    cells: Vec<(CellKey, Value)>,
}

impl StoreBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Declare a cell with its initial value.
    pub fn cell(mut self, key: impl Into<CellKey>, value: impl Into<Value>) -> Self {
        self.cells.push((key.into(), value.into()));
        self
    }

    /// Declare every key of `state` as a cell.
    pub fn initial_state(mut self, state: &State) -> Self {
        self.cells
            .extend(state.iter().map(|(key, value)| (key.clone(), value.clone())));
        self
    }

    pub fn reducer<F>(self, reducer: F) -> Self
    where
        F: Fn(&State, &Action) -> Result<State, BoxError> + Send + Sync + 'static,
    {
        self.reducer_impl(reducer)
    }

    /// Use any [`Reducer`] implementation.
    pub fn reducer_impl(mut self, reducer: impl Reducer) -> Self {
        self.reducer = Some(Arc::new(reducer));
        self
    }

    pub fn build(self) -> Store {
        let cells = self
            .cells
            .into_iter()
            .map(|(key, value)| {
                let cell = new_cell(&self.config, key.clone(), value);
                (key, cell)
            })
            .collect();

        let store = Store {
            inner: Arc::new(StoreInner {
                name: Arc::from(self.name),
                parent: None,
                config: self.config,
                reducer: self.reducer,
                cells: RwLock::new(cells),
                registrations: Mutex::new(Vec::new()),
                children: Mutex::new(Vec::new()),
                scopes_created: AtomicUsize::new(0),
                torn_down: AtomicBool::new(false),
                dispatch_lock: Arc::new(ReentrantMutex::new(RefCell::new(DispatchQueue::default()))),
            }),
        };
        tracing::debug!(store = %store.inner.name, cells = store.inner.cells.read().len(), "store created");
        store
    }
}

fn new_cell(config: &StoreConfig, key: CellKey, value: Value) -> Cell<Value> {
    Cell::new(key, value).with_notify_limit(config.max_notify_depth)
}

/// Registrations made by one [`Store::subscribe`] call.
#[derive(Debug, Clone)]
pub struct ObserverHandle {
    subscriptions: Vec<Subscription>,
}

impl ObserverHandle {
    /// Remove every registration. Idempotent.
    pub fn unsubscribe(&self) {
        for subscription in &self.subscriptions {
            subscription.unsubscribe();
        }
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    /// Whether any registration is still attached.
    pub fn is_active(&self) -> bool {
        self.subscriptions.iter().any(Subscription::is_active)
    }
}

impl Store {
    pub fn builder() -> StoreBuilder {
        StoreBuilder {
            name: "root".to_string(),
            config: StoreConfig::default(),
            reducer: None,
            cells: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// The scope this store delegates to, if any.
    pub fn parent(&self) -> Option<&Store> {
        self.inner.parent.as_ref()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        if self.inner.torn_down.load(Ordering::SeqCst) {
            Lifecycle::TornDown
        } else {
            Lifecycle::Active
        }
    }

    pub fn is_torn_down(&self) -> bool {
        self.lifecycle() == Lifecycle::TornDown
    }

    fn ensure_active(&self, operation: &'static str) -> Result<()> {
        if self.is_torn_down() {
            return Err(StateError::Lifecycle {
                store: self.inner.name.clone(),
                operation,
            });
        }
        Ok(())
    }

    /// Look a key up locally, then through the parent chain.
    fn resolve(&self, key: &str) -> Option<Cell<Value>> {
        if let Some(cell) = self.inner.cells.read().get(key) {
            return Some(cell.clone());
        }
        self.inner.parent.as_ref().and_then(|parent| parent.resolve(key))
    }

    fn reducer(&self) -> Option<Arc<dyn Reducer>> {
        match (&self.inner.reducer, &self.inner.parent) {
            (Some(reducer), _) => Some(Arc::clone(reducer)),
            (None, Some(parent)) => parent.reducer(),
            (None, None) => None,
        }
    }

    /// The cell for `key`, owned here or by an ancestor scope.
    pub fn get_cell(&self, key: &str) -> Result<Cell<Value>> {
        self.ensure_active("get_cell")?;
        self.resolve(key)
            .ok_or_else(|| StateError::NotFound(CellKey::from(key)))
    }

    /// Read a value, recording a dependency if a tracker is active.
    pub fn read(&self, key: &str) -> Result<Value> {
        Ok(self.get_cell(key)?.read())
    }

    /// Write a value directly, bypassing the reducer. Delegated keys are
    /// written in the owning ancestor.
    pub fn write(&self, key: &str, value: impl Into<Value>) -> Result<u64> {
        self.ensure_active("write")?;
        let cell = self
            .resolve(key)
            .ok_or_else(|| StateError::NotFound(CellKey::from(key)))?;
        cell.write(value.into())
    }

    /// Add a cell owned by this store.
    pub fn declare(&self, key: impl Into<CellKey>, value: impl Into<Value>) -> Result<Cell<Value>> {
        self.ensure_active("declare")?;
        let key = key.into();
        let mut cells = self.inner.cells.write();
        if cells.contains_key(&key) {
            return Err(StateError::AlreadyDeclared(key));
        }
        let cell = new_cell(&self.inner.config, key.clone(), value.into());
        cells.insert(key, cell.clone());
        Ok(cell)
    }

    /// Keys owned by this store (not its ancestors).
    pub fn keys(&self) -> Result<Vec<CellKey>> {
        self.ensure_active("keys")?;
        Ok(self.inner.cells.read().keys().cloned().collect())
    }

    /// Snapshot of every key visible from this scope. Does not record
    /// dependencies.
    pub fn state(&self) -> Result<State> {
        self.ensure_active("state")?;
        Ok(self.snapshot())
    }

    fn snapshot(&self) -> State {
        let mut state = match &self.inner.parent {
            Some(parent) => parent.snapshot(),
            None => State::new(),
        };
        for (key, cell) in self.inner.cells.read().iter() {
            state.insert(key.clone(), cell.read_untracked());
        }
        state
    }

    /// Apply `action` through the reducer and write every changed key.
    ///
    /// The reducer runs against the scope's resolved snapshot. Keys whose
    /// new value is shallow-equal to the current one are skipped, keys the
    /// reducer omitted are untouched. If the reducer fails, or returns a key
    /// no scope declares, nothing is written and no one is notified.
    ///
    /// A dispatch made by an observer while another dispatch on the same
    /// scope chain is committing is queued, returns `Ok(())` at once, and
    /// runs against a fresh snapshot once the running commit has finished.
    /// Its failures are reported by the outermost `dispatch`.
    pub fn dispatch(&self, action: &Action) -> Result<()> {
        self.ensure_active("dispatch")?;
        if self.reducer().is_none() {
            return Err(StateError::MissingReducer {
                store: self.inner.name.clone(),
            });
        }

        let lock = self.inner.dispatch_lock.lock();
        {
            let mut queue = lock.borrow_mut();
            if queue.committing {
                queue.queued.push_back((self.clone(), action.clone()));
                tracing::trace!(store = %self.inner.name, action = action.kind(), "dispatch queued");
                return Ok(());
            }
            queue.committing = true;
        }
        let _commit = CommitGuard(&*lock);

        let mut report = DispatchReport::default();
        let mut result = self.apply(action, &mut report);
        while result.is_ok() {
            let Some((store, queued)) = lock.borrow_mut().queued.pop_front() else {
                break;
            };
            result = store.apply(&queued, &mut report);
        }

        report.finish(action, result)
    }

    /// Run the reducer once and commit its changes.
    fn apply(&self, action: &Action, report: &mut DispatchReport) -> Result<()> {
        self.ensure_active("dispatch")?;
        let reducer = self.reducer().ok_or_else(|| StateError::MissingReducer {
            store: self.inner.name.clone(),
        })?;

        let span = tracing::debug_span!("dispatch", store = %self.inner.name, action = action.kind());
        let _entered = span.enter();

        let (current, next) = Tracker::untracked(|| {
            let current = self.snapshot();
            reducer
                .reduce(&current, action)
                .map(|next| (current, next))
                .map_err(StateError::Reducer)
        })?;

        let mut commits = Vec::new();
        for (key, value) in next.iter() {
            let unchanged = current
                .get(key.as_str())
                .is_some_and(|old| old.shallow_eq(value));
            if unchanged {
                continue;
            }
            let cell = self
                .resolve(key.as_str())
                .ok_or_else(|| StateError::NotFound(key.clone()))?;
            commits.push((cell, value.clone()));
        }
        tracing::debug!(changed = commits.len(), "reducer applied");

        // A write that fails with anything but observer failures committed
        // nothing; stop there.
        for (cell, value) in commits {
            match cell.write(value) {
                Ok(_) => report.committed.push(cell.key().clone()),
                Err(StateError::Observer(err)) => {
                    report.committed.push(cell.key().clone());
                    report.failures.extend(err.into_failures());
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Create a child scope owning `overrides` and delegating every other key
    /// to this store.
    pub fn create_scope<I, K, V>(&self, overrides: I) -> Result<Store>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<CellKey>,
        V: Into<Value>,
    {
        self.ensure_active("create_scope")?;
        let config = self.inner.config.clone();
        let cells: IndexMap<CellKey, Cell<Value>> = overrides
            .into_iter()
            .map(|(key, value)| {
                let key = key.into();
                let cell = new_cell(&config, key.clone(), value.into());
                (key, cell)
            })
            .collect();

        let index = self.inner.scopes_created.fetch_add(1, Ordering::Relaxed);
        let child = Store {
            inner: Arc::new(StoreInner {
                name: Arc::from(format!("{}/{}", self.inner.name, index)),
                parent: Some(self.clone()),
                config,
                reducer: None,
                cells: RwLock::new(cells),
                registrations: Mutex::new(Vec::new()),
                children: Mutex::new(Vec::new()),
                scopes_created: AtomicUsize::new(0),
                torn_down: AtomicBool::new(false),
                dispatch_lock: Arc::clone(&self.inner.dispatch_lock),
            }),
        };

        let mut children = self.inner.children.lock();
        children.retain(|weak| weak.strong_count() > 0);
        children.push(Arc::downgrade(&child.inner));
        tracing::debug!(store = %child.inner.name, overrides = child.inner.cells.read().len(), "scope created");

        Ok(child)
    }

    /// Register `observer` on every cell in `keys`.
    ///
    /// Either all keys resolve and every registration is made, or the call
    /// fails with [`StateError::NotFound`] and none is.
    pub fn subscribe(&self, keys: &[&str], observer: &Observer) -> Result<ObserverHandle> {
        self.ensure_active("subscribe")?;
        let cells = keys
            .iter()
            .map(|key| {
                self.resolve(key)
                    .ok_or_else(|| StateError::NotFound(CellKey::from(*key)))
            })
            .collect::<Result<Vec<_>>>()?;

        let dedupe = self.inner.config.dedupe_notifications;
        let subscriptions: Vec<Subscription> = cells
            .iter()
            .map(|cell| cell.attach(observer.name().cloned(), observer.callback(cell.id(), dedupe)))
            .collect();

        let mut registrations = self.inner.registrations.lock();
        registrations.retain(Subscription::is_active);
        registrations.extend(subscriptions.iter().cloned());
        tracing::trace!(store = %self.inner.name, cells = subscriptions.len(), "observer registered");

        Ok(ObserverHandle { subscriptions })
    }

    /// Remove the registrations behind `handle`. Idempotent.
    pub fn unsubscribe(&self, handle: &ObserverHandle) -> Result<()> {
        self.ensure_active("unsubscribe")?;
        handle.unsubscribe();
        self.inner.registrations.lock().retain(|registration| {
            !handle
                .subscriptions
                .iter()
                .any(|subscription| subscription.id() == registration.id())
        });
        Ok(())
    }

    /// Tear the store down. Idempotent.
    pub fn teardown(&self) {
        if self.inner.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let children = std::mem::take(&mut *self.inner.children.lock());
        for child in children.iter().filter_map(Weak::upgrade) {
            Store { inner: child }.teardown();
        }

        self.inner.release();
        tracing::debug!(store = %self.inner.name, "store torn down");
    }
}

impl StoreInner {
    fn release(&self) {
        let registrations = std::mem::take(&mut *self.registrations.lock());
        for registration in &registrations {
            registration.unsubscribe();
        }

        let cells = std::mem::take(&mut *self.cells.write());
        for cell in cells.values() {
            cell.clear_subscribers();
        }
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        if !self.torn_down.load(Ordering::SeqCst) {
            self.release();
        }
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.inner.name)
            .field("lifecycle", &self.lifecycle())
            .field("cells", &self.inner.cells.read().keys().collect::<Vec<_>>())
            .field("parent", &self.inner.parent.as_ref().map(Store::name))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::Change;
    use std::sync::atomic::AtomicI32;

    fn counter_reducer(state: &State, action: &Action) -> Result<State, BoxError> {
        let counter = state.int("counter").unwrap_or(0);
        let step = state.int("step").unwrap_or(1);
        match action.kind() {
            "INCREMENT_COUNTER" => Ok(state.with("counter", counter + step)),
            "DECREMENT_COUNTER" => Ok(state.with("counter", counter - step)),
            "INCREMENT_STEP" => Ok(state.with("step", step + 1)),
            "DECREMENT_STEP" => Ok(state.with("step", step - 1)),
            "RESET" => Ok(state.with("counter", 10).with("step", 5)),
            "FAIL" => Err("reducer refused".into()),
            "GHOST" => Ok(state.with("ghost", 1)),
            _ => Ok(state.clone()),
        }
    }

    fn counter_store() -> Store {
        Store::builder()
            .name("counter")
            .cell("counter", 0)
            .cell("step", 1)
            .reducer(counter_reducer)
            .build()
    }

    fn counting_observer(name: &str) -> (Observer, Arc<AtomicI32>) {
        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();
        let observer = Observer::named(name, move |_: &Change<Value>| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (observer, calls)
    }

    #[test]
    fn dispatch_writes_only_changed_keys() {
        let store = counter_store();
        store.dispatch(&Action::new("INCREMENT_COUNTER")).unwrap();

        assert_eq!(store.get_cell("counter").unwrap().version(), 1);
        assert_eq!(store.get_cell("step").unwrap().version(), 0);
        assert_eq!(store.read("counter").unwrap().as_i64(), Some(1));
    }

    #[test]
    fn unknown_actions_change_nothing() {
        let store = counter_store();
        let (observer, calls) = counting_observer("all");
        store.subscribe(&["counter", "step"], &observer).unwrap();

        store.dispatch(&Action::new("NOOP")).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reducer_failure_leaves_cells_untouched() {
        let store = counter_store();
        let (observer, calls) = counting_observer("counter");
        store.subscribe(&["counter"], &observer).unwrap();

        let err = store.dispatch(&Action::new("FAIL")).unwrap_err();
        assert!(matches!(err, StateError::Reducer(_)));
        assert_eq!(store.get_cell("counter").unwrap().version(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn nested_dispatch_waits_for_the_running_commit() {
        let store = counter_store();
        let inner = store.clone();
        let stepper = Observer::named("stepper", move |change: &Change<Value>| {
            if change.new.as_i64() == Some(10) {
                inner.dispatch(&Action::new("INCREMENT_STEP"))?;
            }
            Ok(())
        });
        store.subscribe(&["counter"], &stepper).unwrap();

        store.dispatch(&Action::new("RESET")).unwrap();

        // The queued action runs after RESET has committed step = 5.
        assert_eq!(store.read("step").unwrap().as_i64(), Some(6));
        assert_eq!(store.get_cell("step").unwrap().version(), 2);
        assert_eq!(store.read("counter").unwrap().as_i64(), Some(10));
    }

    #[test]
    fn dispatch_reports_observer_failures_with_a_later_error() {
        let store = counter_store();
        let failing = Observer::named("A", |_: &Change<Value>| Err("render failed".into()));
        let inner = store.clone();
        let refuser = Observer::named("B", move |_: &Change<Value>| {
            inner.dispatch(&Action::new("FAIL"))?;
            Ok(())
        });
        store.subscribe(&["counter"], &failing).unwrap();
        store.subscribe(&["counter"], &refuser).unwrap();

        let err = store.dispatch(&Action::new("INCREMENT_COUNTER")).unwrap_err();
        match err {
            StateError::Interrupted {
                action,
                committed,
                observers,
                source,
            } => {
                assert_eq!(action, "INCREMENT_COUNTER");
                assert_eq!(committed, vec![CellKey::from("counter")]);
                assert!(observers.is_some_and(|aggregate| aggregate.names("A")));
                assert!(matches!(*source, StateError::Reducer(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.read("counter").unwrap().as_i64(), Some(1));

        // The chain is usable again afterwards.
        store.dispatch(&Action::new("INCREMENT_STEP")).unwrap();
        assert_eq!(store.read("step").unwrap().as_i64(), Some(2));
    }

    #[test]
    fn undeclared_keys_from_the_reducer_abort_the_dispatch() {
        let store = counter_store();
        let err = store.dispatch(&Action::new("GHOST")).unwrap_err();
        assert!(matches!(err, StateError::NotFound(key) if key.as_str() == "ghost"));
    }

    #[test]
    fn get_cell_reports_missing_keys() {
        let store = counter_store();
        let err = store.get_cell("missing").unwrap_err();
        assert_eq!(
            err.to_string(),
            "cell `missing` is not declared in this store or any ancestor scope"
        );
    }

    #[test]
    fn dispatch_without_reducer_fails() {
        let store = Store::builder().cell("a", 1).build();
        assert!(matches!(
            store.dispatch(&Action::new("ANY")),
            Err(StateError::MissingReducer { .. })
        ));
    }

    #[test]
    fn declare_rejects_duplicates() {
        let store = counter_store();
        store.declare("theme", "dark").unwrap();
        assert!(matches!(
            store.declare("theme", "light"),
            Err(StateError::AlreadyDeclared(_))
        ));
        assert_eq!(store.keys().unwrap().len(), 3);
    }

    #[test]
    fn scope_reads_through_to_parent() {
        let root = counter_store();
        let scope = root.create_scope(Vec::<(&str, Value)>::new()).unwrap();

        assert_eq!(scope.read("counter").unwrap().as_i64(), Some(0));
        root.write("counter", 5).unwrap();
        assert_eq!(scope.read("counter").unwrap().as_i64(), Some(5));
        assert!(scope.keys().unwrap().is_empty());
        assert_eq!(scope.parent().map(Store::name), Some("counter"));
    }

    #[test]
    fn scope_overrides_shadow_parent_keys() {
        let root = counter_store();
        let scope = root.create_scope([("step", 10)]).unwrap();

        assert_eq!(scope.read("step").unwrap().as_i64(), Some(10));
        assert_eq!(root.read("step").unwrap().as_i64(), Some(1));

        scope.dispatch(&Action::new("INCREMENT_COUNTER")).unwrap();
        assert_eq!(root.read("counter").unwrap().as_i64(), Some(10));

        scope.dispatch(&Action::new("INCREMENT_STEP")).unwrap();
        assert_eq!(scope.read("step").unwrap().as_i64(), Some(11));
        assert_eq!(root.read("step").unwrap().as_i64(), Some(1));
    }

    #[test]
    fn observer_registered_through_two_scopes_is_notified_once() {
        let root = counter_store();
        let scope = root.create_scope(Vec::<(&str, Value)>::new()).unwrap();
        let (observer, calls) = counting_observer("twice");

        root.subscribe(&["counter"], &observer).unwrap();
        scope.subscribe(&["counter"], &observer).unwrap();

        scope.dispatch(&Action::new("INCREMENT_COUNTER")).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dedupe_can_be_disabled() {
        let root = Store::builder()
            .config(StoreConfig::default().with_dedupe_notifications(false))
            .cell("counter", 0)
            .build();
        let scope = root.create_scope(Vec::<(&str, Value)>::new()).unwrap();
        let (observer, calls) = counting_observer("twice");

        root.subscribe(&["counter"], &observer).unwrap();
        scope.subscribe(&["counter"], &observer).unwrap();

        root.write("counter", 1).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn subscribe_is_all_or_nothing() {
        let store = counter_store();
        let (observer, _) = counting_observer("partial");

        assert!(store.subscribe(&["counter", "nope"], &observer).is_err());
        assert_eq!(store.get_cell("counter").unwrap().subscriber_count(), 0);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let store = counter_store();
        let (observer, calls) = counting_observer("once");
        let handle = store.subscribe(&["counter"], &observer).unwrap();

        store.write("counter", 1).unwrap();
        store.unsubscribe(&handle).unwrap();
        store.unsubscribe(&handle).unwrap();
        handle.unsubscribe();
        assert!(!handle.is_active());

        store.write("counter", 2).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn torn_down_store_rejects_operations() {
        let store = counter_store();
        store.teardown();
        store.teardown();

        assert_eq!(store.lifecycle(), Lifecycle::TornDown);
        assert!(matches!(
            store.get_cell("counter"),
            Err(StateError::Lifecycle { operation: "get_cell", .. })
        ));
        assert!(matches!(
            store.dispatch(&Action::new("INCREMENT_COUNTER")),
            Err(StateError::Lifecycle { operation: "dispatch", .. })
        ));
        assert!(store.state().is_err());
        assert!(store.create_scope([("a", 1)]).is_err());
    }

    #[test]
    fn scope_teardown_releases_parent_registrations() {
        let root = counter_store();
        let scope = root.create_scope([("local", 1)]).unwrap();
        let (observer, calls) = counting_observer("scoped");
        scope.subscribe(&["counter", "local"], &observer).unwrap();

        let counter = root.get_cell("counter").unwrap();
        assert_eq!(counter.subscriber_count(), 1);

        scope.teardown();
        assert_eq!(counter.subscriber_count(), 0);
        root.write("counter", 3).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(root.read("local").is_err());
    }

    #[test]
    fn parent_teardown_cascades_to_scopes() {
        let root = counter_store();
        let scope = root.create_scope([("local", 1)]).unwrap();
        let nested = scope.create_scope(Vec::<(&str, Value)>::new()).unwrap();

        root.teardown();
        assert!(scope.is_torn_down());
        assert!(nested.is_torn_down());
    }

    #[test]
    fn dropping_a_scope_releases_its_registrations() {
        let root = counter_store();
        let (observer, _) = counting_observer("dropped");
        {
            let scope = root.create_scope(Vec::<(&str, Value)>::new()).unwrap();
            scope.subscribe(&["counter"], &observer).unwrap();
            assert_eq!(root.get_cell("counter").unwrap().subscriber_count(), 1);
        }
        assert_eq!(root.get_cell("counter").unwrap().subscriber_count(), 0);
    }

    #[test]
    fn state_snapshot_merges_the_scope_chain() {
        let root = counter_store();
        let scope = root.create_scope([("step", 4), ("theme", 0)]).unwrap();
        let state = scope.state().unwrap();

        assert_eq!(state.int("counter"), Some(0));
        assert_eq!(state.int("step"), Some(4));
        assert_eq!(state.int("theme"), Some(0));
        assert_eq!(state.len(), 3);
    }
}
