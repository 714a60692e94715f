//! Subscriber types for the reactive system.
//!
//! A subscriber is anything that wants to hear about cell writes: a raw
//! callback registered on a [`Cell`](super::Cell), an [`Observer`] registered
//! through a store, or an effect re-running its computation.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::cell::{CellId, CellKey, Source};
use crate::error::BoxError;
use crate::value::Value;

/// Unique identifier for a subscriber.
///
/// Each subscription gets a unique ID when created. The ID is what
/// unsubscription and failure reports refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    ///
    /// Uses an atomic counter to ensure uniqueness across threads.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One committed version transition of a cell.
#[derive(Debug, Clone)]
pub struct Change<T> {
    pub key: CellKey,
    pub old: T,
    pub new: T,
    pub version: u64,
}

/// Callback stored by a cell for each subscriber.
pub(crate) type Callback<T> = Arc<dyn Fn(&Change<T>) -> Result<(), BoxError> + Send + Sync>;

/// Handle returned by every `subscribe` call.
///
/// The handle only holds a weak back-reference to the cell, so keeping it
/// around never keeps a cell alive. Dropping it does NOT unsubscribe:
/// registrations are released explicitly with [`Subscription::unsubscribe`]
/// or when the owning store is torn down.
#[derive(Clone)]
pub struct Subscription {
    id: SubscriberId,
    key: CellKey,
    source: Weak<dyn Source>,
}

impl Subscription {
    pub(crate) fn new(id: SubscriberId, key: CellKey, source: Weak<dyn Source>) -> Self {
        Self { id, key, source }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Key of the cell this subscription is attached to.
    pub fn key(&self) -> &CellKey {
        &self.key
    }

    /// Remove the subscription. Unsubscribing twice, or after the cell is
    /// gone, is a no-op.
    pub fn unsubscribe(&self) {
        if let Some(source) = self.source.upgrade() {
            source.detach(self.id);
        }
    }

    /// Whether the cell still lists this subscription.
    pub fn is_active(&self) -> bool {
        self.source
            .upgrade()
            .map(|source| source.is_attached(self.id))
            .unwrap_or(false)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("active", &self.is_active())
            .finish()
    }
}

/// The notification seam between the store and whatever renders its state.
///
/// Implemented for every `Fn(&Change<Value>) -> Result<(), BoxError>`, so a
/// closure is usually enough.
pub trait Observe: Send + Sync {
    fn notify(&self, change: &Change<Value>) -> Result<(), BoxError>;
}

impl<F> Observe for F
where
    F: Fn(&Change<Value>) -> Result<(), BoxError> + Send + Sync,
{
    fn notify(&self, change: &Change<Value>) -> Result<(), BoxError> {
        self(change)
    }
}

/// A caller-owned observer that can be registered on several cells, through
/// several store scopes.
///
/// An observer remembers the last version it was handed for each cell, so a
/// registration made through two scopes that resolve to the same cell still
/// sees each transition once.
#[derive(Clone)]
pub struct Observer {
    inner: Arc<ObserverInner>,
}

struct ObserverInner {
    name: Option<Arc<str>>,
    target: Box<dyn Observe>,
    delivered: Mutex<HashMap<CellId, Delivery>>,
}

/// Per-cell bookkeeping, kept only while a registration on the cell exists.
struct Delivery {
    registrations: usize,
    last: Option<u64>,
}

/// Owned by each registered callback. Dropping the last one for a cell
/// forgets that cell.
struct Registration {
    inner: Arc<ObserverInner>,
    cell: CellId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut delivered = self.inner.delivered.lock();
        if let Some(delivery) = delivered.get_mut(&self.cell) {
            delivery.registrations = delivery.registrations.saturating_sub(1);
            if delivery.registrations == 0 {
                delivered.remove(&self.cell);
            }
        }
    }
}

impl Observer {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Change<Value>) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        Self::from_target(None, f)
    }

    /// Create an observer whose failures are reported under `name`.
    pub fn named<F>(name: impl Into<Arc<str>>, f: F) -> Self
    where
        F: Fn(&Change<Value>) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        Self::from_target(Some(name.into()), f)
    }

    /// Wrap any [`Observe`] implementation.
    pub fn from_target(name: Option<Arc<str>>, target: impl Observe + 'static) -> Self {
        Self {
            inner: Arc::new(ObserverInner {
                name,
                target: Box::new(target),
                delivered: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn name(&self) -> Option<&Arc<str>> {
        self.inner.name.as_ref()
    }

    /// Build the per-cell callback used when registering this observer.
    pub(crate) fn callback(&self, cell: CellId, dedupe: bool) -> Callback<Value> {
        self.inner
            .delivered
            .lock()
            .entry(cell)
            .or_insert(Delivery {
                registrations: 0,
                last: None,
            })
            .registrations += 1;

        let registration = Registration {
            inner: Arc::clone(&self.inner),
            cell,
        };
        Arc::new(move |change: &Change<Value>| {
            let inner = &registration.inner;
            if dedupe {
                let mut delivered = inner.delivered.lock();
                if let Some(delivery) = delivered.get_mut(&cell) {
                    if delivery.last.is_some_and(|seen| seen >= change.version) {
                        return Ok(());
                    }
                    delivery.last = Some(change.version);
                }
            }
            inner.target.notify(change)
        })
    }

    /// Whether two handles refer to the same observer.
    pub fn ptr_eq(&self, other: &Observer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("name", &self.inner.name)
            .field("cells_seen", &self.inner.delivered.lock().len())
            .finish()
    }
}
