//! Derived cells.
//!
//! A [`Derived`] is a memoized computation that publishes its result into a
//! cell of its own. It watches the cells its computation read, recomputes as
//! soon as one of them advances, and writes the new result only if it differs
//! from the published one. Other computations that read a derived cell are
//! therefore invalidated only when its value really changed.

use std::sync::{Arc, OnceLock};

use super::cell::{Cell, CellKey};
use super::effect::Effect;
use super::subscriber::{Change, Subscription};
use crate::error::{BoxError, ComputeError};

/// A cell whose value is computed from other cells.
pub struct Derived<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    cell: Cell<T>,
    effect: Effect,
}

impl<T> Derived<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    /// Run `compute` once and keep its result up to date.
    pub fn new<F, E>(key: impl Into<CellKey>, compute: F) -> Result<Self, ComputeError>
    where
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        let key = key.into();
        let slot: Arc<OnceLock<Cell<T>>> = Arc::new(OnceLock::new());
        let publish = Arc::clone(&slot);

        let effect = Effect::new(move || -> Result<(), BoxError> {
            let value = compute().map_err(Into::into)?;
            match publish.get() {
                Some(cell) => {
                    if cell.read_untracked() != value {
                        cell.write(value)?;
                    }
                }
                None => {
                    let _ = publish.set(Cell::new(key.clone(), value));
                }
            }
            Ok(())
        })?;

        let cell = slot
            .get()
            .cloned()
            .ok_or_else(|| ComputeError::new("derived computation did not publish a value"))?;

        Ok(Self { cell, effect })
    }

    /// Current value, recording a dependency on the derived cell.
    pub fn read(&self) -> T {
        self.cell.read()
    }

    pub fn read_untracked(&self) -> T {
        self.cell.read_untracked()
    }

    /// The cell the result is published into.
    pub fn cell(&self) -> &Cell<T> {
        &self.cell
    }

    pub fn key(&self) -> &CellKey {
        self.cell.key()
    }

    /// Number of published changes.
    pub fn version(&self) -> u64 {
        self.cell.version()
    }

    /// Number of times the computation ran.
    pub fn recomputations(&self) -> usize {
        self.effect.run_count()
    }

    pub fn subscribe<F>(&self, f: F) -> Subscription
    where
        F: Fn(&Change<T>) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.cell.subscribe(f)
    }

    /// Stop recomputing. The last published value stays readable.
    pub fn dispose(&self) {
        self.effect.dispose();
    }
}

impl<T> Clone for Derived<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            effect: self.effect.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Derived<T>
where
    T: Clone + Send + Sync + PartialEq + std::fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Derived")
            .field("cell", &self.cell)
            .field("recomputations", &self.recomputations())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn derived_tracks_its_inputs() {
        let count = Cell::new("count", 2);
        let reader = count.clone();
        let doubled = Derived::new("doubled", move || Ok::<_, Infallible>(reader.read() * 2)).unwrap();

        assert_eq!(doubled.read(), 4);
        count.write(5).unwrap();
        assert_eq!(doubled.read(), 10);
        assert_eq!(doubled.recomputations(), 2);
        assert_eq!(doubled.key().as_str(), "doubled");
    }

    #[test]
    fn derived_chains_propagate_onward() {
        let base = Cell::new("base", 5);
        let reader = base.clone();
        let doubled = Derived::new("doubled", move || Ok::<_, Infallible>(reader.read() * 2)).unwrap();
        let upstream = doubled.clone();
        let plus_ten = Derived::new("plus_ten", move || Ok::<_, Infallible>(upstream.read() + 10)).unwrap();

        assert_eq!(plus_ten.read(), 20);
        base.write(10).unwrap();
        assert_eq!(doubled.read(), 20);
        assert_eq!(plus_ten.read(), 30);
    }

    #[test]
    fn unchanged_results_are_not_republished() {
        let number = Cell::new("number", 3);
        let reader = number.clone();
        let parity = Derived::new("parity", move || Ok::<_, Infallible>(reader.read() % 2)).unwrap();

        let notified = Arc::new(AtomicI32::new(0));
        let notified_clone = notified.clone();
        parity.subscribe(move |_| {
            notified_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        number.write(5).unwrap();
        assert_eq!(parity.recomputations(), 2);
        assert_eq!(notified.load(Ordering::SeqCst), 0);
        assert_eq!(parity.version(), 0);

        number.write(6).unwrap();
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert_eq!(parity.read(), 0);
    }

    #[test]
    fn failing_first_computation_is_returned() {
        let result = Derived::<i32>::new("broken", || Err("no input"));
        assert!(result.is_err());
    }

    #[test]
    fn disposed_derived_keeps_last_value() {
        let source = Cell::new("source", 1);
        let reader = source.clone();
        let mirror = Derived::new("mirror", move || Ok::<_, Infallible>(reader.read())).unwrap();

        mirror.dispose();
        source.write(2).unwrap();
        assert_eq!(mirror.read(), 1);
    }
}
