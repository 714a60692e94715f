//! State snapshots and actions.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::reactive::CellKey;
use crate::value::Value;

/// An ordered snapshot of cell values, keyed by cell name.
///
/// Reducers receive the current snapshot and return the next one. Cloning a
/// snapshot is cheap: containers inside values are shared, which is what
/// lets the store tell untouched keys apart from replaced ones.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State {
    entries: IndexMap<CellKey, Value>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Shorthand for `get(key).and_then(Value::as_i64)`.
    pub fn int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    pub fn insert(&mut self, key: impl Into<CellKey>, value: impl Into<Value>) -> Option<Value> {
        self.entries.insert(key.into(), value.into())
    }

    /// A copy of this snapshot with one key replaced, like an object spread.
    pub fn with(&self, key: impl Into<CellKey>, value: impl Into<Value>) -> State {
        let mut next = self.clone();
        next.insert(key, value);
        next
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &CellKey> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CellKey, &Value)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter()).finish()
    }
}

impl<K, V> FromIterator<(K, V)> for State
where
    K: Into<CellKey>,
    V: Into<Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

impl<'a> IntoIterator for &'a State {
    type Item = (&'a CellKey, &'a Value);
    type IntoIter = indexmap::map::Iter<'a, CellKey, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// A request to change state, handed to the reducer.
///
/// Serializes as `{"type": ..., "payload": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    payload: Value,
}

impl Action {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Value>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }
}
