use crate::value::Value;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Freeze capability shared by every value container.
///
/// Once frozen an object is an immutable snapshot, safe to share across
/// threads; mutators on a frozen container panic (caller bug, not a
/// recoverable condition). Freezing is deep: nested containers are frozen
/// with their parent.
pub trait Container {
    fn is_frozen(&self) -> bool;

    fn freeze(&mut self);
}

// ─── Tuple ────────────────────────────────────────────────────

/// An ordered, freezable sequence of values.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Tuple {
    items: Vec<Value>,
    #[serde(skip)]
    frozen: bool,
}

impl Tuple {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: Value) {
        assert!(!self.frozen, "mutating a frozen tuple");
        self.items.push(item);
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.items.get(index)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.items.iter()
    }
}

impl Container for Tuple {
    fn is_frozen(&self) -> bool {
        self.frozen
    }

    fn freeze(&mut self) {
        if !self.frozen {
            self.frozen = true;
            for item in &mut self.items {
                item.freeze();
            }
        }
    }
}

impl PartialEq for Tuple {
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items
    }
}

impl From<Vec<Value>> for Tuple {
    fn from(items: Vec<Value>) -> Self {
        Self {
            items,
            frozen: false,
        }
    }
}

impl FromIterator<Value> for Tuple {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
            frozen: false,
        }
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (index, item) in self.items.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{item}")?;
        }
        write!(f, ")")
    }
}

// ─── Dict ─────────────────────────────────────────────────────

/// An insertion-ordered, freezable map from string keys to values.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Dict {
    entries: IndexMap<String, Value>,
    #[serde(skip)]
    frozen: bool,
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        assert!(!self.frozen, "mutating a frozen dict");
        self.entries.insert(key.into(), value)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        assert!(!self.frozen, "mutating a frozen dict");
        self.entries.shift_remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> indexmap::map::Iter<'_, String, Value> {
        self.entries.iter()
    }
}

impl Container for Dict {
    fn is_frozen(&self) -> bool {
        self.frozen
    }

    fn freeze(&mut self) {
        if !self.frozen {
            self.frozen = true;
            for value in self.entries.values_mut() {
                value.freeze();
            }
        }
    }
}

impl PartialEq for Dict {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl FromIterator<(String, Value)> for Dict {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
            frozen: false,
        }
    }
}

impl fmt::Display for Dict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (index, (key, value)) in self.entries.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{key}={value}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freeze_is_deep() {
        let mut inner = Tuple::new();
        inner.push(Value::Integer(1));
        let mut outer = Tuple::new();
        outer.push(Value::Tuple(inner));
        outer.freeze();

        assert!(outer.is_frozen());
        match outer.get(0) {
            Some(Value::Tuple(tuple)) => assert!(tuple.is_frozen()),
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[test]
    #[should_panic(expected = "frozen tuple")]
    fn frozen_tuple_rejects_push() {
        let mut tuple = Tuple::new();
        tuple.freeze();
        tuple.push(Value::Null);
    }

    #[test]
    fn dict_keeps_insertion_order() {
        let mut dict = Dict::new();
        dict.insert("zulu", Value::Integer(1));
        dict.insert("alpha", Value::Integer(2));
        let keys: Vec<&String> = dict.iter().map(|(key, _)| key).collect();
        assert_eq!(keys, ["zulu", "alpha"]);
    }

    #[test]
    #[should_panic(expected = "frozen dict")]
    fn frozen_dict_rejects_insert() {
        let mut dict = Dict::new();
        dict.freeze();
        dict.insert("key", Value::Null);
    }
}
