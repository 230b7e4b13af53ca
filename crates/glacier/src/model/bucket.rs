//! Composite bucket keys.
//!
//! A `BucketKey` maps each group's target field to the value of the bucket
//! for that group. Keys are compared field by field, so the same bucket
//! discovered on two shards deduplicates in a set.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A single component of a bucket key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValue {
    /// Documents missing the grouped field.
    Null,
    Bool(bool),
    Long(i64),
    Double(f64),
    Keyword(String),
}

impl KeyValue {
    fn rank(&self) -> u8 {
        match self {
            KeyValue::Null => 0,
            KeyValue::Bool(_) => 1,
            KeyValue::Long(_) | KeyValue::Double(_) => 2,
            KeyValue::Keyword(_) => 3,
        }
    }

    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            KeyValue::Long(v) => Some(*v as f64),
            KeyValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, KeyValue::Null)
    }

    /// Convert to a JSON value for output documents.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            KeyValue::Null => serde_json::Value::Null,
            KeyValue::Bool(b) => serde_json::Value::Bool(*b),
            KeyValue::Long(v) => serde_json::Value::from(*v),
            KeyValue::Double(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            KeyValue::Keyword(s) => serde_json::Value::String(s.clone()),
        }
    }

    /// Interpret a JSON value as a key component. Arrays and objects have
    /// no key representation.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => Some(KeyValue::Null),
            serde_json::Value::Bool(b) => Some(KeyValue::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(KeyValue::Long)
                .or_else(|| n.as_f64().map(KeyValue::Double)),
            serde_json::Value::String(s) => Some(KeyValue::Keyword(s.clone())),
            _ => None,
        }
    }
}

impl PartialEq for KeyValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KeyValue {}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (KeyValue::Null, KeyValue::Null) => Ordering::Equal,
            (KeyValue::Bool(a), KeyValue::Bool(b)) => a.cmp(b),
            (KeyValue::Long(a), KeyValue::Long(b)) => a.cmp(b),
            (KeyValue::Keyword(a), KeyValue::Keyword(b)) => a.cmp(b),
            (a, b) if a.rank() == 2 && b.rank() == 2 => {
                let (x, y) = (a.as_f64().unwrap_or_default(), b.as_f64().unwrap_or_default());
                x.total_cmp(&y)
            }
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl Hash for KeyValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            KeyValue::Null => {}
            KeyValue::Bool(b) => b.hash(state),
            // Long and Double compare numerically, so both hash the f64 bits.
            KeyValue::Long(_) | KeyValue::Double(_) => {
                let v = self.as_f64().unwrap_or_default();
                let v = if v == 0.0 { 0.0 } else { v };
                v.to_bits().hash(state)
            }
            KeyValue::Keyword(s) => s.hash(state),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Null => write!(f, "null"),
            KeyValue::Bool(b) => write!(f, "{b}"),
            KeyValue::Long(v) => write!(f, "{v}"),
            KeyValue::Double(v) => write!(f, "{v}"),
            KeyValue::Keyword(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<&str> for KeyValue {
    fn from(value: &str) -> Self {
        KeyValue::Keyword(value.to_string())
    }
}

impl From<i64> for KeyValue {
    fn from(value: i64) -> Self {
        KeyValue::Long(value)
    }
}

impl From<f64> for KeyValue {
    fn from(value: f64) -> Self {
        KeyValue::Double(value)
    }
}

/// Composite key of one aggregation bucket: target field -> value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketKey(BTreeMap<String, KeyValue>);

impl BucketKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<KeyValue>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: KeyValue) {
        self.0.insert(field.into(), value);
    }

    pub fn get(&self, field: &str) -> Option<&KeyValue> {
        self.0.get(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &KeyValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, KeyValue)> for BucketKey {
    fn from_iter<T: IntoIterator<Item = (String, KeyValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (field, value)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{field}={value}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, HashSet};

    #[test]
    fn test_set_deduplicates_keys_from_several_shards() {
        let a = BucketKey::new().with("customer", "alice").with("day", 20i64);
        let b = BucketKey::new().with("customer", "bob").with("day", 20i64);
        let a_again = BucketKey::new().with("day", 20i64).with("customer", "alice");

        let set: BTreeSet<_> = [a.clone(), b.clone(), a_again].into_iter().collect();
        assert_eq!(set, [a.clone(), b.clone()].into_iter().collect());

        let hashed: HashSet<_> = [a.clone(), b, a].into_iter().collect();
        assert_eq!(hashed.len(), 2);
    }

    #[test]
    fn test_numeric_values_compare_across_representations() {
        assert_eq!(KeyValue::Long(5), KeyValue::Double(5.0));
        assert!(KeyValue::Long(5) < KeyValue::Double(5.5));

        let set: HashSet<_> = [KeyValue::Long(5), KeyValue::Double(5.0)].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_null_sorts_first() {
        let mut values = vec![
            KeyValue::from("a"),
            KeyValue::Long(1),
            KeyValue::Null,
            KeyValue::Bool(true),
        ];
        values.sort();
        assert_eq!(values[0], KeyValue::Null);
        assert_eq!(values[3], KeyValue::from("a"));
    }

    #[test]
    fn test_json_shape() {
        let key = BucketKey::new()
            .with("customer", "alice")
            .with("bucket", 2.5)
            .with("missing", KeyValue::Null);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, r#"{"bucket":2.5,"customer":"alice","missing":null}"#);

        let parsed: BucketKey = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, key);
        assert!(matches!(
            serde_json::from_str::<KeyValue>("7").unwrap(),
            KeyValue::Long(7)
        ));
    }
}
