//! Sharded index storage.

use chrono::DateTime;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::hash::{DefaultHasher, Hash, Hasher};

use crate::capability::FieldType;
use crate::model::{NO_OPS_PERFORMED, SeqNo, ShardId};

#[derive(Debug, Clone)]
pub(crate) struct StoredDocument {
    pub seq_no: SeqNo,
    pub source: Map<String, Value>,
}

#[derive(Debug)]
pub(crate) struct ShardState {
    pub id: ShardId,
    pub documents: BTreeMap<String, StoredDocument>,
    /// Sequence number the next operation gets.
    next_seq_no: SeqNo,
    pub available: bool,
}

impl ShardState {
    fn new(id: ShardId) -> Self {
        Self {
            id,
            documents: BTreeMap::new(),
            next_seq_no: 0,
            available: true,
        }
    }

    /// Highest sequence number below which every operation is applied.
    pub fn global_checkpoint(&self) -> SeqNo {
        if self.next_seq_no == 0 {
            NO_OPS_PERFORMED
        } else {
            self.next_seq_no - 1
        }
    }

    fn upsert(&mut self, id: String, source: Map<String, Value>) -> SeqNo {
        let seq_no = self.next_seq_no;
        self.next_seq_no += 1;
        self.documents.insert(id, StoredDocument { seq_no, source });
        seq_no
    }
}

#[derive(Debug)]
pub(crate) struct IndexState {
    pub shards: Vec<ShardState>,
    pub mappings: BTreeMap<String, FieldType>,
    pub writable: bool,
    round_robin: u64,
}

impl IndexState {
    pub fn new(name: &str, shards: u32, mappings: BTreeMap<String, FieldType>) -> Self {
        Self {
            shards: (0..shards.max(1))
                .map(|n| ShardState::new(ShardId::new(name, n)))
                .collect(),
            mappings,
            writable: true,
            round_robin: 0,
        }
    }

    pub fn shard(&self, id: &ShardId) -> Option<&ShardState> {
        self.shards.get(id.number as usize)
    }

    pub fn shard_mut(&mut self, id: &ShardId) -> Option<&mut ShardState> {
        self.shards.get_mut(id.number as usize)
    }

    /// Shard a document is routed to: by id hash when it has one, otherwise
    /// round-robin.
    fn route(&mut self, id: Option<&str>) -> usize {
        let count = self.shards.len() as u64;
        let slot = match id {
            Some(id) => {
                let mut hasher = DefaultHasher::new();
                id.hash(&mut hasher);
                hasher.finish() % count
            }
            None => {
                let slot = self.round_robin % count;
                self.round_robin += 1;
                slot
            }
        };
        slot as usize
    }

    /// Index `source`, mapping new fields dynamically.
    pub fn index(&mut self, id: Option<&str>, source: Map<String, Value>) -> (ShardId, SeqNo) {
        for (field, value) in &source {
            if !self.mappings.contains_key(field)
                && let Some(ty) = infer_type(value)
            {
                self.mappings.insert(field.clone(), ty);
            }
        }

        let slot = self.route(id);
        let shard = &mut self.shards[slot];
        let id = match id {
            Some(id) => id.to_string(),
            None => format!("{}-{}", shard.id, shard.next_seq_no),
        };
        let seq_no = shard.upsert(id, source);
        (shard.id.clone(), seq_no)
    }

    /// Check a value against the mapping of `field`.
    pub fn check_value(&self, field: &str, value: &Value) -> Result<(), String> {
        let Some(ty) = self.mappings.get(field) else {
            return Ok(());
        };
        let ok = match (ty, value) {
            (_, Value::Null) => true,
            (FieldType::Long | FieldType::Double, v) => v.is_number(),
            (FieldType::Date, v) => v.is_number() || v.as_str().is_some_and(|s| parse_date(s).is_some()),
            (FieldType::Boolean, v) => v.is_boolean(),
            (FieldType::Keyword, _) => true,
        };
        if ok {
            Ok(())
        } else {
            Err(format!("field [{field}] cannot hold {value} (mapped as {ty:?})"))
        }
    }

    pub fn documents(&self) -> impl Iterator<Item = (&String, &StoredDocument)> {
        self.shards.iter().flat_map(|s| s.documents.iter())
    }
}

fn infer_type(value: &Value) -> Option<FieldType> {
    match value {
        Value::Bool(_) => Some(FieldType::Boolean),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(FieldType::Long),
        Value::Number(_) => Some(FieldType::Double),
        Value::String(s) if parse_date(s).is_some() => Some(FieldType::Date),
        Value::String(_) => Some(FieldType::Keyword),
        Value::Array(items) => items.iter().find_map(infer_type),
        Value::Null | Value::Object(_) => None,
    }
}

/// Parse an RFC 3339 timestamp into epoch milliseconds.
pub(crate) fn parse_date(value: &str) -> Option<f64> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.timestamp_millis() as f64)
}

/// Look up `field` in `source`, following dots into nested objects when the
/// dotted name itself is not a key.
pub(crate) fn field_value<'a>(source: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    if let Some(value) = source.get(field) {
        return Some(value);
    }
    let mut parts = field.split('.');
    let mut current = source.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Numeric view of a field value; dates become epoch milliseconds.
pub(crate) fn numeric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_date(s),
        _ => None,
    }
}
