//! Shard identity and sequence numbers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-shard operation sequence number.
pub type SeqNo = i64;

/// Sequence number of a shard that has never seen an operation.
pub const NO_OPS_PERFORMED: SeqNo = -1;

/// A shard of an index.
///
/// Serialized as `"index:number"` so it can be used as a JSON map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ShardId {
    pub index: String,
    pub number: u32,
}

impl ShardId {
    pub fn new(index: impl Into<String>, number: u32) -> Self {
        Self {
            index: index.into(),
            number,
        }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.index, self.number)
    }
}

impl From<ShardId> for String {
    fn from(shard: ShardId) -> Self {
        shard.to_string()
    }
}

impl TryFrom<String> for ShardId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let (index, number) = value
            .rsplit_once(':')
            .ok_or_else(|| format!("invalid shard id '{value}': expected 'index:number'"))?;
        let number = number
            .parse()
            .map_err(|_| format!("invalid shard number in '{value}'"))?;
        if index.is_empty() {
            return Err(format!("invalid shard id '{value}': empty index"));
        }
        Ok(Self::new(index, number))
    }
}

/// Range of new operations on one shard: `(from_seq_no, to_seq_no]`.
///
/// `from_seq_no` is `None` when the shard has never been processed, in which
/// case everything up to `to_seq_no` is in scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardNewDocuments {
    pub shard: ShardId,
    pub from_seq_no: Option<SeqNo>,
    pub to_seq_no: SeqNo,
}
