//! Filter query DSL shared by transforms and the search capability.

use serde::{Deserialize, Serialize};

use super::bucket::KeyValue;
use super::shard::SeqNo;

/// A document filter.
///
/// Serialized externally tagged, so in YAML a transform's filter reads
/// `terms: { field: status, values: [paid] }` or just `match_all`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Query {
    #[default]
    MatchAll,
    /// Field equals any of `values`. `KeyValue::Null` never matches here;
    /// use `must_not: [exists]` for missing fields.
    Terms { field: String, values: Vec<KeyValue> },
    /// Numeric (or date, as epoch millis) range `[gte, lt)`.
    Range {
        field: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gte: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lt: Option<f64>,
    },
    /// Field is present and not null.
    Exists { field: String },
    /// Operations with sequence number in `(from_exclusive, to_inclusive]`.
    SeqNoRange {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_exclusive: Option<SeqNo>,
        to_inclusive: SeqNo,
    },
    Bool {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        must: Vec<Query>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        should: Vec<Query>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        must_not: Vec<Query>,
    },
}

impl Query {
    /// Conjunction of `queries`, flattening trivial cases.
    pub fn all(queries: impl IntoIterator<Item = Query>) -> Query {
        let mut must: Vec<Query> = queries
            .into_iter()
            .filter(|q| !matches!(q, Query::MatchAll))
            .collect();
        match must.len() {
            0 => Query::MatchAll,
            1 => must.remove(0),
            _ => Query::Bool {
                must,
                should: Vec::new(),
                must_not: Vec::new(),
            },
        }
    }

    /// Disjunction of `queries`.
    pub fn any(mut should: Vec<Query>) -> Query {
        if should.len() == 1 {
            return should.remove(0);
        }
        Query::Bool {
            must: Vec::new(),
            should,
            must_not: Vec::new(),
        }
    }

    pub fn not(query: Query) -> Query {
        Query::Bool {
            must: Vec::new(),
            should: Vec::new(),
            must_not: vec![query],
        }
    }

    /// Number of leaf clauses, counting every term of a terms query.
    ///
    /// Search backends cap this to bound query cost.
    pub fn clause_count(&self) -> usize {
        match self {
            Query::MatchAll => 0,
            Query::Terms { values, .. } => values.len(),
            Query::Range { .. } | Query::Exists { .. } | Query::SeqNoRange { .. } => 1,
            Query::Bool {
                must,
                should,
                must_not,
            } => must
                .iter()
                .chain(should)
                .chain(must_not)
                .map(Query::clause_count)
                .sum(),
        }
    }

    /// Fields referenced by the query, for validation.
    pub fn fields(&self) -> Vec<&str> {
        match self {
            Query::MatchAll | Query::SeqNoRange { .. } => Vec::new(),
            Query::Terms { field, .. } | Query::Range { field, .. } | Query::Exists { field } => {
                vec![field.as_str()]
            }
            Query::Bool {
                must,
                should,
                must_not,
            } => must
                .iter()
                .chain(should)
                .chain(must_not)
                .flat_map(Query::fields)
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_forms() {
        let q: Query = serde_yaml::from_str("match_all").unwrap();
        assert_eq!(q, Query::MatchAll);

        let q: Query = serde_yaml::from_str(
            "bool:\n  must:\n    - terms: { field: status, values: [paid, shipped] }\n    - range: { field: amount, gte: 10 }\n",
        )
        .unwrap();
        assert_eq!(q.clause_count(), 3);
        assert_eq!(q.fields(), vec!["status", "amount"]);
    }

    #[test]
    fn test_all_flattens() {
        assert_eq!(Query::all([Query::MatchAll, Query::MatchAll]), Query::MatchAll);

        let exists = Query::Exists {
            field: "a".to_string(),
        };
        assert_eq!(Query::all([Query::MatchAll, exists.clone()]), exists);
    }
}
