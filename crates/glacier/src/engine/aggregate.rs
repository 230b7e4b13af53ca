//! Query evaluation and composite aggregation over stored documents.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::index::{field_value, numeric_value};
use crate::capability::CompositeBucket;
use crate::model::{Aggregation, BucketKey, Group, KeyValue, Metric, Query, SeqNo};

/// Whether a document with `seq_no` matches `query`.
///
/// A bool query with `should` clauses needs at least one of them to match.
pub(crate) fn matches(query: &Query, source: &Map<String, Value>, seq_no: SeqNo) -> bool {
    match query {
        Query::MatchAll => true,
        Query::Terms { field, values } => field_values(source, field)
            .filter_map(KeyValue::from_json)
            .any(|v| !v.is_null() && values.contains(&v)),
        Query::Range { field, gte, lt } => field_values(source, field)
            .filter_map(numeric_value)
            .any(|v| gte.is_none_or(|g| v >= g) && lt.is_none_or(|l| v < l)),
        Query::Exists { field } => field_values(source, field).any(|v| !v.is_null()),
        Query::SeqNoRange {
            from_exclusive,
            to_inclusive,
        } => from_exclusive.is_none_or(|from| seq_no > from) && seq_no <= *to_inclusive,
        Query::Bool {
            must,
            should,
            must_not,
        } => {
            must.iter().all(|q| matches(q, source, seq_no))
                && (should.is_empty() || should.iter().any(|q| matches(q, source, seq_no)))
                && !must_not.iter().any(|q| matches(q, source, seq_no))
        }
    }
}

/// Values of `field`, flattening arrays.
fn field_values<'a>(
    source: &'a Map<String, Value>,
    field: &str,
) -> Box<dyn Iterator<Item = &'a Value> + 'a> {
    match field_value(source, field) {
        Some(Value::Array(items)) => Box::new(items.iter()),
        Some(value) => Box::new(std::iter::once(value)),
        None => Box::new(std::iter::empty()),
    }
}

fn first_value<'a>(source: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    match field_value(source, field)? {
        Value::Array(items) => items.first(),
        value => Some(value),
    }
}

/// Bucket key component of a document for `group`. Documents missing the
/// field fall in the null bucket.
fn group_value(group: &Group, source: &Map<String, Value>) -> KeyValue {
    let Some(value) = first_value(source, group.source_field()) else {
        return KeyValue::Null;
    };

    match (group, group.interval()) {
        (Group::Terms { .. }, _) => KeyValue::from_json(value).unwrap_or(KeyValue::Null),
        (_, Some(interval)) => match numeric_value(value) {
            Some(v) => {
                let lower = (v / interval).floor() * interval;
                if interval.fract() == 0.0 && lower.fract() == 0.0 {
                    KeyValue::Long(lower as i64)
                } else {
                    KeyValue::Double(lower)
                }
            }
            None => KeyValue::Null,
        },
        (_, None) => KeyValue::Null,
    }
}

pub(crate) fn bucket_key(groups: &[Group], source: &Map<String, Value>) -> BucketKey {
    groups
        .iter()
        .map(|g| (g.target_field().to_string(), group_value(g, source)))
        .collect()
}

#[derive(Debug, Clone, Default)]
struct MetricAccumulator {
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
    numeric_count: u64,
    value_count: u64,
}

impl MetricAccumulator {
    fn add(&mut self, value: &Value) {
        if value.is_null() {
            return;
        }
        self.value_count += 1;
        if let Some(v) = numeric_value(value) {
            self.sum += v;
            self.min = Some(self.min.map_or(v, |m| m.min(v)));
            self.max = Some(self.max.map_or(v, |m| m.max(v)));
            self.numeric_count += 1;
        }
    }

    fn result(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Sum => Some(self.sum),
            Metric::Min => self.min,
            Metric::Max => self.max,
            Metric::Avg => (self.numeric_count > 0).then(|| self.sum / self.numeric_count as f64),
            Metric::ValueCount => Some(self.value_count as f64),
        }
    }
}

#[derive(Debug, Default)]
struct BucketAccumulator {
    doc_count: u64,
    metrics: Vec<MetricAccumulator>,
}

/// Composite aggregation over `documents`.
///
/// Buckets are returned in key order, starting after `after_key`, at most
/// `size` per page. The returned cursor is `None` once no bucket is left.
pub(crate) fn composite<'a>(
    documents: impl Iterator<Item = &'a Map<String, Value>>,
    groups: &[Group],
    aggregations: &[Aggregation],
    after_key: Option<&BucketKey>,
    size: usize,
) -> (Vec<CompositeBucket>, Option<BucketKey>) {
    let mut buckets: BTreeMap<BucketKey, BucketAccumulator> = BTreeMap::new();

    for source in documents {
        let key = bucket_key(groups, source);
        if after_key.is_some_and(|after| &key <= after) {
            continue;
        }
        let bucket = buckets.entry(key).or_insert_with(|| BucketAccumulator {
            doc_count: 0,
            metrics: vec![MetricAccumulator::default(); aggregations.len()],
        });
        bucket.doc_count += 1;
        for (acc, aggregation) in bucket.metrics.iter_mut().zip(aggregations) {
            for value in field_values(source, &aggregation.field) {
                acc.add(value);
            }
        }
    }

    let more = buckets.len() > size;
    let page: Vec<CompositeBucket> = buckets
        .into_iter()
        .take(size)
        .map(|(key, acc)| CompositeBucket {
            key,
            doc_count: acc.doc_count,
            values: aggregations
                .iter()
                .zip(&acc.metrics)
                .map(|(aggregation, m)| (aggregation.name.clone(), m.result(aggregation.metric)))
                .collect(),
        })
        .collect();

    let next = if more {
        page.last().map(|b| b.key.clone())
    } else {
        None
    };
    (page, next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn docs(values: Vec<Value>) -> Vec<Map<String, Value>> {
        values
            .into_iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect()
    }

    fn terms(field: &str) -> Group {
        Group::Terms {
            source_field: field.to_string(),
            target_field: None,
        }
    }

    fn sum(name: &str, field: &str) -> Aggregation {
        Aggregation {
            name: name.to_string(),
            metric: Metric::Sum,
            field: field.to_string(),
        }
    }

    #[test]
    fn test_bool_and_range_matching() {
        let doc = docs(vec![json!({"status": "paid", "amount": 10})]).remove(0);
        let query = Query::all([
            Query::Terms {
                field: "status".to_string(),
                values: vec![KeyValue::from("paid")],
            },
            Query::Range {
                field: "amount".to_string(),
                gte: Some(10.0),
                lt: Some(20.0),
            },
        ]);
        assert!(matches(&query, &doc, 0));

        let query = Query::not(Query::Exists {
            field: "status".to_string(),
        });
        assert!(!matches(&query, &doc, 0));

        let query = Query::SeqNoRange {
            from_exclusive: Some(3),
            to_inclusive: 5,
        };
        assert!(!matches(&query, &doc, 3));
        assert!(matches(&query, &doc, 4));
        assert!(matches(&query, &doc, 5));
        assert!(!matches(&query, &doc, 6));
    }

    #[test]
    fn test_composite_pages_through_buckets() {
        let documents = docs(vec![
            json!({"customer": "carol", "amount": 1}),
            json!({"customer": "alice", "amount": 2}),
            json!({"customer": "bob", "amount": 3}),
            json!({"customer": "alice", "amount": 4}),
        ]);
        let groups = [terms("customer")];
        let aggs = [sum("total", "amount")];

        let (page, after) = composite(documents.iter(), &groups, &aggs, None, 2);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].key, BucketKey::new().with("customer", "alice"));
        assert_eq!(page[0].doc_count, 2);
        assert_eq!(page[0].values["total"], Some(6.0));
        assert_eq!(after, Some(BucketKey::new().with("customer", "bob")));

        let (page, after) = composite(documents.iter(), &groups, &aggs, after.as_ref(), 2);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].key, BucketKey::new().with("customer", "carol"));
        assert_eq!(after, None);
    }

    #[test]
    fn test_missing_field_is_null_bucket() {
        let documents = docs(vec![json!({"amount": 1}), json!({"customer": "a"})]);
        let (page, _) = composite(documents.iter(), &[terms("customer")], &[], None, 10);
        assert_eq!(page[0].key, BucketKey::new().with("customer", KeyValue::Null));
        assert_eq!(page.len(), 2);
    }

    #[test]
    fn test_histogram_and_date_histogram_keys() {
        let doc = docs(vec![json!({"amount": 7.3, "ts": "2024-01-01T01:30:00Z"})]).remove(0);

        let histogram = Group::Histogram {
            source_field: "amount".to_string(),
            target_field: None,
            interval: 5.0,
        };
        assert_eq!(group_value(&histogram, &doc), KeyValue::Long(5));

        let fractional = Group::Histogram {
            source_field: "amount".to_string(),
            target_field: None,
            interval: 2.5,
        };
        assert_eq!(group_value(&fractional, &doc), KeyValue::Double(5.0));

        let hourly = Group::DateHistogram {
            source_field: "ts".to_string(),
            target_field: None,
            fixed_interval: "1h".to_string(),
        };
        assert_eq!(group_value(&hourly, &doc), KeyValue::Long(1_704_070_800_000));
    }

    #[test]
    fn test_metrics_of_empty_bucket() {
        let acc = MetricAccumulator::default();
        assert_eq!(acc.result(Metric::Sum), Some(0.0));
        assert_eq!(acc.result(Metric::Min), None);
        assert_eq!(acc.result(Metric::Avg), None);
        assert_eq!(acc.result(Metric::ValueCount), Some(0.0));
    }
}
