//! Validation run at the start of every tick.
//!
//! Problems with the definition are collected into a `ValidationResult`
//! rather than returned as errors; only failures to reach the source
//! surface as `Err`.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::capability::{FieldType, SearchCapability};
use crate::error::SearchError;
use crate::model::{Group, MAX_PAGE_SIZE, Metric, Transform};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationResult {
    pub issues: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }

    /// Failure reason recorded in the metadata of an invalid transform.
    pub fn failure_reason(&self) -> String {
        format!("Failed validation - [{}]", self.issues.join(", "))
    }
}

pub struct TransformValidator {
    search: Arc<dyn SearchCapability>,
}

impl TransformValidator {
    pub fn new(search: Arc<dyn SearchCapability>) -> Self {
        Self { search }
    }

    pub async fn validate(&self, transform: &Transform) -> Result<ValidationResult, SearchError> {
        let mut issues = Vec::new();

        if transform.page_size == 0 || transform.page_size > MAX_PAGE_SIZE {
            issues.push(format!(
                "page size {} is outside 1..={MAX_PAGE_SIZE}",
                transform.page_size
            ));
        }
        if transform.target_index == transform.source_index {
            issues.push(format!(
                "target index [{}] is the source index",
                transform.target_index
            ));
        }

        match self.search.field_mappings(&transform.source_index).await? {
            None => issues.push(format!(
                "source index [{}] does not exist",
                transform.source_index
            )),
            Some(mappings) => check_fields(transform, &mappings, &mut issues),
        }

        Ok(ValidationResult { issues })
    }
}

fn check_fields(
    transform: &Transform,
    mappings: &BTreeMap<String, FieldType>,
    issues: &mut Vec<String>,
) {
    for group in &transform.groups {
        let field = group.source_field();
        match (group, mappings.get(field)) {
            (_, None) => issues.push(format!("missing field [{field}] in source index")),
            (Group::Histogram { .. } | Group::DateHistogram { .. }, Some(ty))
                if !ty.is_numeric() =>
            {
                issues.push(format!("field [{field}] is not numeric"));
            }
            _ => {}
        }
    }

    for aggregation in &transform.aggregations {
        let field = aggregation.field.as_str();
        match mappings.get(field) {
            None => issues.push(format!("missing field [{field}] in source index")),
            Some(ty) if aggregation.metric != Metric::ValueCount && !ty.is_numeric() => {
                issues.push(format!("field [{field}] is not numeric"));
            }
            Some(_) => {}
        }
    }

    for field in transform.data_selection_query.fields() {
        if !mappings.contains_key(field) {
            issues.push(format!("missing field [{field}] in source index"));
        }
    }
}
