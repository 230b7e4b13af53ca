//! Transform job definition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::query::Query;

/// Version stamp of a record that has never been stored.
pub const UNASSIGNED_SEQ_NO: i64 = -2;
pub const UNASSIGNED_PRIMARY_TERM: i64 = 0;

/// Largest page size a transform may request.
pub const MAX_PAGE_SIZE: usize = 10_000;

/// How a group turns a document field into a bucket key component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Group {
    Terms {
        source_field: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_field: Option<String>,
    },
    Histogram {
        source_field: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_field: Option<String>,
        interval: f64,
    },
    DateHistogram {
        source_field: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_field: Option<String>,
        /// Fixed interval such as `1h`, `15m` or `1.5d`.
        fixed_interval: String,
    },
}

impl Group {
    pub fn source_field(&self) -> &str {
        match self {
            Group::Terms { source_field, .. }
            | Group::Histogram { source_field, .. }
            | Group::DateHistogram { source_field, .. } => source_field,
        }
    }

    /// Field the bucket value is written to; defaults to the source field.
    pub fn target_field(&self) -> &str {
        match self {
            Group::Terms {
                source_field,
                target_field,
            }
            | Group::Histogram {
                source_field,
                target_field,
                ..
            }
            | Group::DateHistogram {
                source_field,
                target_field,
                ..
            } => target_field.as_deref().unwrap_or(source_field),
        }
    }

    /// Bucket width in field units (milliseconds for date histograms).
    pub fn interval(&self) -> Option<f64> {
        match self {
            Group::Terms { .. } => None,
            Group::Histogram { interval, .. } => Some(*interval),
            Group::DateHistogram { fixed_interval, .. } => parse_fixed_interval(fixed_interval),
        }
    }

    /// Whether bucket bounds computed from this group's keys can be off by
    /// floating point error, so range filters must be widened.
    pub fn has_fractional_interval(&self) -> bool {
        self.interval().is_some_and(|i| i.fract() != 0.0)
    }
}

/// Parse a fixed interval (`500ms`, `30s`, `15m`, `1.5h`, `1d`) into milliseconds.
pub fn parse_fixed_interval(value: &str) -> Option<f64> {
    let value = value.trim();
    let split = value.find(|c: char| c.is_ascii_alphabetic())?;
    let (amount, unit) = value.split_at(split);
    let amount: f64 = amount.trim().parse().ok()?;
    let unit_ms = match unit {
        "ms" => 1.0,
        "s" => 1_000.0,
        "m" => 60_000.0,
        "h" => 3_600_000.0,
        "d" => 86_400_000.0,
        _ => return None,
    };
    let ms = amount * unit_ms;
    (ms.is_finite() && ms > 0.0).then_some(ms)
}

/// Metric computed per bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Sum,
    Min,
    Max,
    Avg,
    ValueCount,
}

/// A named metric over a source field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    /// Output field name.
    pub name: String,
    #[serde(rename = "type")]
    pub metric: Metric,
    pub field: String,
}

/// When the scheduler triggers ticks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub interval_secs: u64,
}

impl Schedule {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Identity the transform's searches run as.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityContext {
    pub user: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// A transform job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub id: String,
    #[serde(default)]
    pub metadata_id: Option<String>,
    pub source_index: String,
    pub target_index: String,
    #[serde(default)]
    pub data_selection_query: Query,
    pub groups: Vec<Group>,
    #[serde(default)]
    pub aggregations: Vec<Aggregation>,
    pub page_size: usize,
    pub continuous: bool,
    pub enabled: bool,
    #[serde(default)]
    pub enabled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub schedule: Schedule,
    #[serde(default)]
    pub owner: Option<SecurityContext>,
    pub seq_no: i64,
    pub primary_term: i64,
}

impl Transform {
    /// Whether the definition (not the runtime state) differs from `other`.
    pub fn definition_differs(&self, other: &Transform) -> bool {
        self.source_index != other.source_index
            || self.target_index != other.target_index
            || self.data_selection_query != other.data_selection_query
            || self.groups != other.groups
            || self.aggregations != other.aggregations
            || self.page_size != other.page_size
            || self.continuous != other.continuous
            || self.schedule != other.schedule
            || self.owner != other.owner
    }

    /// Mark the record disabled as of `now`.
    pub fn disable(&mut self, now: DateTime<Utc>) {
        self.enabled = false;
        self.enabled_at = None;
        self.updated_at = now;
    }
}
