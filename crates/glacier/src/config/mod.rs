//! Configuration for the glacier transform engine.

mod transform_key;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use tracing::info;

pub use glacier_core::config::{
    ConfigPath, GlobalConfig, InterpolationResult, Mergeable, MetricsConfig, interpolate,
    load_from_paths,
};
pub use transform_key::TransformKey;

use glacier_core::error::{ConfigError, PipelineSetupError};
use glacier_core::{AppConfig, PipelineContext};

use crate::capability::FieldType;
use crate::model::{
    Aggregation, Group, MAX_PAGE_SIZE, Query, Schedule, SecurityContext, Transform,
    UNASSIGNED_PRIMARY_TERM, UNASSIGNED_SEQ_NO,
};
use crate::pipeline::{TransformPipeline, build_pipelines};

fn default_shards() -> u32 {
    1
}

fn default_page_size() -> usize {
    500
}

fn default_interval_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

/// A source index fed from newline-delimited JSON files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Directory holding `*.ndjson` files; new lines are ingested every tick.
    pub uri: String,
    #[serde(default = "default_shards")]
    pub shards: u32,
    /// Explicit field types. Unmapped fields are typed from their first value.
    #[serde(default)]
    pub mappings: BTreeMap<String, FieldType>,
}

/// Definition of one transform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Name of a configured source.
    pub source: String,
    /// Target index the aggregated documents are written to.
    pub target: String,
    /// Restricts the source documents the transform sees.
    #[serde(default)]
    pub filter: Query,
    pub groups: Vec<Group>,
    #[serde(default)]
    pub aggregations: Vec<Aggregation>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_true")]
    pub continuous: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Only applies when the transform is first stored.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub owner: Option<SecurityContext>,
}

impl TransformConfig {
    /// Build the stored transform record for `key`.
    pub fn to_transform(&self, key: &TransformKey, now: DateTime<Utc>) -> Transform {
        Transform {
            id: key.id().to_string(),
            metadata_id: None,
            source_index: self.source.clone(),
            target_index: self.target.clone(),
            data_selection_query: self.filter.clone(),
            groups: self.groups.clone(),
            aggregations: self.aggregations.clone(),
            page_size: self.page_size,
            continuous: self.continuous,
            enabled: self.enabled,
            enabled_at: self.enabled.then_some(now),
            updated_at: now,
            schedule: Schedule {
                interval_secs: self.interval_secs,
            },
            owner: self.owner.clone(),
            seq_no: UNASSIGNED_SEQ_NO,
            primary_term: UNASSIGNED_PRIMARY_TERM,
        }
    }

    fn check(&self) -> Result<(), String> {
        if self.groups.is_empty() {
            return Err("at least one group is required".to_string());
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(format!(
                "page_size must be between 1 and {MAX_PAGE_SIZE}, got {}",
                self.page_size
            ));
        }
        if self.interval_secs == 0 {
            return Err("interval_secs must be positive".to_string());
        }

        for group in &self.groups {
            if matches!(group, Group::Histogram { .. } | Group::DateHistogram { .. })
                && group.interval().is_none_or(|i| i.is_nan() || i <= 0.0)
            {
                return Err(format!(
                    "group on '{}' needs a positive interval",
                    group.source_field()
                ));
            }
        }

        let mut seen = HashSet::new();
        let outputs = self
            .groups
            .iter()
            .map(|g| g.target_field())
            .chain(self.aggregations.iter().map(|a| a.name.as_str()));
        for field in outputs {
            if !seen.insert(field) {
                return Err(format!("output field '{field}' is defined twice"));
            }
        }

        Ok(())
    }
}

/// Main configuration for glacier.
///
/// # Example
///
/// ```yaml
/// state_uri: /var/lib/glacier/state
/// output_uri: /var/lib/glacier/output
///
/// sources:
///   orders:
///     uri: /var/lib/glacier/incoming/orders
///     shards: 2
///     mappings:
///       amount: double
///       placed_at: date
///
/// transforms:
///   revenue_by_customer:
///     source: orders
///     target: revenue_by_customer
///     groups:
///       - type: terms
///         source_field: customer
///     aggregations:
///       - name: revenue
///         type: sum
///         field: amount
///     interval_secs: 30
///
/// global:
///   total_concurrency: 4
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Where transform records and metadata are kept.
    #[serde(default)]
    pub state_uri: String,
    /// Where target documents are written. Without it they only live in
    /// the in-process document engine.
    #[serde(default)]
    pub output_uri: Option<String>,
    #[serde(default)]
    pub sources: IndexMap<String, SourceConfig>,
    #[serde(default)]
    pub transforms: IndexMap<TransformKey, TransformConfig>,
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Mergeable for Config {
    type Key = TransformKey;
    type Component = TransformConfig;

    fn components(&self) -> &IndexMap<Self::Key, Self::Component> {
        &self.transforms
    }

    fn components_mut(&mut self) -> &mut IndexMap<Self::Key, Self::Component> {
        &mut self.transforms
    }

    fn global(&self) -> &GlobalConfig {
        &self.global
    }

    fn global_mut(&mut self) -> &mut GlobalConfig {
        &mut self.global
    }

    fn metrics(&self) -> &MetricsConfig {
        &self.metrics
    }

    fn metrics_mut(&mut self) -> &mut MetricsConfig {
        &mut self.metrics
    }

    fn parse_yaml(contents: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(contents).map_err(|source| ConfigError::YamlParse { source })
    }

    fn merge_extra(&mut self, other: &mut Self) -> Result<(), ConfigError> {
        let duplicates: Vec<String> = other
            .sources
            .keys()
            .filter(|name| self.sources.contains_key(*name))
            .cloned()
            .collect();
        if !duplicates.is_empty() {
            return Err(ConfigError::DuplicateComponents { keys: duplicates });
        }
        self.sources.extend(other.sources.drain(..));

        if !other.state_uri.is_empty() {
            self.state_uri = std::mem::take(&mut other.state_uri);
        }
        if other.output_uri.is_some() {
            self.output_uri = other.output_uri.take();
        }
        Ok(())
    }
}

impl Config {
    /// Parse configuration from a YAML string.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let result = interpolate(contents);
        if !result.is_ok() {
            return Err(ConfigError::EnvInterpolation {
                message: result.errors.join("\n"),
            });
        }

        let config: Config = serde_yaml::from_str(&result.text)
            .map_err(|source| ConfigError::YamlParse { source })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Checks:
    /// - `state_uri` is set
    /// - keys are usable as record ids
    /// - every transform reads a configured source and is well formed
    /// - no two transforms write the same target, and no target is a source
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.state_uri.trim().is_empty() {
            return Err(ConfigError::EmptyStateUri);
        }

        for (key, transform) in &self.transforms {
            key.check()
                .map_err(|message| ConfigError::InvalidTransform {
                    transform: key.id().to_string(),
                    message,
                })?;

            if !self.sources.contains_key(&transform.source) {
                return Err(ConfigError::UnknownSource {
                    transform: key.id().to_string(),
                    source_name: transform.source.clone(),
                });
            }

            transform
                .check()
                .map_err(|message| ConfigError::InvalidTransform {
                    transform: key.id().to_string(),
                    message,
                })?;
        }

        let mut targets: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (key, transform) in &self.transforms {
            targets
                .entry(transform.target.as_str())
                .or_default()
                .push(key.id());
        }

        let mut conflicts = Vec::new();
        for (target, keys) in &targets {
            if keys.len() > 1 {
                conflicts.push(format!("target '{target}' claimed by: {keys:?}"));
            }
            if self.sources.contains_key(*target) {
                conflicts.push(format!("target '{target}' is also a source"));
            }
        }
        if !conflicts.is_empty() {
            return Err(ConfigError::ResourceConflict {
                message: conflicts.join("; "),
            });
        }

        Ok(())
    }

    pub fn transforms(&self) -> impl Iterator<Item = (&TransformKey, &TransformConfig)> {
        self.transforms.iter()
    }

    pub fn transform_count(&self) -> usize {
        self.transforms.len()
    }
}

impl AppConfig for Config {
    type Pipeline = TransformPipeline;

    const COMPONENT_NAME: &'static str = "transform";

    fn from_paths(paths: &[ConfigPath]) -> Result<Self, ConfigError> {
        let config: Self = load_from_paths(paths)?;
        config.validate()?;
        Ok(config)
    }

    fn create_pipelines(
        &self,
        context: PipelineContext,
    ) -> impl Future<Output = Result<Vec<Self::Pipeline>, PipelineSetupError>> {
        async move {
            build_pipelines(self, context)
                .await
                .map_err(|e| PipelineSetupError::CreatePipelines {
                    source: Box::new(e),
                })
        }
    }

    fn log_startup_info(&self) {
        info!(
            transforms = self.transform_count(),
            sources = self.sources.len(),
            state_uri = %self.state_uri,
            "Starting glacier"
        );
        for (key, transform) in self.transforms() {
            info!(
                target = %key,
                source = %transform.source,
                index = %transform.target,
                continuous = transform.continuous,
                interval_secs = transform.interval_secs,
                "Configured transform"
            );
        }
    }
}
