//! Configuration infrastructure: multi-file loading, env interpolation,
//! and the sections shared by every glacier deployment.

mod component_key;
mod global;
mod loader;
mod path;
mod vars;

pub use component_key::ComponentKey;
pub use global::{DEFAULT_LOCK_TTL_SECS, GlobalConfig};
pub use loader::{Mergeable, load_from_paths};
pub use path::{CliArgs, ConfigPath, is_yaml_file};
pub use vars::{InterpolationResult, interpolate, interpolate_with};

use serde::{Deserialize, Serialize};

use crate::metrics::DEFAULT_METRICS_ADDR;

/// Metrics configuration for the Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Address to bind the metrics HTTP server (default: "0.0.0.0:9090").
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            address: default_metrics_address(),
        }
    }
}

impl MetricsConfig {
    /// Merge values from another MetricsConfig (last-write-wins).
    pub fn merge_from(&mut self, other: Self) {
        if other.address != DEFAULT_METRICS_ADDR {
            self.address = other.address;
        }
    }
}

fn default_metrics_address() -> String {
    DEFAULT_METRICS_ADDR.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_merge_ignores_default() {
        let mut config = MetricsConfig {
            address: "127.0.0.1:9100".to_string(),
        };
        config.merge_from(MetricsConfig::default());
        assert_eq!(config.address, "127.0.0.1:9100");

        config.merge_from(MetricsConfig {
            address: "127.0.0.1:9200".to_string(),
        });
        assert_eq!(config.address, "127.0.0.1:9200");
    }
}
