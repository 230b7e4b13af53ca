//! Process-wide configuration shared by every transform.

use serde::{Deserialize, Serialize};

/// Default lease duration for per-transform locks.
pub const DEFAULT_LOCK_TTL_SECS: u64 = 60;

/// Global configuration shared across all transforms in a process.
///
/// ```
/// use glacier_core::config::GlobalConfig;
///
/// let config = GlobalConfig::default();
/// assert_eq!(config.total_concurrency, None);
/// assert_eq!(config.lock_ttl_secs, 60);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    /// Upper bound on transforms executing a tick at the same time.
    ///
    /// `None` means every transform may run concurrently.
    #[serde(default)]
    pub total_concurrency: Option<usize>,

    /// Maximum random delay added to start times and poll intervals.
    #[serde(default)]
    pub poll_jitter_secs: u64,

    /// Lease duration of the per-transform execution lock.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            total_concurrency: None,
            poll_jitter_secs: 0,
            lock_ttl_secs: default_lock_ttl_secs(),
        }
    }
}

fn default_lock_ttl_secs() -> u64 {
    DEFAULT_LOCK_TTL_SECS
}

impl GlobalConfig {
    /// Merge values from another file's global section.
    ///
    /// Values that differ from the defaults win (last-write-wins).
    pub fn merge_from(&mut self, other: Self) {
        let defaults = Self::default();
        if other.total_concurrency.is_some() {
            self.total_concurrency = other.total_concurrency;
        }
        if other.poll_jitter_secs != defaults.poll_jitter_secs {
            self.poll_jitter_secs = other.poll_jitter_secs;
        }
        if other.lock_ttl_secs != defaults.lock_ttl_secs {
            self.lock_ttl_secs = other.lock_ttl_secs;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_empty_uses_defaults() {
        let config: GlobalConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, GlobalConfig::default());
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = "total_concurrency: 8\npoll_jitter_secs: 5\nlock_ttl_secs: 30";
        let config: GlobalConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.total_concurrency, Some(8));
        assert_eq!(config.poll_jitter_secs, 5);
        assert_eq!(config.lock_ttl_secs, 30);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result: Result<GlobalConfig, _> = serde_yaml::from_str("connection_pooling: true");
        assert!(result.is_err());
    }

    #[test]
    fn test_merge_keeps_explicit_values() {
        let mut base = GlobalConfig {
            total_concurrency: Some(4),
            ..GlobalConfig::default()
        };
        base.merge_from(GlobalConfig {
            lock_ttl_secs: 10,
            ..GlobalConfig::default()
        });

        assert_eq!(base.total_concurrency, Some(4));
        assert_eq!(base.lock_ttl_secs, 10);
        assert_eq!(base.poll_jitter_secs, 0);
    }
}
