//! Multi-file configuration loading.
//!
//! Every file is interpolated and parsed on its own, then merged into one
//! config. Component keys must be unique across all files; problems from
//! every file are collected before reporting.

use std::path::Path;

use indexmap::IndexMap;
use snafu::prelude::*;

use crate::config::{ConfigPath, GlobalConfig, MetricsConfig, interpolate, is_yaml_file};
use crate::error::{
    ConfigError, DuplicateComponentsSnafu, EnvInterpolationSnafu, MultipleErrorsSnafu,
    ReadDirSnafu, ReadFileSnafu, UnsupportedFormatSnafu,
};

/// Configs that can be assembled from several files.
pub trait Mergeable: Sized + Default {
    type Key: Eq + std::hash::Hash + Clone + std::fmt::Display;
    type Component;

    fn components(&self) -> &IndexMap<Self::Key, Self::Component>;
    fn components_mut(&mut self) -> &mut IndexMap<Self::Key, Self::Component>;
    fn global(&self) -> &GlobalConfig;
    fn global_mut(&mut self) -> &mut GlobalConfig;
    fn metrics(&self) -> &MetricsConfig;
    fn metrics_mut(&mut self) -> &mut MetricsConfig;
    fn parse_yaml(contents: &str) -> Result<Self, ConfigError>;

    /// Merge non-component sections. Called after components are merged.
    fn merge_extra(&mut self, _other: &mut Self) -> Result<(), ConfigError> {
        Ok(())
    }

    fn merge(&mut self, mut other: Self) -> Result<(), ConfigError> {
        let duplicates: Vec<String> = other
            .components()
            .keys()
            .filter(|key| self.components().contains_key(*key))
            .map(|key| key.to_string())
            .collect();
        ensure!(
            duplicates.is_empty(),
            DuplicateComponentsSnafu { keys: duplicates }
        );

        for (key, component) in other.components_mut().drain(..) {
            self.components_mut().insert(key, component);
        }

        self.merge_extra(&mut other)?;
        self.global_mut()
            .merge_from(std::mem::take(other.global_mut()));
        self.metrics_mut()
            .merge_from(std::mem::take(other.metrics_mut()));
        Ok(())
    }
}

/// Load and merge every configured path.
pub fn load_from_paths<C: Mergeable>(paths: &[ConfigPath]) -> Result<C, ConfigError> {
    let mut config = C::default();
    let mut errors = Vec::new();

    for path in paths {
        let loaded = match path {
            ConfigPath::File(file) => load_file::<C>(file),
            ConfigPath::Dir(dir) => load_dir::<C>(dir),
        };
        if let Err(e) = loaded.and_then(|partial| config.merge(partial)) {
            errors.push(format!("{}: {}", path.as_path().display(), e));
        }
    }

    ensure!(errors.is_empty(), MultipleErrorsSnafu { errors });
    Ok(config)
}

fn load_file<C: Mergeable>(path: &Path) -> Result<C, ConfigError> {
    ensure!(
        is_yaml_file(path),
        UnsupportedFormatSnafu {
            path: path.to_path_buf()
        }
    );

    let contents = std::fs::read_to_string(path).context(ReadFileSnafu)?;

    let result = interpolate(&contents);
    ensure!(
        result.is_ok(),
        EnvInterpolationSnafu {
            message: result.errors.join("\n")
        }
    );

    C::parse_yaml(&result.text)
}

fn load_dir<C: Mergeable>(dir: &Path) -> Result<C, ConfigError> {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .context(ReadDirSnafu {
            path: dir.to_path_buf(),
        })?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_yaml_file(path))
        .collect();
    files.sort();

    let mut config = C::default();
    let mut errors = Vec::new();

    for path in files {
        if let Err(e) = load_file::<C>(&path).and_then(|partial| config.merge(partial)) {
            errors.push(format!("{}: {}", path.display(), e));
        }
    }

    ensure!(errors.is_empty(), MultipleErrorsSnafu { errors });
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::YamlParseSnafu;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Default, Deserialize)]
    struct JobsConfig {
        #[serde(default)]
        jobs: IndexMap<String, u32>,
        #[serde(default)]
        global: GlobalConfig,
        #[serde(default)]
        metrics: MetricsConfig,
    }

    impl Mergeable for JobsConfig {
        type Key = String;
        type Component = u32;

        fn components(&self) -> &IndexMap<String, u32> {
            &self.jobs
        }
        fn components_mut(&mut self) -> &mut IndexMap<String, u32> {
            &mut self.jobs
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
            serde_yaml::from_str(contents).context(YamlParseSnafu)
        }
    }

    fn write(dir: &TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_dir_merges_sorted_files() {
        let dir = TempDir::new().unwrap();
        write(&dir, "b.yaml", "jobs:\n  second: 2\nglobal:\n  lock_ttl_secs: 15\n");
        write(&dir, "a.yml", "jobs:\n  first: 1\n");
        write(&dir, "notes.txt", "ignored");

        let config: JobsConfig = load_from_paths(&[ConfigPath::dir(dir.path())]).unwrap();

        let keys: Vec<_> = config.jobs.keys().cloned().collect();
        assert_eq!(keys, vec!["first", "second"]);
        assert_eq!(config.global.lock_ttl_secs, 15);
    }

    #[test]
    fn test_duplicate_keys_across_files() {
        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.yaml", "jobs:\n  same: 1\n");
        let b = write(&dir, "b.yaml", "jobs:\n  same: 2\n");

        let err = load_from_paths::<JobsConfig>(&[ConfigPath::file(a), ConfigPath::file(b)])
            .unwrap_err();
        assert!(err.to_string().contains("Duplicate component keys: same"));
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "config.toml", "jobs = {}");

        let err = load_from_paths::<JobsConfig>(&[ConfigPath::file(path)]).unwrap_err();
        assert!(err.to_string().contains("only .yaml/.yml supported"));
    }

    #[test]
    fn test_errors_collected_from_every_path() {
        let dir = TempDir::new().unwrap();
        let bad = write(&dir, "bad.yaml", "jobs: [not, a, map]");
        let missing = dir.path().join("missing.yaml");

        let err = load_from_paths::<JobsConfig>(&[ConfigPath::file(bad), ConfigPath::file(missing)])
            .unwrap_err();
        match err {
            ConfigError::MultipleErrors { errors } => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }
}
