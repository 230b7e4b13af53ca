//! Generic component identifier.
//!
//! Specialized as `TransformKey` in glacier. Keys end up in storage paths
//! (`metadata/{key}.json`, `transforms/{key}.json`), so only a conservative
//! character set is accepted.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier for a pipeline component.
#[derive(Debug, Clone, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentKey(String);

impl ComponentKey {
    /// Create a new component key from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the underlying identifier string.
    pub fn id(&self) -> &str {
        &self.0
    }

    /// Check that the key is usable as a path segment.
    ///
    /// Returns a human-readable problem description on failure.
    pub fn check(&self) -> Result<(), String> {
        if self.0.is_empty() {
            return Err("key cannot be empty".to_string());
        }
        if self.0.starts_with('.') {
            return Err(format!("key '{}' cannot start with '.'", self.0));
        }
        if let Some(c) = self
            .0
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
        {
            return Err(format!("key '{}' contains invalid character '{c}'", self.0));
        }
        Ok(())
    }
}

impl fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ComponentKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ComponentKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_accepts_path_safe_keys() {
        assert!(ComponentKey::new("orders-by-customer").check().is_ok());
        assert!(ComponentKey::new("daily_rollup.v2").check().is_ok());
    }

    #[test]
    fn test_check_rejects_empty() {
        assert!(ComponentKey::new("").check().is_err());
    }

    #[test]
    fn test_check_rejects_separators() {
        let err = ComponentKey::new("a/b").check().unwrap_err();
        assert!(err.contains("'/'"));
        assert!(ComponentKey::new("..").check().is_err());
    }

    #[test]
    fn test_serde_is_transparent() {
        let key = ComponentKey::new("rollup");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"rollup\"");

        let parsed: ComponentKey = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_ordering() {
        assert!(ComponentKey::new("alpha") < ComponentKey::new("beta"));
    }
}
