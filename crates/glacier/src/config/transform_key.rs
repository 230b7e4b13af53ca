//! Transform identifier.

use glacier_core::ComponentKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier for a transform in glacier configuration.
///
/// The key is also the transform's id in the transform and metadata stores.
#[derive(Debug, Clone, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransformKey(ComponentKey);

impl TransformKey {
    pub fn new(id: impl Into<String>) -> Self {
        Self(ComponentKey::new(id))
    }

    pub fn id(&self) -> &str {
        self.0.id()
    }

    /// Check that the key can be used as a stored record id.
    pub fn check(&self) -> Result<(), String> {
        self.0.check()
    }
}

impl fmt::Display for TransformKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for TransformKey {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_id() {
        let key = TransformKey::new("orders_by_customer");
        assert_eq!(key.id(), "orders_by_customer");
        assert_eq!(key.to_string(), "orders_by_customer");
    }

    #[test]
    fn test_serde_is_transparent() {
        let key = TransformKey::new("daily-revenue");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"daily-revenue\"");

        let parsed: TransformKey = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_check_rejects_path_separators() {
        assert!(TransformKey::new("a/b").check().is_err());
        assert!(TransformKey::new("").check().is_err());
        assert!(TransformKey::new("orders.v2").check().is_ok());
    }
}
