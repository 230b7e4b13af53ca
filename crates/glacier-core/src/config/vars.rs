//! Environment variable interpolation for config files.
//!
//! Supported forms:
//! - `$VAR` / `${VAR}`: substitute, error when unset
//! - `${VAR:-default}`: default when unset or empty
//! - `${VAR-default}`: default only when unset
//! - `$$`: literal `$`

use regex::{Captures, Regex};
use std::sync::LazyLock;

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \$\$
        |
        \$\{ (?P<braced>[A-Za-z_][A-Za-z0-9_]*) (?: (?P<op>:?-) (?P<default>[^}]*) )? \}
        |
        \$(?P<bare>[A-Za-z_][A-Za-z0-9_]*)
        ",
    )
    .expect("Invalid regex pattern")
});

/// Result of environment variable interpolation.
#[derive(Debug)]
pub struct InterpolationResult {
    /// The interpolated text.
    pub text: String,
    /// Every problem found, so a user sees all missing variables at once.
    pub errors: Vec<String>,
}

impl InterpolationResult {
    /// Returns true if there were no errors.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Interpolate variables from the process environment.
pub fn interpolate(input: &str) -> InterpolationResult {
    interpolate_with(input, |name| std::env::var(name).ok())
}

/// Interpolate variables resolved through `lookup`.
pub fn interpolate_with<F>(input: &str, lookup: F) -> InterpolationResult
where
    F: Fn(&str) -> Option<String>,
{
    let mut errors = Vec::new();

    let text = ENV_VAR_PATTERN
        .replace_all(input, |caps: &Captures| {
            let whole = &caps[0];
            if whole == "$$" {
                return "$".to_string();
            }

            let Some(name) = caps.name("braced").or_else(|| caps.name("bare")) else {
                return whole.to_string();
            };
            let name = name.as_str();
            let op = caps.name("op").map(|m| m.as_str());
            let default = caps.name("default").map(|m| m.as_str());

            match (lookup(name), default) {
                (Some(value), _) if value.contains(['\n', '\r']) => {
                    errors.push(format!(
                        "environment variable '{name}' contains newlines, which is not allowed"
                    ));
                    whole.to_string()
                }
                (Some(value), Some(default)) if value.is_empty() && op == Some(":-") => {
                    default.to_string()
                }
                (Some(value), _) => value,
                (None, Some(default)) => default.to_string(),
                (None, None) => {
                    errors.push(format!("environment variable '{name}' is not set"));
                    whole.to_string()
                }
            }
        })
        .into_owned();

    InterpolationResult { text, errors }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn run(input: &str, vars: &[(&str, &str)]) -> InterpolationResult {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        interpolate_with(input, |name| vars.get(name).cloned())
    }

    #[test]
    fn test_bare_and_braced_substitution() {
        let result = run("a: $STATE\nb: ${STATE}", &[("STATE", "/var/lib/glacier")]);
        assert!(result.is_ok());
        assert_eq!(result.text, "a: /var/lib/glacier\nb: /var/lib/glacier");
    }

    #[test]
    fn test_missing_variable_is_reported() {
        let result = run("uri: $GLACIER_MISSING", &[]);
        assert!(!result.is_ok());
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("GLACIER_MISSING"));
        assert_eq!(result.text, "uri: $GLACIER_MISSING");
    }

    #[test]
    fn test_colon_dash_default_applies_to_empty() {
        let result = run("x: ${EMPTY:-fallback}", &[("EMPTY", "")]);
        assert_eq!(result.text, "x: fallback");
    }

    #[test]
    fn test_dash_default_keeps_empty() {
        let result = run("x: '${EMPTY-fallback}'", &[("EMPTY", "")]);
        assert_eq!(result.text, "x: ''");

        let result = run("x: ${UNSET-fallback}", &[]);
        assert_eq!(result.text, "x: fallback");
    }

    #[test]
    fn test_newlines_rejected() {
        let result = run("x: $BAD", &[("BAD", "a\nb")]);
        assert!(!result.is_ok());
        assert!(result.errors[0].contains("newlines"));
    }

    #[test]
    fn test_escape_sequence() {
        let result = run("price: $$100", &[]);
        assert!(result.is_ok());
        assert_eq!(result.text, "price: $100");
    }
}
