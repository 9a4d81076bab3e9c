//! `${VAR}` / `${VAR:-default}` / `${VAR:?message}` environment interpolation
//! for configuration YAML.
//!
//! A regex-driven multi-pass substitution over this system's three-way
//! `${VAR}` grammar, which reads
//! process environment variables directly rather than a secret store.

use once_cell::sync::Lazy;
use regex::Regex;

use dael_types::{DaelError, ErrorCode};

static TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*)|:\?([^}]*))?\}").expect("static pattern compiles"));

/// Interpolates every `${...}` token in `value` against the process
/// environment. `${VAR}` is required (missing ⇒ `CONFIG_INVALID`),
/// `${VAR:-default}` falls back to a literal default, and `${VAR:?message}`
/// fails with a caller-supplied message when `VAR` is unset.
pub fn interpolate_string(value: &str) -> Result<String, DaelError> {
    let mut result = String::with_capacity(value.len());
    let mut last_end = 0usize;
    for caps in TOKEN.captures_iter(value) {
        let whole = caps.get(0).expect("group 0 always matches");
        result.push_str(&value[last_end..whole.start()]);

        let name = &caps[1];
        let resolved = match std::env::var(name) {
            Ok(v) => v,
            Err(_) => {
                if let Some(default) = caps.get(3) {
                    default.as_str().to_string()
                } else if let Some(message) = caps.get(4) {
                    return Err(DaelError::new(ErrorCode::ConfigInvalid, format!("environment variable '{name}' is required: {}", message.as_str())));
                } else {
                    return Err(DaelError::new(ErrorCode::ConfigInvalid, format!("environment variable '{name}' is not set")));
                }
            }
        };
        result.push_str(&resolved);
        last_end = whole.end();
    }
    result.push_str(&value[last_end..]);
    Ok(result)
}

/// Recursively interpolates every string leaf of a YAML/JSON value.
pub fn interpolate_value(value: &mut serde_yaml::Value) -> Result<(), DaelError> {
    match value {
        serde_yaml::Value::String(s) => {
            *s = interpolate_string(s)?;
            Ok(())
        }
        serde_yaml::Value::Sequence(items) => {
            for item in items {
                interpolate_value(item)?;
            }
            Ok(())
        }
        serde_yaml::Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                interpolate_value(v)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_variable_resolves_when_set() {
        std::env::set_var("DAEL_TEST_REQUIRED", "hello");
        let result = interpolate_string("value: ${DAEL_TEST_REQUIRED}").unwrap();
        assert_eq!(result, "value: hello");
        std::env::remove_var("DAEL_TEST_REQUIRED");
    }

    #[test]
    fn missing_required_variable_is_config_invalid() {
        std::env::remove_var("DAEL_TEST_MISSING");
        let error = interpolate_string("${DAEL_TEST_MISSING}").unwrap_err();
        assert_eq!(error.code, ErrorCode::ConfigInvalid);
    }

    #[test]
    fn default_is_used_when_variable_is_unset() {
        std::env::remove_var("DAEL_TEST_DEFAULT");
        let result = interpolate_string("${DAEL_TEST_DEFAULT:-fallback}").unwrap();
        assert_eq!(result, "fallback");
    }

    #[test]
    fn custom_message_surfaces_on_missing_variable() {
        std::env::remove_var("DAEL_TEST_MSG");
        let error = interpolate_string("${DAEL_TEST_MSG:?set DAEL_TEST_MSG before starting}").unwrap_err();
        assert!(error.message.contains("set DAEL_TEST_MSG before starting"));
    }
}
