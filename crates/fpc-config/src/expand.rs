//! Environment variable expansion for string settings.

use crate::ConfigError;

/// Expand `${VAR}` and `${VAR:-default}` references in `value`.
///
/// `field` names the setting in the error message.
pub(crate) fn expand_env(value: &str, field: &str) -> Result<String, ConfigError> {
    shellexpand::env(value)
        .map(std::borrow::Cow::into_owned)
        .map_err(|e| ConfigError::EnvVar {
            field: field.to_owned(),
            message: format!("${{{}}} {}", e.var_name, e.cause),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_literal() {
        assert_eq!(expand_env("plain", "site.id").unwrap(), "plain");
    }

    #[test]
    fn test_expand_default() {
        // SAFETY: test runs single-threaded per test function
        unsafe {
            std::env::remove_var("FPC_EXPAND_DEFAULT_TEST");
        }

        let value = expand_env("${FPC_EXPAND_DEFAULT_TEST:-fallback}", "site.secret").unwrap();

        assert_eq!(value, "fallback");
    }

    #[test]
    fn test_expand_missing_names_var_and_field() {
        // SAFETY: test runs single-threaded per test function
        unsafe {
            std::env::remove_var("FPC_EXPAND_MISSING_TEST");
        }

        let err = expand_env("${FPC_EXPAND_MISSING_TEST}", "site.secret").unwrap_err();

        assert!(err.to_string().contains("FPC_EXPAND_MISSING_TEST"));
        assert!(err.to_string().contains("site.secret"));
    }
}
