//! Environment variable utilities
//!
//! Generic `env_get<T>` for parsing environment variables with defaults.
//!
//! ```ignore
//! use spindle_core::env::{env_get, env_get_bool};
//!
//! let stack: usize = env_get("SPINDLE_STACK_SIZE", 128 * 1024);
//! let debug: bool = env_get_bool("SPINDLE_DEBUG", false);
//! ```

use std::str::FromStr;

/// Get environment variable parsed as type T, or return the default.
///
/// Works with any type that implements `FromStr`; parse failures fall back
/// to the default.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Get environment variable as boolean.
///
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true. Anything
/// else set means false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_default() {
        assert_eq!(env_get("SPINDLE_TEST_UNSET_VAR", 42usize), 42);
        assert!(!env_get_bool("SPINDLE_TEST_UNSET_VAR", false));
    }

    #[test]
    fn test_env_parse() {
        std::env::set_var("SPINDLE_TEST_ENV_PARSE", "17");
        assert_eq!(env_get("SPINDLE_TEST_ENV_PARSE", 0usize), 17);
        std::env::set_var("SPINDLE_TEST_ENV_PARSE", "not a number");
        assert_eq!(env_get("SPINDLE_TEST_ENV_PARSE", 5usize), 5);
        std::env::remove_var("SPINDLE_TEST_ENV_PARSE");
    }
}
