//! Typed environment lookups
//!
//! Unset variables fall back to the supplied default; set-but-unparseable
//! variables are an error rather than being silently ignored.

use std::str::FromStr;

use crate::error::{CommonError, Result};

/// Read `key` and parse it, or return `default` when it is unset or empty.
pub fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => {
            value
                .trim()
                .parse()
                .map_err(|e: T::Err| CommonError::InvalidEnv {
                    key: key.to_string(),
                    value,
                    reason: e.to_string(),
                })
        },
        _ => Ok(default),
    }
}

/// Read `key` as a string, or return `default` when it is unset or empty.
pub fn string_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Read `key` as a string, failing if it is unset or empty.
pub fn required(key: &str) -> Result<String> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| CommonError::MissingEnv(key.to_string()))
}
