//! Typed environment variable lookups
//!
//! Missing variables fall back to the given default. Present but malformed
//! variables are reported instead of being silently replaced.

use std::str::FromStr;

use crate::error::{CnpjError, Result};

/// Read `key` and parse it, falling back to `default` when unset
pub fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

/// Read `key` as a string, falling back to `default` when unset or blank
pub fn string_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Parse an already fetched raw value, attributing failures to `key`
pub fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| CnpjError::invalid_setting(key, raw, e))
}
