use std::env;
use std::str::FromStr;

use anyhow::{anyhow, Result};

pub(crate) fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// Reads `key` and parses it, treating unset or blank values as absent.
pub(crate) fn parsed_var<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|err| anyhow!("invalid value for {key}: {err}")),
        _ => Ok(None),
    }
}

pub(crate) fn bool_var(key: &str) -> Option<bool> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(parse_bool(&value)),
        _ => None,
    }
}

/// Comma separated list; empty entries are dropped.
pub(crate) fn list_var(key: &str) -> Option<Vec<String>> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(
            value
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(ToString::to_string)
                .collect(),
        ),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::parse_bool;

    #[test]
    fn parse_bool_accepts_common_truthy_spellings() {
        for raw in ["1", "true", "YES", " on "] {
            assert!(parse_bool(raw), "{raw:?} should parse as true");
        }
        for raw in ["0", "false", "off", "nope", ""] {
            assert!(!parse_bool(raw), "{raw:?} should parse as false");
        }
    }
}
