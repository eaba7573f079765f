// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Suffix parsing for the duration/size config keys in the config table:
//! durations take `ms|s|min|h|d`, sizes take `b|k|m|g`.

use serde::{Deserialize, Deserializer};

use crate::config::ConfigError;

/// A config field that accepts either a bare integer (its natural unit) or
/// a suffixed string (`"30s"`, `"64k"`), as spec §6 requires for every
/// duration/size key.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum UnitValue {
    Int(u64),
    Text(String),
}

/// `#[serde(deserialize_with = "deserialize_duration_ms")]` for a `u64`
/// field holding milliseconds: accepts a bare integer (already milliseconds)
/// or a suffixed string parsed by [`parse_duration_ms`].
pub fn deserialize_duration_ms<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match UnitValue::deserialize(deserializer)? {
        UnitValue::Int(n) => Ok(n),
        UnitValue::Text(s) => parse_duration_ms(&s).map_err(serde::de::Error::custom),
    }
}

/// `#[serde(deserialize_with = "deserialize_size_bytes")]` for a `u64` field
/// holding bytes: accepts a bare integer (already bytes) or a suffixed
/// string parsed by [`parse_size_bytes`].
pub fn deserialize_size_bytes<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match UnitValue::deserialize(deserializer)? {
        UnitValue::Int(n) => Ok(n),
        UnitValue::Text(s) => parse_size_bytes(&s).map_err(serde::de::Error::custom),
    }
}

/// Parse a duration string like `"500ms"`, `"30s"`, `"5min"` into
/// milliseconds. A bare integer is treated as milliseconds.
pub fn parse_duration_ms(input: &str) -> Result<u64, ConfigError> {
    let input = input.trim();
    let (number, unit) = split_suffix(input, &["ms", "min", "s", "h", "d"]);
    let value: u64 = number
        .parse()
        .map_err(|_| ConfigError::InvalidDuration(input.to_string()))?;
    let ms = match unit {
        "" | "ms" => value,
        "s" => value.saturating_mul(1_000),
        "min" => value.saturating_mul(60_000),
        "h" => value.saturating_mul(3_600_000),
        "d" => value.saturating_mul(86_400_000),
        _ => return Err(ConfigError::InvalidDuration(input.to_string())),
    };
    Ok(ms)
}

/// Parse a size string like `"64k"`, `"1g"`, `"512b"` into bytes. A bare
/// integer is treated as bytes.
pub fn parse_size_bytes(input: &str) -> Result<u64, ConfigError> {
    let input = input.trim();
    let (number, unit) = split_suffix(input, &["b", "k", "m", "g"]);
    let value: u64 = number
        .parse()
        .map_err(|_| ConfigError::InvalidSize(input.to_string()))?;
    let bytes = match unit {
        "" | "b" => value,
        "k" => value.saturating_mul(1 << 10),
        "m" => value.saturating_mul(1 << 20),
        "g" => value.saturating_mul(1 << 30),
        _ => return Err(ConfigError::InvalidSize(input.to_string())),
    };
    Ok(bytes)
}

/// Split `input` into its leading digits and a known trailing unit,
/// longest-suffix-first so `"min"` isn't mistaken for `"m"`.
fn split_suffix<'a>(input: &'a str, units: &[&str]) -> (&'a str, &'a str) {
    let mut candidates: Vec<&&str> = units.iter().collect();
    candidates.sort_by_key(|u| std::cmp::Reverse(u.len()));
    for unit in candidates {
        if let Some(number) = input.strip_suffix(unit) {
            if !number.is_empty() {
                return (number, unit);
            }
        }
    }
    (input, "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_integer_duration_is_milliseconds() {
        assert_eq!(parse_duration_ms("250").unwrap(), 250);
    }

    #[test]
    fn duration_suffixes_convert_to_milliseconds() {
        assert_eq!(parse_duration_ms("250ms").unwrap(), 250);
        assert_eq!(parse_duration_ms("5s").unwrap(), 5_000);
        assert_eq!(parse_duration_ms("2min").unwrap(), 120_000);
        assert_eq!(parse_duration_ms("1h").unwrap(), 3_600_000);
        assert_eq!(parse_duration_ms("1d").unwrap(), 86_400_000);
    }

    #[test]
    fn min_suffix_is_not_shadowed_by_m_prefix_matching() {
        assert_eq!(parse_duration_ms("3min").unwrap(), 180_000);
    }

    #[test]
    fn size_suffixes_convert_to_bytes() {
        assert_eq!(parse_size_bytes("512b").unwrap(), 512);
        assert_eq!(parse_size_bytes("64k").unwrap(), 64 * 1024);
        assert_eq!(parse_size_bytes("1m").unwrap(), 1 << 20);
        assert_eq!(parse_size_bytes("1g").unwrap(), 1 << 30);
    }

    #[test]
    fn garbage_duration_is_rejected() {
        assert!(parse_duration_ms("soon").is_err());
    }

    #[test]
    fn garbage_size_is_rejected() {
        assert!(parse_size_bytes("huge").is_err());
    }
}
