//! Property and measurement sanitization.
//!
//! User-supplied keys and values are trimmed and truncated to the wire
//! limits before an envelope is handed to the transmitter. Both entry
//! points are pure: the input map is never mutated and the sanitized map
//! is freshly allocated.

use std::collections::BTreeMap;

/// Maximum property or measurement key length, in characters.
pub const MAX_KEY_LENGTH: usize = 150;

/// Maximum property value length, in characters.
pub const MAX_VALUE_LENGTH: usize = 8192;

/// Placeholder for keys that are empty after trimming.
const EMPTY_KEY: &str = "empty";

/// Sanitizes a property map.
///
/// Keys are trimmed, truncated to [`MAX_KEY_LENGTH`], renamed to `empty`
/// when nothing is left, and deduplicated with a numeric suffix. Values
/// are trimmed and truncated to [`MAX_VALUE_LENGTH`]; entries whose value
/// ends up empty are dropped.
pub fn sanitize_properties(properties: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut sanitized = BTreeMap::new();
    for (key, value) in properties {
        let value = truncate(value.trim(), MAX_VALUE_LENGTH);
        if value.is_empty() {
            continue;
        }
        let key = unique_key(sanitize_key(key), &sanitized);
        sanitized.insert(key, value.to_string());
    }
    sanitized
}

/// Sanitizes a measurement map. Keys receive the same treatment as
/// property keys; numeric values pass through untouched.
pub fn sanitize_measurements(measurements: &BTreeMap<String, f64>) -> BTreeMap<String, f64> {
    let mut sanitized = BTreeMap::new();
    for (key, value) in measurements {
        let key = unique_key(sanitize_key(key), &sanitized);
        sanitized.insert(key, *value);
    }
    sanitized
}

fn sanitize_key(key: &str) -> String {
    let key = truncate(key.trim(), MAX_KEY_LENGTH);
    if key.is_empty() {
        EMPTY_KEY.to_string()
    } else {
        key.to_string()
    }
}

/// Bumps a numeric suffix until the key no longer collides, shortening the
/// stem so the result stays within [`MAX_KEY_LENGTH`].
fn unique_key<V>(key: String, taken: &BTreeMap<String, V>) -> String {
    if !taken.contains_key(&key) {
        return key;
    }
    let mut suffix = 1u32;
    loop {
        let digits = suffix.to_string();
        let stem = truncate(&key, MAX_KEY_LENGTH - digits.len());
        let candidate = format!("{stem}{digits}");
        if !taken.contains_key(&candidate) {
            return candidate;
        }
        suffix += 1;
    }
}

/// Cuts `s` to at most `max` characters, on a character boundary.
fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((index, _)) => &s[..index],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn trims_and_keeps_normal_entries() {
        let sanitized = sanitize_properties(&props(&[(" key ", " value ")]));
        assert_eq!(sanitized.get("key").map(String::as_str), Some("value"));
    }

    #[test]
    fn long_keys_and_values_are_truncated() {
        let long_key = "k".repeat(200);
        let long_value = "v".repeat(9000);
        let sanitized = sanitize_properties(&props(&[(&long_key, &long_value)]));
        let (key, value) = sanitized.iter().next().unwrap();
        assert_eq!(key.len(), MAX_KEY_LENGTH);
        assert_eq!(value.len(), MAX_VALUE_LENGTH);
    }

    #[test]
    fn empty_key_is_renamed() {
        let sanitized = sanitize_properties(&props(&[("   ", "value")]));
        assert_eq!(sanitized.get("empty").map(String::as_str), Some("value"));
    }

    #[test]
    fn empty_property_values_are_dropped() {
        let sanitized = sanitize_properties(&props(&[("key", "  ")]));
        assert!(sanitized.is_empty());
    }

    #[test]
    fn colliding_keys_get_numeric_suffixes() {
        // Two keys that only differ past the truncation limit collide.
        let key_a = format!("{}a", "k".repeat(MAX_KEY_LENGTH));
        let key_b = format!("{}b", "k".repeat(MAX_KEY_LENGTH));
        let sanitized = sanitize_properties(&props(&[(&key_a, "1"), (&key_b, "2")]));
        assert_eq!(sanitized.len(), 2);
        let mut keys: Vec<_> = sanitized.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys[0], "k".repeat(MAX_KEY_LENGTH));
        assert_eq!(keys[1], format!("{}1", "k".repeat(MAX_KEY_LENGTH - 1)));
    }

    #[test]
    fn sanitized_keys_are_distinct_and_bounded() {
        let input = props(&[
            ("dup", "1"),
            (" dup", "2"),
            ("dup ", "3"),
            ("", "4"),
            ("  ", "5"),
        ]);
        let sanitized = sanitize_properties(&input);
        assert_eq!(sanitized.len(), input.len());
        for key in sanitized.keys() {
            assert!(!key.is_empty());
            assert!(key.len() <= MAX_KEY_LENGTH);
        }
    }

    #[test]
    fn measurements_keep_values_for_sanitized_keys() {
        let mut measurements = BTreeMap::new();
        measurements.insert(" elapsed ".to_string(), 1.5);
        measurements.insert("".to_string(), 0.0);
        let sanitized = sanitize_measurements(&measurements);
        assert_eq!(sanitized.get("elapsed"), Some(&1.5));
        assert_eq!(sanitized.get("empty"), Some(&0.0));
    }

    #[test]
    fn input_is_not_mutated() {
        let input = props(&[(" key ", "value")]);
        let before = input.clone();
        let _ = sanitize_properties(&input);
        assert_eq!(input, before);
    }
}
