//! `Key: Value` header parsing shared by markdown artifacts.
//!
//! PLAN documents, reviews, guardrails, and verify reports all carry a flat
//! header block. Keys are matched case-insensitively; markdown headings and
//! blank lines are skipped.

use std::collections::BTreeMap;

/// Parse every `Key: Value` line into a map with lowercased keys.
///
/// Lines starting with `#`, blank lines, and lines without a colon are ignored.
/// When a key repeats, the first occurrence wins.
pub fn parse_header_map(text: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() || map.contains_key(&key) {
            continue;
        }
        map.insert(key, value.trim().to_string());
    }
    map
}

/// Look up a single header value by (case-insensitive) key.
pub fn header_value(text: &str, key: &str) -> Option<String> {
    parse_header_map(text).remove(&key.to_ascii_lowercase())
}

/// Parse a bracketed or bare list value: `[a, b | c; d]` -> `["a","b","c","d"]`.
///
/// Splits on commas, semicolons, and pipes; deduplicates preserving order.
pub fn parse_list(value: &str) -> Vec<String> {
    let inner = value
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim();
    let mut items = Vec::new();
    for part in inner.split(['|', ',', ';']) {
        let item = part.trim();
        if item.is_empty() || items.iter().any(|existing| existing == item) {
            continue;
        }
        items.push(item.to_string());
    }
    items
}

/// Parse an inline map value: `{a: 1, b=2}` -> `{"a":"1","b":"2"}`.
///
/// Entries split on commas and semicolons, keys and values on the first `:`
/// or `=`. Keys are lowercased.
pub fn parse_map(value: &str) -> BTreeMap<String, String> {
    let inner = value
        .trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .trim();
    let mut map = BTreeMap::new();
    for part in inner.split([',', ';']) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let Some(idx) = part.find([':', '=']) else {
            continue;
        };
        let key = part[..idx].trim().to_ascii_lowercase();
        let val = part[idx + 1..].trim().to_string();
        if key.is_empty() || map.contains_key(&key) {
            continue;
        }
        map.insert(key, val);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_map_lowercases_keys_and_skips_headings() {
        let text = "# PLAN\n\nStatus: SIGNED\nScope-Allow: [src]\nno colon here\n";
        let map = parse_header_map(text);
        assert_eq!(map.get("status").map(String::as_str), Some("SIGNED"));
        assert_eq!(map.get("scope-allow").map(String::as_str), Some("[src]"));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn header_map_first_occurrence_wins() {
        let map = parse_header_map("Verdict: APPROVE\nVerdict: BLOCK\n");
        assert_eq!(map.get("verdict").map(String::as_str), Some("APPROVE"));
    }

    #[test]
    fn list_splits_on_all_separators_and_dedupes() {
        assert_eq!(
            parse_list("[src, tests | src; docs]"),
            vec!["src", "tests", "docs"]
        );
        assert!(parse_list("[]").is_empty());
    }

    #[test]
    fn map_accepts_colon_and_equals() {
        let map = parse_map("{max_iterations: 3, max_files=5}");
        assert_eq!(map.get("max_iterations").map(String::as_str), Some("3"));
        assert_eq!(map.get("max_files").map(String::as_str), Some("5"));
    }

    #[test]
    fn value_lookup_is_case_insensitive() {
        assert_eq!(
            header_value("Patch-SHA256: abc123\n", "patch-sha256"),
            Some("abc123".to_string())
        );
    }
}
