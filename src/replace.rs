use serde_json::Value as JsonValue;

use crate::codec::{Decoded, decode_any};
use crate::value::PhpValue;

/// Result of materializing a replacement for one cell.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplaceOutcome {
    pub new_raw: String,
    pub occurrences: usize,
}

/// Non-overlapping leftmost-match count of `search` in `text`.
pub fn count_occurrences(text: &str, search: &str) -> usize {
    if search.is_empty() {
        return 0;
    }
    text.matches(search).count()
}

/// Count occurrences across the string leaves of a decoded cell without
/// building a replacement. For opaque text this is a raw scan.
pub fn count_in_decoded(decoded: &Decoded, search: &str) -> usize {
    match decoded {
        Decoded::Php(value) => count_php(value, search),
        Decoded::Json(value) => count_json(value, search),
        Decoded::Plain(text) => count_occurrences(text, search),
    }
}

/// Convenience for callers holding only wire text.
pub fn count_in_raw(raw: &str, search: &str) -> usize {
    count_in_decoded(&decode_any(raw), search)
}

/// Substitute `search` with `replacement` at every string leaf and re-emit
/// the cell. Structure is untouched: array pair counts never change, and a
/// PHP string leaf's length prefix is recomputed from its new content by the
/// encoder. When nothing matched the original bytes are returned unchanged,
/// so an untouched cell is never reformatted.
pub fn replace_in_decoded(decoded: &Decoded, search: &str, replacement: &str) -> ReplaceOutcome {
    let occurrences = count_in_decoded(decoded, search);
    if occurrences == 0 {
        return ReplaceOutcome {
            new_raw: decoded.encode(),
            occurrences: 0,
        };
    }
    let new_raw = match decoded {
        Decoded::Php(value) => {
            let (replaced, _) = replace_php(value, search, replacement);
            crate::codec::encode(&replaced)
        }
        Decoded::Json(value) => replace_json(value, search, replacement).to_string(),
        Decoded::Plain(text) => text.replace(search, replacement),
    };
    ReplaceOutcome {
        new_raw,
        occurrences,
    }
}

/// Decode-and-replace in one step, used for raw wire text.
pub fn replace_in_raw(raw: &str, search: &str, replacement: &str) -> ReplaceOutcome {
    if search.is_empty() {
        return ReplaceOutcome {
            new_raw: raw.to_string(),
            occurrences: 0,
        };
    }
    let decoded = decode_any(raw);
    let outcome = replace_in_decoded(&decoded, search, replacement);
    if outcome.occurrences == 0 {
        // Preserve the exact original bytes for untouched cells.
        return ReplaceOutcome {
            new_raw: raw.to_string(),
            occurrences: 0,
        };
    }
    outcome
}

fn count_php(value: &PhpValue, search: &str) -> usize {
    match value {
        PhpValue::Str(content) => count_occurrences(content, search),
        PhpValue::Array(pairs) => pairs
            .iter()
            .map(|(key, val)| count_php(key, search) + count_php(val, search))
            .sum(),
        _ => 0,
    }
}

fn count_json(value: &JsonValue, search: &str) -> usize {
    match value {
        JsonValue::String(content) => count_occurrences(content, search),
        JsonValue::Array(items) => items.iter().map(|item| count_json(item, search)).sum(),
        JsonValue::Object(map) => map
            .iter()
            .map(|(key, val)| count_occurrences(key, search) + count_json(val, search))
            .sum(),
        _ => 0,
    }
}

fn replace_php(value: &PhpValue, search: &str, replacement: &str) -> (PhpValue, usize) {
    match value {
        PhpValue::Str(content) => {
            let hits = count_occurrences(content, search);
            if hits == 0 {
                (value.clone(), 0)
            } else {
                (PhpValue::Str(content.replace(search, replacement)), hits)
            }
        }
        PhpValue::Array(pairs) => {
            let mut total = 0;
            let replaced = pairs
                .iter()
                .map(|(key, val)| {
                    let (new_key, key_hits) = replace_php(key, search, replacement);
                    let (new_val, val_hits) = replace_php(val, search, replacement);
                    total += key_hits + val_hits;
                    (new_key, new_val)
                })
                .collect();
            (PhpValue::Array(replaced), total)
        }
        other => (other.clone(), 0),
    }
}

fn replace_json(value: &JsonValue, search: &str, replacement: &str) -> JsonValue {
    match value {
        JsonValue::String(content) => JsonValue::String(content.replace(search, replacement)),
        JsonValue::Array(items) => JsonValue::Array(
            items
                .iter()
                .map(|item| replace_json(item, search, replacement))
                .collect(),
        ),
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(key, val)| {
                    (
                        key.replace(search, replacement),
                        replace_json(val, search, replacement),
                    )
                })
                .collect(),
        ),
        other => other.clone(),
    }
}
