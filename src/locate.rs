use std::collections::BTreeMap;
use std::ops::Range;

use crate::codec::{Decoded, decode_any};
use crate::replace::count_in_decoded;
use crate::store::PkValue;

/// Width of the preview window in bytes of raw text.
pub const PREVIEW_WIDTH: usize = 80;

/// A bounded excerpt of a cell's raw text around the first occurrence of the
/// search term, with every occurrence inside the window marked for
/// highlighting. Ranges are byte offsets into `snippet` and always sit on
/// UTF-8 boundaries.
#[derive(Debug, Clone, PartialEq)]
pub struct Preview {
    pub snippet: String,
    pub spans: Vec<Range<usize>>,
    pub truncated_start: bool,
    pub truncated_end: bool,
}

/// One matched cell. Coordinates plus everything the downstream stages need:
/// the raw value, the one-time format decision, the exact occurrence count, a
/// render-ready preview, and the row's sibling columns for filter evaluation.
#[derive(Debug, Clone)]
pub struct MatchRecord {
    pub table: String,
    pub pk: PkValue,
    pub pk_column: String,
    pub column: String,
    pub raw: String,
    pub decoded: Decoded,
    pub occurrences: usize,
    pub preview: Preview,
    pub row_columns: BTreeMap<String, String>,
}

/// Outcome of scanning a single cell: decoded form, occurrence count, and a
/// preview. `None` when the term does not occur. Read-only; never touches
/// the database.
#[derive(Debug, Clone)]
pub struct CellMatch {
    pub decoded: Decoded,
    pub occurrences: usize,
    pub preview: Preview,
}

pub fn scan_cell(raw: &str, term: &str) -> Option<CellMatch> {
    if term.is_empty() {
        return None;
    }
    let decoded = decode_any(raw);
    let occurrences = count_in_decoded(&decoded, term);
    if occurrences == 0 {
        return None;
    }
    Some(CellMatch {
        decoded,
        occurrences,
        preview: build_preview(raw, term, PREVIEW_WIDTH),
    })
}

/// Build a context window around the first occurrence of `term` in `raw`.
///
/// Roughly a third of the budget lands before the match; the window slides
/// when the match sits near either end of the text so the full budget is
/// used. Occurrences are located in the raw wire text, so a term that only
/// exists inside a decoded leaf (never the case for literal search) would
/// fall back to a head excerpt.
pub fn build_preview(raw: &str, term: &str, width: usize) -> Preview {
    let Some(first) = raw.find(term) else {
        let end = floor_char_boundary(raw, raw.len().min(width));
        return Preview {
            snippet: raw[..end].to_string(),
            spans: Vec::new(),
            truncated_start: false,
            truncated_end: end < raw.len(),
        };
    };

    if raw.len() <= width {
        return Preview {
            snippet: raw.to_string(),
            spans: term_spans(raw, term),
            truncated_start: false,
            truncated_end: false,
        };
    }

    let before = width / 3;
    let match_end = first + term.len();
    let mut start = first.saturating_sub(before);
    let mut end = (match_end + width.saturating_sub(before + term.len())).min(raw.len());
    if start == 0 {
        end = width.min(raw.len());
    } else if end == raw.len() {
        start = raw.len().saturating_sub(width);
    }
    let start = ceil_char_boundary(raw, start);
    let end = floor_char_boundary(raw, end.max(match_end));

    let snippet = raw[start..end].to_string();
    Preview {
        spans: term_spans(&snippet, term),
        snippet,
        truncated_start: start > 0,
        truncated_end: end < raw.len(),
    }
}

fn term_spans(text: &str, term: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    if term.is_empty() {
        return spans;
    }
    let mut from = 0;
    while let Some(pos) = text[from..].find(term) {
        let at = from + pos;
        spans.push(at..at + term.len());
        from = at + term.len();
    }
    spans
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    index = index.min(text.len());
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(text: &str, mut index: usize) -> usize {
    index = index.min(text.len());
    while index < text.len() && !text.is_char_boundary(index) {
        index += 1;
    }
    index
}
