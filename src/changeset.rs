use std::collections::BTreeMap;

use serde::Deserialize;

use crate::locate::MatchRecord;
use crate::replace::replace_in_decoded;
use crate::store::PkValue;

/// Row selection rule for one table. One rule per table; the variants are
/// mutually exclusive by construction, so "exclude these" and "only these"
/// can never both be configured for the same table.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RowRule {
    #[default]
    IncludeAll,
    Exclude(Vec<PkValue>),
    IncludeOnly(Vec<PkValue>),
    SkipTable,
}

impl RowRule {
    fn includes(&self, pk: &PkValue) -> bool {
        match self {
            RowRule::IncludeAll => true,
            RowRule::Exclude(ids) => !ids.contains(pk),
            RowRule::IncludeOnly(ids) => ids.contains(pk),
            RowRule::SkipTable => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    Exact,
    Contains,
}

/// Predicate on a named sibling column of the matched row: `exact` compares
/// byte-for-byte, `contains` is a substring test. A row whose named column
/// is absent never passes.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnFilter {
    pub column: String,
    pub kind: FilterKind,
    pub text: String,
}

impl ColumnFilter {
    pub fn matches(&self, columns: &BTreeMap<String, String>) -> bool {
        let Some(value) = columns.get(&self.column) else {
            return false;
        };
        match self.kind {
            FilterKind::Exact => value == &self.text,
            FilterKind::Contains => value.contains(&self.text),
        }
    }
}

/// A match promoted to "will be written": carries the eagerly computed new
/// raw value so dry run and commit share the exact same bytes, plus the
/// row-selection outcome.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub table: String,
    pub pk: PkValue,
    pub pk_column: String,
    pub column: String,
    pub original: String,
    pub new_raw: String,
    pub occurrences: usize,
    pub included: bool,
}

/// Build the ordered change set for a match list.
///
/// Filtering first (rows failing the column filter vanish), then row rules:
/// a skipped table's rows vanish entirely so downstream commit and backup
/// never see them, while exclude/include-only only clear the `included`
/// flag. Replacements that produce identical bytes are dropped as no-ops.
pub fn build(
    matches: &[MatchRecord],
    search: &str,
    replacement: &str,
    filter: Option<&ColumnFilter>,
    rules: &BTreeMap<String, RowRule>,
) -> Vec<ChangeRecord> {
    let mut changes = Vec::new();
    for record in matches {
        let rule = rules.get(&record.table).cloned().unwrap_or_default();
        if rule == RowRule::SkipTable {
            continue;
        }
        if let Some(filter) = filter {
            if !filter.matches(&record.row_columns) {
                continue;
            }
        }
        let outcome = replace_in_decoded(&record.decoded, search, replacement);
        if outcome.new_raw == record.raw {
            continue;
        }
        changes.push(ChangeRecord {
            table: record.table.clone(),
            pk: record.pk.clone(),
            pk_column: record.pk_column.clone(),
            column: record.column.clone(),
            original: record.raw.clone(),
            new_raw: outcome.new_raw,
            occurrences: outcome.occurrences,
            included: rule.includes(&record.pk),
        });
    }
    changes
}
