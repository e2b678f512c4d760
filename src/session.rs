use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::changeset::{self, ChangeRecord, ColumnFilter, RowRule};
use crate::error::EngineError;
use crate::ledger::{BackupHandle, Ledger, UndoReport};
use crate::locate::{MatchRecord, scan_cell};
use crate::store::{CellWrite, RowSource, WriteSink};

/// Workflow phase of an operation. Phases advance in declaration order;
/// configuration changes regress the phase and invalidate everything built
/// after the changed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Idle,
    TermSet,
    TablesSelected,
    Matched,
    Filtered,
    RowsConfigured,
    ReplacementSet,
    DryRun,
    Committing,
    Committed,
    Undoing,
}

/// Cooperative cancellation flag, checked at table boundaries. Cancelling
/// stops further work without rolling back tables already committed.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-table match counts reported after a scan.
#[derive(Debug, Clone)]
pub struct TableMatches {
    pub table: String,
    pub rows: usize,
    pub cells: usize,
    pub occurrences: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MatchSummary {
    pub tables: Vec<TableMatches>,
}

impl MatchSummary {
    pub fn total_cells(&self) -> usize {
        self.tables.iter().map(|table| table.cells).sum()
    }

    pub fn total_occurrences(&self) -> usize {
        self.tables.iter().map(|table| table.occurrences).sum()
    }
}

#[derive(Debug)]
pub enum TableStatus {
    Committed { rows: usize },
    Failed { rows: usize, error: EngineError },
    Cancelled,
}

#[derive(Debug)]
pub struct TableOutcome {
    pub table: String,
    pub status: TableStatus,
}

/// Result of one commit attempt. The operation is atomic per table, not
/// across tables: failed tables roll back and are reported while committed
/// tables stand.
#[derive(Debug, Default)]
pub struct CommitSummary {
    pub outcomes: Vec<TableOutcome>,
    pub backup: Option<PathBuf>,
    pub warnings: Vec<String>,
}

impl CommitSummary {
    pub fn rows_written(&self) -> usize {
        self.outcomes
            .iter()
            .map(|outcome| match outcome.status {
                TableStatus::Committed { rows } => rows,
                _ => 0,
            })
            .sum()
    }

    pub fn rows_failed(&self) -> usize {
        self.outcomes
            .iter()
            .map(|outcome| match outcome.status {
                TableStatus::Failed { rows, .. } => rows,
                _ => 0,
            })
            .sum()
    }

    pub fn tables_skipped(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| matches!(outcome.status, TableStatus::Cancelled))
            .count()
    }

    pub fn any_committed(&self) -> bool {
        self.outcomes
            .iter()
            .any(|outcome| matches!(outcome.status, TableStatus::Committed { .. }))
    }
}

/// One search-and-replace workflow. The session owns every piece of state
/// the workflow accumulates and enforces the ordering between steps; the
/// caller (CLI, tests) only sequences the calls.
pub struct Session {
    phase: Phase,
    term: String,
    replacement: Option<String>,
    tables: Vec<String>,
    filter: Option<ColumnFilter>,
    rules: BTreeMap<String, RowRule>,
    matches: Vec<MatchRecord>,
    changes: Vec<ChangeRecord>,
    dry_run_done: bool,
    backup: Option<BackupHandle>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            term: String::new(),
            replacement: None,
            tables: Vec::new(),
            filter: None,
            rules: BTreeMap::new(),
            matches: Vec::new(),
            changes: Vec::new(),
            dry_run_done: false,
            backup: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn matches(&self) -> &[MatchRecord] {
        &self.matches
    }

    pub fn changes(&self) -> &[ChangeRecord] {
        &self.changes
    }

    /// Set (or change) the search term. Allowed from any phase; everything
    /// downstream of the term is discarded, so no stale match or change
    /// record can survive a term change.
    pub fn set_term(&mut self, term: &str) -> Result<(), EngineError> {
        let term = term.trim();
        if term.is_empty() {
            return Err(EngineError::EmptyTerm);
        }
        self.term = term.to_string();
        self.matches.clear();
        self.changes.clear();
        self.dry_run_done = false;
        self.backup = None;
        self.phase = Phase::TermSet;
        Ok(())
    }

    pub fn select_tables(&mut self, tables: Vec<String>) -> Result<(), EngineError> {
        self.ensure_open("select tables")?;
        self.ensure_at_least(Phase::TermSet, "a search term must be set first")?;
        if tables.is_empty() {
            return Err(EngineError::NoTables);
        }
        self.tables = tables;
        self.matches.clear();
        self.invalidate_changes();
        self.phase = Phase::TablesSelected;
        Ok(())
    }

    /// Scan the selected tables for cells containing the term. Tables are
    /// visited in selection order and rows in source order, so the match
    /// list is deterministic. Checks the cancel token between tables.
    pub fn find_matches(
        &mut self,
        source: &dyn RowSource,
        cancel: &CancelToken,
    ) -> Result<MatchSummary, EngineError> {
        self.ensure_open("find matches")?;
        self.ensure_at_least(Phase::TablesSelected, "tables must be selected first")?;
        self.matches.clear();
        self.invalidate_changes();

        let mut summary = MatchSummary::default();
        for table in &self.tables {
            if cancel.is_cancelled() {
                break;
            }
            let Some(pk_column) = source.pk_column(table) else {
                return Err(EngineError::Source {
                    detail: format!("table '{table}' has no primary key column"),
                });
            };
            let rows = source
                .scan(table, None)
                .map_err(|err| EngineError::Source {
                    detail: format!("scanning {table}: {err}"),
                })?;
            let mut cells = 0;
            let mut occurrences = 0;
            let mut matched_rows = HashSet::new();
            for row in rows {
                for (column, raw) in &row.columns {
                    let Some(cell) = scan_cell(raw, &self.term) else {
                        continue;
                    };
                    cells += 1;
                    occurrences += cell.occurrences;
                    matched_rows.insert(row.pk.clone());
                    self.matches.push(MatchRecord {
                        table: table.clone(),
                        pk: row.pk.clone(),
                        pk_column: pk_column.clone(),
                        column: column.clone(),
                        raw: raw.clone(),
                        decoded: cell.decoded,
                        occurrences: cell.occurrences,
                        preview: cell.preview,
                        row_columns: row.columns.clone(),
                    });
                }
            }
            summary.tables.push(TableMatches {
                table: table.clone(),
                rows: matched_rows.len(),
                cells,
                occurrences,
            });
        }
        self.phase = Phase::Matched;
        Ok(summary)
    }

    pub fn set_filter(&mut self, filter: Option<ColumnFilter>) -> Result<(), EngineError> {
        self.ensure_open("set filter")?;
        self.ensure_at_least(Phase::Matched, "matches must be found first")?;
        self.filter = filter;
        self.invalidate_changes();
        self.phase = Phase::Filtered;
        Ok(())
    }

    pub fn set_row_rules(&mut self, rules: BTreeMap<String, RowRule>) -> Result<(), EngineError> {
        self.ensure_open("configure rows")?;
        self.ensure_at_least(Phase::Matched, "matches must be found first")?;
        self.rules = rules;
        self.invalidate_changes();
        self.phase = Phase::RowsConfigured;
        Ok(())
    }

    pub fn set_replacement(&mut self, text: &str) -> Result<(), EngineError> {
        self.ensure_open("set replacement")?;
        self.ensure_at_least(Phase::Matched, "matches must be found first")?;
        self.replacement = Some(text.to_string());
        self.invalidate_changes();
        self.phase = Phase::ReplacementSet;
        Ok(())
    }

    /// Build the change set and preview it without touching the database.
    /// Mandatory before `commit`; any configuration change since the last
    /// dry run forces a rebuild.
    pub fn dry_run(&mut self) -> Result<&[ChangeRecord], EngineError> {
        self.ensure_open("dry run")?;
        self.ensure_at_least(Phase::Matched, "matches must be found first")?;
        let Some(replacement) = self.replacement.clone() else {
            return Err(EngineError::StaleState(
                "replacement text must be set before a dry run".to_string(),
            ));
        };
        self.changes = changeset::build(
            &self.matches,
            &self.term,
            &replacement,
            self.filter.as_ref(),
            &self.rules,
        );
        self.dry_run_done = true;
        self.phase = Phase::DryRun;
        Ok(&self.changes)
    }

    /// Write the included changes, one transaction per table. The full
    /// pre-image backup is durably recorded before the first write; after
    /// the loop the backup is finalized to the tables that committed. A
    /// commit where no table committed reverts to `ReplacementSet` and
    /// discards its backup.
    pub fn commit(
        &mut self,
        ledger: &Ledger,
        sink: &mut dyn WriteSink,
        cancel: &CancelToken,
    ) -> Result<CommitSummary, EngineError> {
        match self.phase {
            Phase::DryRun if self.dry_run_done => {}
            Phase::Committing | Phase::Committed | Phase::Undoing => {
                return Err(EngineError::StaleState(
                    "operation was already committed".to_string(),
                ));
            }
            _ => return Err(EngineError::DryRunRequired),
        }

        let included: Vec<&ChangeRecord> =
            self.changes.iter().filter(|change| change.included).collect();
        if included.is_empty() {
            return Err(EngineError::EmptyChangeSet);
        }

        let replacement = self.replacement.clone().unwrap_or_default();
        let handle = ledger
            .record(&self.term, &replacement, &included)
            .map_err(|err| EngineError::Persistence {
                detail: err.to_string(),
            })?;

        self.phase = Phase::Committing;
        let mut summary = CommitSummary::default();
        let mut committed_tables = Vec::new();

        for (table, changes) in group_by_table(&included) {
            if cancel.is_cancelled() {
                summary.outcomes.push(TableOutcome {
                    table,
                    status: TableStatus::Cancelled,
                });
                continue;
            }
            let writes: Vec<CellWrite> = changes
                .iter()
                .map(|change| CellWrite {
                    pk: change.pk.clone(),
                    column: change.column.clone(),
                    value: change.new_raw.clone(),
                })
                .collect();
            match sink.apply(&table, &writes) {
                Ok(()) => {
                    committed_tables.push(table.clone());
                    summary.outcomes.push(TableOutcome {
                        table,
                        status: TableStatus::Committed { rows: writes.len() },
                    });
                }
                Err(failure) => {
                    let error = EngineError::Write {
                        table: table.clone(),
                        row: failure.row,
                        reason: failure.reason,
                    };
                    summary.outcomes.push(TableOutcome {
                        table,
                        status: TableStatus::Failed {
                            rows: writes.len(),
                            error,
                        },
                    });
                }
            }
        }

        if committed_tables.is_empty() {
            if let Err(err) = ledger.discard(&handle) {
                summary.warnings.push(format!("discarding backup: {err}"));
            }
            self.invalidate_changes();
            self.phase = Phase::ReplacementSet;
            return Ok(summary);
        }

        if let Err(err) = ledger.finalize(&handle, &committed_tables) {
            summary.warnings.push(format!("finalizing backup: {err}"));
        }
        summary.backup = Some(handle.path.clone());
        self.backup = Some(handle);
        self.phase = Phase::Committed;
        Ok(summary)
    }

    /// Replay the backup of the commit this session just performed.
    pub fn undo_last<S>(&mut self, ledger: &Ledger, store: &mut S) -> Result<UndoReport, EngineError>
    where
        S: RowSource + WriteSink,
    {
        if self.phase != Phase::Committed {
            return Err(EngineError::StaleState(
                "only a committed operation can be undone".to_string(),
            ));
        }
        let Some(handle) = self.backup.clone() else {
            return Err(EngineError::StaleState(
                "no backup recorded for this session".to_string(),
            ));
        };
        self.phase = Phase::Undoing;
        ledger
            .undo(&handle.path, store)
            .map_err(|err| EngineError::Persistence {
                detail: err.to_string(),
            })
    }

    fn invalidate_changes(&mut self) {
        self.changes.clear();
        self.dry_run_done = false;
    }

    fn ensure_open(&self, action: &str) -> Result<(), EngineError> {
        if self.phase >= Phase::Committing {
            return Err(EngineError::StaleState(format!(
                "cannot {action} after commit; set a new search term to start over"
            )));
        }
        Ok(())
    }

    fn ensure_at_least(&self, phase: Phase, message: &str) -> Result<(), EngineError> {
        if self.phase < phase {
            return Err(EngineError::StaleState(message.to_string()));
        }
        Ok(())
    }
}

fn group_by_table<'a>(changes: &[&'a ChangeRecord]) -> Vec<(String, Vec<&'a ChangeRecord>)> {
    let mut grouped: Vec<(String, Vec<&ChangeRecord>)> = Vec::new();
    for &change in changes {
        match grouped.iter_mut().find(|(table, _)| *table == change.table) {
            Some((_, list)) => list.push(change),
            None => grouped.push((change.table.clone(), vec![change])),
        }
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CellWrite, DumpStore, PkValue, WriteFailure, sample_dump};
    use tempfile::tempdir;

    fn configured_session(store: &DumpStore) -> Session {
        let mut session = Session::new();
        session.set_term("example.com").expect("term");
        session
            .select_tables(vec!["wp_options".to_string(), "wp_posts".to_string()])
            .expect("tables");
        session
            .find_matches(store, &CancelToken::new())
            .expect("matches");
        session.set_replacement("sample.org").expect("replacement");
        session
    }

    #[test]
    fn phases_advance_through_the_workflow() {
        let store = DumpStore::in_memory(sample_dump());
        let mut session = Session::new();
        assert_eq!(session.phase(), Phase::Idle);
        session.set_term("example.com").expect("term");
        assert_eq!(session.phase(), Phase::TermSet);
        session
            .select_tables(vec!["wp_options".to_string()])
            .expect("tables");
        assert_eq!(session.phase(), Phase::TablesSelected);
        session
            .find_matches(&store, &CancelToken::new())
            .expect("matches");
        assert_eq!(session.phase(), Phase::Matched);
        session.set_filter(None).expect("filter");
        assert_eq!(session.phase(), Phase::Filtered);
        session.set_row_rules(BTreeMap::new()).expect("rules");
        assert_eq!(session.phase(), Phase::RowsConfigured);
        session.set_replacement("sample.org").expect("replacement");
        assert_eq!(session.phase(), Phase::ReplacementSet);
        session.dry_run().expect("dry run");
        assert_eq!(session.phase(), Phase::DryRun);
    }

    #[test]
    fn matching_is_deterministic_and_counts_rows() {
        let store = DumpStore::in_memory(sample_dump());
        let mut session = Session::new();
        session.set_term("example.com").expect("term");
        session
            .select_tables(vec!["wp_options".to_string(), "wp_posts".to_string()])
            .expect("tables");
        let summary = session
            .find_matches(&store, &CancelToken::new())
            .expect("matches");

        assert_eq!(summary.tables.len(), 2);
        assert_eq!(summary.tables[0].table, "wp_options");
        assert_eq!(summary.tables[0].cells, 2);
        assert_eq!(summary.tables[1].table, "wp_posts");
        assert_eq!(summary.tables[1].cells, 2);
        assert_eq!(summary.total_cells(), 4);
        // Same scan again yields the same ordered match list.
        let tables: Vec<_> = session
            .matches()
            .iter()
            .map(|record| (record.table.clone(), record.pk.clone(), record.column.clone()))
            .collect();
        session
            .find_matches(&store, &CancelToken::new())
            .expect("rescan");
        let again: Vec<_> = session
            .matches()
            .iter()
            .map(|record| (record.table.clone(), record.pk.clone(), record.column.clone()))
            .collect();
        assert_eq!(tables, again);
    }

    #[test]
    fn commit_requires_a_dry_run() {
        let store = DumpStore::in_memory(sample_dump());
        let dir = tempdir().expect("temp dir");
        let ledger = Ledger::new(dir.path());
        let mut session = configured_session(&store);
        let mut sink = DumpStore::in_memory(sample_dump());

        let err = session
            .commit(&ledger, &mut sink, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::DryRunRequired));
    }

    #[test]
    fn commit_writes_all_tables_and_records_backups() {
        let dir = tempdir().expect("temp dir");
        let ledger = Ledger::new(dir.path());
        let mut store = DumpStore::in_memory(sample_dump());
        let mut session = configured_session(&store);

        let changes = session.dry_run().expect("dry run").to_vec();
        assert_eq!(changes.len(), 4);
        // Dry run computed the exact bytes commit will write.
        let expected: Vec<_> = changes.iter().map(|c| c.new_raw.clone()).collect();

        let summary = session
            .commit(&ledger, &mut store, &CancelToken::new())
            .expect("commit");
        assert_eq!(summary.rows_written(), 4);
        assert_eq!(summary.rows_failed(), 0);
        assert_eq!(session.phase(), Phase::Committed);

        assert_eq!(
            store.fetch_cell("wp_options", &PkValue::Int(1), "option_value"),
            Some(expected[0].clone())
        );
        assert_eq!(
            store.fetch_cell("wp_options", &PkValue::Int(2), "option_value"),
            Some("a:1:{s:4:\"home\";s:18:\"https://sample.org\";}".to_string())
        );

        let backup = summary.backup.expect("backup path");
        let file = ledger.load(&backup).expect("backup parses");
        assert_eq!(file.entries.len(), 4);
        assert_eq!(file.search, "example.com");
        assert!(file.entries.iter().all(|entry| entry.original.contains("example.com")));
    }

    #[test]
    fn skipped_tables_reach_neither_commit_nor_backup() {
        let dir = tempdir().expect("temp dir");
        let ledger = Ledger::new(dir.path());
        let mut store = DumpStore::in_memory(sample_dump());
        let mut session = configured_session(&store);
        session
            .set_row_rules(BTreeMap::from([(
                "wp_posts".to_string(),
                RowRule::SkipTable,
            )]))
            .expect("rules");

        let changes = session.dry_run().expect("dry run");
        assert!(changes.iter().all(|change| change.table != "wp_posts"));

        let summary = session
            .commit(&ledger, &mut store, &CancelToken::new())
            .expect("commit");
        assert!(summary.outcomes.iter().all(|o| o.table != "wp_posts"));

        let file = ledger.load(&summary.backup.expect("backup")).expect("load");
        assert!(file.entries.iter().all(|entry| entry.table != "wp_posts"));
        // The skipped table's cells are untouched.
        assert_eq!(
            store.fetch_cell("wp_posts", &PkValue::Int(10), "post_content"),
            Some("Visit https://example.com today".to_string())
        );
    }

    #[test]
    fn excluded_rows_stay_visible_but_unwritten() {
        let dir = tempdir().expect("temp dir");
        let ledger = Ledger::new(dir.path());
        let mut store = DumpStore::in_memory(sample_dump());
        let mut session = configured_session(&store);
        session
            .set_row_rules(BTreeMap::from([(
                "wp_posts".to_string(),
                RowRule::Exclude(vec![PkValue::Int(11)]),
            )]))
            .expect("rules");

        let changes = session.dry_run().expect("dry run");
        let excluded: Vec<_> = changes.iter().filter(|c| !c.included).collect();
        assert_eq!(excluded.len(), 1);
        assert_eq!(excluded[0].pk, PkValue::Int(11));

        session
            .commit(&ledger, &mut store, &CancelToken::new())
            .expect("commit");
        assert_eq!(
            store.fetch_cell("wp_posts", &PkValue::Int(11), "post_title"),
            Some("About example.com".to_string())
        );
    }

    #[test]
    fn new_term_discards_matches_and_changes() {
        let store = DumpStore::in_memory(sample_dump());
        let mut session = configured_session(&store);
        session.dry_run().expect("dry run");
        assert!(!session.changes().is_empty());

        session.set_term("different").expect("term");
        assert_eq!(session.phase(), Phase::TermSet);
        assert!(session.matches().is_empty());
        assert!(session.changes().is_empty());
    }

    #[test]
    fn config_changes_invalidate_the_dry_run() {
        let dir = tempdir().expect("temp dir");
        let ledger = Ledger::new(dir.path());
        let mut store = DumpStore::in_memory(sample_dump());
        let mut session = configured_session(&store);
        session.dry_run().expect("dry run");

        session.set_replacement("elsewhere.net").expect("replacement");
        let err = session
            .commit(&ledger, &mut store, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::DryRunRequired));

        session.dry_run().expect("dry run again");
        let summary = session
            .commit(&ledger, &mut store, &CancelToken::new())
            .expect("commit");
        assert!(summary.any_committed());
    }

    #[test]
    fn commit_with_nothing_included_is_rejected() {
        let dir = tempdir().expect("temp dir");
        let ledger = Ledger::new(dir.path());
        let mut store = DumpStore::in_memory(sample_dump());
        let mut session = configured_session(&store);
        session
            .set_row_rules(BTreeMap::from([
                ("wp_options".to_string(), RowRule::SkipTable),
                ("wp_posts".to_string(), RowRule::SkipTable),
            ]))
            .expect("rules");
        session.dry_run().expect("dry run");

        let err = session
            .commit(&ledger, &mut store, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::EmptyChangeSet));
    }

    /// Write sink that fails every batch for one table, delegating the rest.
    struct FailingSink {
        inner: DumpStore,
        failing_table: String,
    }

    impl WriteSink for FailingSink {
        fn apply(&mut self, table: &str, writes: &[CellWrite]) -> Result<(), WriteFailure> {
            if table == self.failing_table {
                return Err(WriteFailure {
                    row: writes[0].pk.to_string(),
                    reason: "constraint violation".to_string(),
                });
            }
            self.inner.apply(table, writes)
        }
    }

    #[test]
    fn failed_table_rolls_back_while_others_commit() {
        let dir = tempdir().expect("temp dir");
        let ledger = Ledger::new(dir.path());
        let store = DumpStore::in_memory(sample_dump());
        let mut session = configured_session(&store);
        session.dry_run().expect("dry run");

        let mut sink = FailingSink {
            inner: DumpStore::in_memory(sample_dump()),
            failing_table: "wp_posts".to_string(),
        };
        let summary = session
            .commit(&ledger, &mut sink, &CancelToken::new())
            .expect("commit");

        assert_eq!(summary.rows_written(), 2);
        assert_eq!(summary.rows_failed(), 2);
        assert_eq!(session.phase(), Phase::Committed);

        // The ledger keeps only the committed table, so undo stays precise.
        let file = ledger.load(&summary.backup.expect("backup")).expect("load");
        assert!(file.entries.iter().all(|entry| entry.table == "wp_options"));
        // The failing table's rows are untouched in the sink.
        assert_eq!(
            sink.inner
                .fetch_cell("wp_posts", &PkValue::Int(10), "post_content"),
            Some("Visit https://example.com today".to_string())
        );
    }

    #[test]
    fn total_failure_reverts_to_replacement_set_and_discards_backup() {
        let dir = tempdir().expect("temp dir");
        let ledger = Ledger::new(dir.path());
        let store = DumpStore::in_memory(sample_dump());
        let mut session = configured_session(&store);
        session.dry_run().expect("dry run");

        let cancel = CancelToken::new();
        cancel.cancel();
        let mut sink = DumpStore::in_memory(sample_dump());
        let summary = session.commit(&ledger, &mut sink, &cancel).expect("commit");

        assert_eq!(summary.rows_written(), 0);
        assert_eq!(summary.tables_skipped(), 2);
        assert_eq!(session.phase(), Phase::ReplacementSet);
        assert!(ledger.list().expect("list").is_empty());
    }

    #[test]
    fn undo_restores_the_pre_image_byte_for_byte() {
        let dir = tempdir().expect("temp dir");
        let ledger = Ledger::new(dir.path());
        let mut store = DumpStore::in_memory(sample_dump());
        let before: Vec<(PkValue, String)> = store
            .scan("wp_options", None)
            .expect("scan")
            .into_iter()
            .map(|row| (row.pk.clone(), row.columns["option_value"].clone()))
            .collect();

        let mut session = configured_session(&store);
        session.dry_run().expect("dry run");
        session
            .commit(&ledger, &mut store, &CancelToken::new())
            .expect("commit");

        let report = session.undo_last(&ledger, &mut store).expect("undo");
        assert_eq!(session.phase(), Phase::Undoing);
        assert!(report.conflicts.is_empty());
        for (pk, original) in before {
            assert_eq!(
                store.fetch_cell("wp_options", &pk, "option_value"),
                Some(original)
            );
        }
    }

    #[test]
    fn operations_after_commit_are_rejected_until_new_term() {
        let dir = tempdir().expect("temp dir");
        let ledger = Ledger::new(dir.path());
        let mut store = DumpStore::in_memory(sample_dump());
        let mut session = configured_session(&store);
        session.dry_run().expect("dry run");
        session
            .commit(&ledger, &mut store, &CancelToken::new())
            .expect("commit");

        assert!(matches!(
            session.set_replacement("again"),
            Err(EngineError::StaleState(_))
        ));
        assert!(matches!(
            session.dry_run(),
            Err(EngineError::StaleState(_))
        ));
        // A fresh term reopens the workflow.
        session.set_term("sample.org").expect("term");
        assert_eq!(session.phase(), Phase::TermSet);
    }

    #[test]
    fn sibling_filter_narrows_the_change_set() {
        let store = DumpStore::in_memory(sample_dump());
        let mut session = configured_session(&store);
        session
            .set_filter(Some(ColumnFilter {
                column: "option_name".to_string(),
                kind: crate::changeset::FilterKind::Exact,
                text: "siteurl".to_string(),
            }))
            .expect("filter");
        session.set_replacement("sample.org").expect("replacement");
        let changes = session.dry_run().expect("dry run");
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].table, "wp_options");
        assert_eq!(changes[0].pk, PkValue::Int(1));
    }

    #[test]
    fn empty_term_is_rejected() {
        let mut session = Session::new();
        assert!(matches!(session.set_term("  "), Err(EngineError::EmptyTerm)));
        assert!(matches!(
            session.select_tables(vec!["t".to_string()]),
            Err(EngineError::StaleState(_))
        ));
    }
}
