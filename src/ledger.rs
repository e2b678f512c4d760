use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::changeset::ChangeRecord;
use crate::store::{CellWrite, PkValue, RowSource, WriteSink, write_via_temp};

const BACKUP_PREFIX: &str = "replace_backup_";
const CONSUMED_SUFFIX: &str = ".used";

/// Immutable pre-image of one changed cell. Written before the change,
/// never mutated afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupEntry {
    pub table: String,
    pub pk_column: String,
    pub pk: PkValue,
    pub column: String,
    pub original: String,
    pub new_value: String,
    pub timestamp: String,
}

/// One operation's backup file: the terms it ran with plus the ordered
/// pre-image entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupFile {
    pub operation: String,
    pub created: String,
    pub search: String,
    pub replacement: String,
    pub entries: Vec<BackupEntry>,
}

#[derive(Debug, Clone)]
pub struct BackupHandle {
    pub path: PathBuf,
}

/// Listing row for one recorded operation.
#[derive(Debug)]
pub struct BackupSummary {
    pub path: PathBuf,
    pub operation: String,
    pub created: String,
    pub search: String,
    pub replacement: String,
    pub entries: usize,
    pub consumed: bool,
}

/// A conflict found while verifying an undo target; the entry is skipped
/// and reported, the rest of the undo proceeds.
#[derive(Debug)]
pub struct UndoConflict {
    pub table: String,
    pub row: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct UndoReport {
    pub restored: usize,
    pub conflicts: Vec<UndoConflict>,
    pub failed_tables: Vec<(String, String)>,
}

/// Durable, append-only record of pre-image values, one JSON file per
/// operation under the backup directory.
pub struct Ledger {
    dir: PathBuf,
}

impl Ledger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist the full pre-image of a change set before any write is
    /// issued. The file is complete on disk (temp-then-rename) when this
    /// returns; a partially written file never becomes visible under the
    /// backup name.
    pub fn record(
        &self,
        search: &str,
        replacement: &str,
        changes: &[&ChangeRecord],
    ) -> Result<BackupHandle> {
        let now = OffsetDateTime::now_utc();
        let timestamp = now
            .format(&Rfc3339)
            .unwrap_or_else(|_| "unknown".to_string());
        let entries = changes
            .iter()
            .map(|change| BackupEntry {
                table: change.table.clone(),
                pk_column: change.pk_column.clone(),
                pk: change.pk.clone(),
                column: change.column.clone(),
                original: change.original.clone(),
                new_value: change.new_raw.clone(),
                timestamp: timestamp.clone(),
            })
            .collect();

        let (operation, path) = self.claim_operation_name(now)?;
        let file = BackupFile {
            operation,
            created: timestamp,
            search: search.to_string(),
            replacement: replacement.to_string(),
            entries,
        };
        let data = serde_json::to_vec_pretty(&file)?;
        write_via_temp(&path, &data)
            .with_context(|| format!("writing backup {}", path.display()))?;
        Ok(BackupHandle { path })
    }

    /// Rewrite a recorded backup to the entries of tables that actually
    /// committed; a backup whose every table rolled back is deleted. Called
    /// after the commit loop so undo stays precise under partial failure.
    pub fn finalize(&self, handle: &BackupHandle, committed_tables: &[String]) -> Result<()> {
        let mut file = self.load(&handle.path)?;
        file.entries
            .retain(|entry| committed_tables.contains(&entry.table));
        if file.entries.is_empty() {
            return self.discard(handle);
        }
        let data = serde_json::to_vec_pretty(&file)?;
        write_via_temp(&handle.path, &data)
            .with_context(|| format!("finalizing backup {}", handle.path.display()))
    }

    /// Drop the backup for an attempt that wrote nothing.
    pub fn discard(&self, handle: &BackupHandle) -> Result<()> {
        fs::remove_file(&handle.path)
            .with_context(|| format!("removing backup {}", handle.path.display()))
    }

    pub fn load(&self, path: &Path) -> Result<BackupFile> {
        let data =
            fs::read(path).with_context(|| format!("reading backup {}", path.display()))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("parsing backup {}", path.display()))
    }

    /// All recorded operations, oldest first. Consumed backups are included
    /// and flagged; unreadable files are skipped.
    pub fn list(&self) -> Result<Vec<BackupSummary>> {
        let mut summaries = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(summaries),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("listing backups in {}", self.dir.display()));
            }
        };
        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| is_backup_file(path))
            .collect();
        paths.sort();
        for path in paths {
            let Ok(file) = self.load(&path) else {
                continue;
            };
            summaries.push(BackupSummary {
                consumed: is_consumed(&path),
                operation: file.operation,
                created: file.created,
                search: file.search,
                replacement: file.replacement,
                entries: file.entries.len(),
                path,
            });
        }
        Ok(summaries)
    }

    /// The most recent backup that has not been replayed yet.
    pub fn latest_unconsumed(&self) -> Result<Option<PathBuf>> {
        let summaries = self.list()?;
        Ok(summaries
            .into_iter()
            .rev()
            .find(|summary| !summary.consumed)
            .map(|summary| summary.path))
    }

    /// Replay a recorded backup: verify every target still exists, skip and
    /// report conflicts, restore the surviving entries per table in a single
    /// write transaction, then mark the file consumed. The file itself is
    /// kept for audit.
    pub fn undo<S>(&self, path: &Path, store: &mut S) -> Result<UndoReport>
    where
        S: RowSource + WriteSink,
    {
        if is_consumed(path) {
            bail!("backup {} was already replayed", path.display());
        }
        let file = self.load(path)?;
        if file.entries.is_empty() {
            bail!("backup {} holds no entries", path.display());
        }

        let mut report = UndoReport::default();
        let mut tables: Vec<(String, Vec<CellWrite>)> = Vec::new();
        for entry in &file.entries {
            match verify_target(store, entry) {
                Some(reason) => report.conflicts.push(UndoConflict {
                    table: entry.table.clone(),
                    row: entry.pk.to_string(),
                    reason,
                }),
                None => {
                    let write = CellWrite {
                        pk: entry.pk.clone(),
                        column: entry.column.clone(),
                        value: entry.original.clone(),
                    };
                    match tables.iter_mut().find(|(name, _)| *name == entry.table) {
                        Some((_, writes)) => writes.push(write),
                        None => tables.push((entry.table.clone(), vec![write])),
                    }
                }
            }
        }

        for (table, writes) in &tables {
            match store.apply(table, writes) {
                Ok(()) => report.restored += writes.len(),
                Err(failure) => report.failed_tables.push((
                    table.clone(),
                    format!("row {}: {}", failure.row, failure.reason),
                )),
            }
        }

        if report.restored > 0 {
            mark_consumed(path)?;
        }
        Ok(report)
    }

    /// Delete replayed backup files. Returns the paths removed.
    pub fn cleanup_consumed(&self, apply: bool) -> Result<Vec<PathBuf>> {
        let consumed: Vec<PathBuf> = self
            .list()?
            .into_iter()
            .filter(|summary| summary.consumed)
            .map(|summary| summary.path)
            .collect();
        if apply {
            for path in &consumed {
                fs::remove_file(path)
                    .with_context(|| format!("removing {}", path.display()))?;
            }
        }
        Ok(consumed)
    }

    fn claim_operation_name(&self, now: OffsetDateTime) -> Result<(String, PathBuf)> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating backup dir {}", self.dir.display()))?;
        let stamp = compact_stamp(now);
        let mut attempt = 0usize;
        loop {
            let operation = if attempt == 0 {
                stamp.clone()
            } else {
                format!("{stamp}_{attempt}")
            };
            let path = self.dir.join(format!("{BACKUP_PREFIX}{operation}.json"));
            if !path.exists() {
                return Ok((operation, path));
            }
            attempt += 1;
        }
    }
}

fn verify_target<S: RowSource>(store: &S, entry: &BackupEntry) -> Option<String> {
    let Some(pk_column) = store.pk_column(&entry.table) else {
        return Some("table no longer exists".to_string());
    };
    if pk_column != entry.pk_column {
        return Some(format!(
            "primary key column changed from '{}' to '{pk_column}'",
            entry.pk_column
        ));
    }
    if store
        .fetch_cell(&entry.table, &entry.pk, &entry.column)
        .is_none()
    {
        return Some("row or column no longer exists".to_string());
    }
    None
}

fn mark_consumed(path: &Path) -> Result<()> {
    let mut consumed = path.as_os_str().to_os_string();
    consumed.push(CONSUMED_SUFFIX);
    fs::rename(path, &consumed)
        .with_context(|| format!("marking {} as replayed", path.display()))
}

fn is_backup_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    name.starts_with(BACKUP_PREFIX)
        && (name.ends_with(".json") || name.ends_with(CONSUMED_SUFFIX))
}

fn is_consumed(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(CONSUMED_SUFFIX))
}

fn compact_stamp(now: OffsetDateTime) -> String {
    format!(
        "{:04}{:02}{:02}_{:02}{:02}{:02}",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}
