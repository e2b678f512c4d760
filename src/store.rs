use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::changeset::ColumnFilter;

/// Primary key of a scanned row. WordPress keys are almost always integers;
/// option/meta tables occasionally key on text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PkValue {
    Int(i64),
    Text(String),
}

impl fmt::Display for PkValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PkValue::Int(number) => write!(f, "{number}"),
            PkValue::Text(text) => f.write_str(text),
        }
    }
}

impl From<i64> for PkValue {
    fn from(number: i64) -> Self {
        PkValue::Int(number)
    }
}

impl From<&str> for PkValue {
    fn from(text: &str) -> Self {
        PkValue::Text(text.to_string())
    }
}

/// One scanned row: its primary key and every text-like column's raw value.
#[derive(Debug, Clone)]
pub struct SourceRow {
    pub pk: PkValue,
    pub columns: BTreeMap<String, String>,
}

/// One pending cell write inside a table batch.
#[derive(Debug, Clone)]
pub struct CellWrite {
    pub pk: PkValue,
    pub column: String,
    pub value: String,
}

/// First failure inside a write batch. The batch is a transaction; nothing
/// from a failed batch is retained.
#[derive(Debug, Clone)]
pub struct WriteFailure {
    pub row: String,
    pub reason: String,
}

/// Read side of the engine's database seam.
pub trait RowSource {
    fn tables(&self) -> Vec<String>;

    fn pk_column(&self, table: &str) -> Option<String>;

    /// Yield the table's rows in stable order. Implementations may use the
    /// filter to pre-narrow the scan; the change set builder re-evaluates it
    /// either way.
    fn scan(&self, table: &str, filter: Option<&ColumnFilter>) -> Result<Vec<SourceRow>>;

    /// Point read of one cell, used by undo verification.
    fn fetch_cell(&self, table: &str, pk: &PkValue, column: &str) -> Option<String>;
}

/// Write side of the engine's database seam.
pub trait WriteSink {
    /// Execute an ordered batch of cell writes for one table as a single
    /// transaction, reporting success or the first failure.
    fn apply(&mut self, table: &str, writes: &[CellWrite]) -> Result<(), WriteFailure>;
}

/// On-disk shape of a table dump.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dump {
    pub tables: BTreeMap<String, DumpTable>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpTable {
    pub pk_column: String,
    pub rows: Vec<DumpRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpRow {
    pub pk: PkValue,
    pub columns: BTreeMap<String, String>,
}

/// A JSON table dump acting as both row source and write sink.
///
/// `apply` stages a batch on a copy of the table, validates every write, and
/// only then swaps the copy in and persists, so a failed batch leaves both
/// the in-memory dump and the file untouched.
pub struct DumpStore {
    dump: Dump,
    path: Option<PathBuf>,
}

impl DumpStore {
    pub fn load(path: &Path) -> Result<Self> {
        let data =
            fs::read(path).with_context(|| format!("reading dump {}", path.display()))?;
        let dump = serde_json::from_slice(&data)
            .with_context(|| format!("parsing dump {}", path.display()))?;
        Ok(Self {
            dump,
            path: Some(path.to_path_buf()),
        })
    }

    /// Store without a backing file; writes mutate memory only.
    pub fn in_memory(dump: Dump) -> Self {
        Self { dump, path: None }
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let data = serde_json::to_vec_pretty(&self.dump)?;
        write_via_temp(path, &data)
    }
}

impl RowSource for DumpStore {
    fn tables(&self) -> Vec<String> {
        self.dump.tables.keys().cloned().collect()
    }

    fn pk_column(&self, table: &str) -> Option<String> {
        self.dump
            .tables
            .get(table)
            .map(|entry| entry.pk_column.clone())
    }

    fn scan(&self, table: &str, filter: Option<&ColumnFilter>) -> Result<Vec<SourceRow>> {
        let Some(entry) = self.dump.tables.get(table) else {
            anyhow::bail!("no such table '{table}' in dump");
        };
        let rows = entry
            .rows
            .iter()
            .filter(|row| filter.is_none_or(|f| f.matches(&row.columns)))
            .map(|row| SourceRow {
                pk: row.pk.clone(),
                columns: row.columns.clone(),
            })
            .collect();
        Ok(rows)
    }

    fn fetch_cell(&self, table: &str, pk: &PkValue, column: &str) -> Option<String> {
        self.dump
            .tables
            .get(table)?
            .rows
            .iter()
            .find(|row| row.pk == *pk)?
            .columns
            .get(column)
            .cloned()
    }
}

impl WriteSink for DumpStore {
    fn apply(&mut self, table: &str, writes: &[CellWrite]) -> Result<(), WriteFailure> {
        let Some(entry) = self.dump.tables.get(table) else {
            return Err(WriteFailure {
                row: "-".to_string(),
                reason: format!("no such table '{table}'"),
            });
        };

        let mut staged = entry.clone();
        for write in writes {
            let Some(row) = staged.rows.iter_mut().find(|row| row.pk == write.pk) else {
                return Err(WriteFailure {
                    row: write.pk.to_string(),
                    reason: "row not found".to_string(),
                });
            };
            let Some(cell) = row.columns.get_mut(&write.column) else {
                return Err(WriteFailure {
                    row: write.pk.to_string(),
                    reason: format!("no such column '{}'", write.column),
                });
            };
            *cell = write.value.clone();
        }

        let previous = self
            .dump
            .tables
            .insert(table.to_string(), staged)
            .expect("table existed above");
        if let Err(err) = self.persist() {
            self.dump.tables.insert(table.to_string(), previous);
            return Err(WriteFailure {
                row: "-".to_string(),
                reason: format!("persisting dump: {err}"),
            });
        }
        Ok(())
    }
}

/// Durable write: full content to a temp file in the target directory, fsync,
/// then rename over the destination.
pub fn write_via_temp(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(dir) = parent {
        fs::create_dir_all(dir).with_context(|| format!("creating directory {}", dir.display()))?;
    }
    let base_dir = parent.unwrap_or_else(|| Path::new("."));
    let unique = format!(
        ".dbshift-tmp-{}-{}",
        std::process::id(),
        OffsetDateTime::now_utc().unix_timestamp_nanos()
    );
    let temp_path = base_dir.join(unique);
    {
        let mut file = fs::File::create(&temp_path)
            .with_context(|| format!("creating temp file {}", temp_path.display()))?;
        file.write_all(data)
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    }
    fs::rename(&temp_path, path).or_else(|err| {
        let _ = fs::remove_file(&temp_path);
        Err(err).with_context(|| format!("replacing {}", path.display()))
    })?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn sample_dump() -> Dump {
    let mut tables = BTreeMap::new();
    tables.insert(
        "wp_options".to_string(),
        DumpTable {
            pk_column: "option_id".to_string(),
            rows: vec![
                DumpRow {
                    pk: PkValue::Int(1),
                    columns: BTreeMap::from([
                        ("option_name".to_string(), "siteurl".to_string()),
                        (
                            "option_value".to_string(),
                            "https://example.com".to_string(),
                        ),
                    ]),
                },
                DumpRow {
                    pk: PkValue::Int(2),
                    columns: BTreeMap::from([
                        ("option_name".to_string(), "widgets".to_string()),
                        (
                            "option_value".to_string(),
                            "a:1:{s:4:\"home\";s:19:\"https://example.com\";}".to_string(),
                        ),
                    ]),
                },
            ],
        },
    );
    tables.insert(
        "wp_posts".to_string(),
        DumpTable {
            pk_column: "ID".to_string(),
            rows: vec![
                DumpRow {
                    pk: PkValue::Int(10),
                    columns: BTreeMap::from([
                        ("post_title".to_string(), "Hello".to_string()),
                        (
                            "post_content".to_string(),
                            "Visit https://example.com today".to_string(),
                        ),
                    ]),
                },
                DumpRow {
                    pk: PkValue::Int(11),
                    columns: BTreeMap::from([
                        ("post_title".to_string(), "About example.com".to_string()),
                        ("post_content".to_string(), "Nothing to see".to_string()),
                    ]),
                },
            ],
        },
    );
    Dump { tables }
}
