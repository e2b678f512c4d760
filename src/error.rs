use thiserror::Error;

/// Contract errors of the replace engine. Callers branch on these; plumbing
/// failures underneath them stay `anyhow` and are carried as detail strings.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("search term must not be empty")]
    EmptyTerm,

    #[error("no tables selected")]
    NoTables,

    #[error("operation out of order: {0}")]
    StaleState(String),

    #[error("a dry run is required before changes can be committed")]
    DryRunRequired,

    #[error("change set is empty; nothing to commit")]
    EmptyChangeSet,

    #[error("write to {table} row {row} failed: {reason}")]
    Write {
        table: String,
        row: String,
        reason: String,
    },

    #[error("backup could not be persisted: {detail}")]
    Persistence { detail: String },

    #[error("row source error: {detail}")]
    Source { detail: String },
}
