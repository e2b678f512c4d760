use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum, ValueHint};
use is_terminal::IsTerminal;

mod changeset;
mod codec;
mod diff;
mod error;
mod ledger;
mod locate;
mod logging;
mod plan;
mod replace;
mod session;
mod store;
mod value;

use ledger::Ledger;
use locate::{MatchRecord, Preview};
use plan::load_plan;
use session::{CancelToken, CommitSummary, Session, TableStatus};
use store::{DumpStore, RowSource};

const HIGHLIGHT: &str = "\x1b[1;31m";
const RESET: &str = "\x1b[0m";

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq, Default)]
enum ColorChoice {
    #[default]
    Auto,
    Always,
    Never,
}

impl ColorChoice {
    fn should_color(self) -> bool {
        match self {
            ColorChoice::Always => true,
            ColorChoice::Never => false,
            ColorChoice::Auto => io::stdout().is_terminal(),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    run(cli)
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run(cmd) => handle_run(cmd)?,
        Command::Undo(cmd) => handle_undo(cmd)?,
        Command::Backups(cmd) => handle_backups(cmd)?,
        Command::Log(cmd) => handle_log(cmd)?,
        Command::Cleanup(cmd) => handle_cleanup(cmd)?,
    }

    Ok(())
}

fn handle_run(cmd: RunCommand) -> Result<()> {
    let colorize = cmd.color.should_color();
    let plan = load_plan(&cmd.plan)?;
    let mut store = DumpStore::load(&cmd.dump)?;
    let ledger = Ledger::new(&cmd.backup_dir);
    let cancel = CancelToken::new();

    println!(
        "run: plan={}, dump={}, apply={}",
        cmd.plan.display(),
        cmd.dump.display(),
        cmd.apply
    );
    println!(
        "  search='{}' replacement='{}'",
        plan.search, plan.replacement
    );

    let mut session = Session::new();
    session.set_term(&plan.search)?;
    let tables = plan.resolve_tables(&store.tables())?;
    println!("  tables: {}", tables.join(", "));
    session.select_tables(tables)?;

    let matched = session.find_matches(&store, &cancel)?;
    for table in &matched.tables {
        if table.cells == 0 {
            println!("  {}: no matches", table.table);
        } else {
            println!(
                "  {}: {} row(s), {} cell(s), {} occurrence(s)",
                table.table, table.rows, table.cells, table.occurrences
            );
        }
    }
    if matched.total_cells() == 0 {
        println!("no matches; nothing to do.");
        return Ok(());
    }
    println!(
        "  total: {} cell(s), {} occurrence(s)",
        matched.total_cells(),
        matched.total_occurrences()
    );
    print_match_previews(session.matches(), cmd.max_previews, colorize);

    session.set_filter(plan.column_filter())?;
    session.set_row_rules(plan.row_rules())?;
    session.set_replacement(&plan.replacement)?;

    let changes = session.dry_run()?.to_vec();
    let mut included = 0usize;
    for change in &changes {
        if !change.included {
            println!(
                "--- skipped: {} row {} column {} (excluded by row rules) ---",
                change.table, change.pk, change.column
            );
            continue;
        }
        included += 1;
        println!(
            "--- preview: {} row {} column {} ({} occurrence(s)) ---",
            change.table, change.pk, change.column, change.occurrences
        );
        diff::print_diff(&change.original, &change.new_raw, colorize);
    }

    if included == 0 {
        println!("every change was filtered or excluded; nothing to write.");
        return Ok(());
    }
    if !cmd.apply {
        println!("dry-run: {included} change(s) pending; rerun with --apply to write.");
        return Ok(());
    }

    let summary = session.commit(&ledger, &mut store, &cancel)?;
    print_commit_summary(&summary);
    for outcome in &summary.outcomes {
        let (action, rows) = match &outcome.status {
            TableStatus::Committed { rows } => ("applied", *rows),
            TableStatus::Failed { rows, .. } => ("failed", *rows),
            TableStatus::Cancelled => ("cancelled", 0),
        };
        logging::record_change("run", &outcome.table, action, rows)?;
    }
    Ok(())
}

fn handle_undo(cmd: UndoCommand) -> Result<()> {
    let ledger = Ledger::new(&cmd.backup_dir);
    let path = match cmd.backup {
        Some(path) => path,
        None => ledger
            .latest_unconsumed()?
            .context("no replayable backup found; see 'dbshift backups'")?,
    };
    let file = ledger.load(&path)?;
    println!(
        "undo: {} ({} entries, search '{}' -> '{}')",
        path.display(),
        file.entries.len(),
        file.search,
        file.replacement
    );

    if !cmd.apply {
        for entry in &file.entries {
            println!(
                "  {} row {} column {} <- {} byte(s)",
                entry.table,
                entry.pk,
                entry.column,
                entry.original.len()
            );
        }
        println!("dry-run: rerun with --apply to restore these values.");
        return Ok(());
    }

    let mut store = DumpStore::load(&cmd.dump)?;
    let report = ledger.undo(&path, &mut store)?;
    println!("restored {} cell(s)", report.restored);
    for conflict in &report.conflicts {
        println!(
            "  conflict: {} row {}: {}",
            conflict.table, conflict.row, conflict.reason
        );
    }
    for (table, reason) in &report.failed_tables {
        println!("  failed: {table}: {reason}");
    }
    let target = path.display().to_string();
    logging::record_change("undo", &target, "restored", report.restored)?;
    Ok(())
}

fn handle_backups(cmd: BackupsCommand) -> Result<()> {
    let ledger = Ledger::new(&cmd.backup_dir);
    let summaries = ledger.list()?;
    if summaries.is_empty() {
        println!("no backups recorded in {}", ledger.dir().display());
        return Ok(());
    }
    for summary in summaries {
        let marker = if summary.consumed { "  (replayed)" } else { "" };
        println!(
            "{} ({})  search '{}' -> '{}'  {} entr{}{}",
            summary.operation,
            summary.created,
            summary.search,
            summary.replacement,
            summary.entries,
            if summary.entries == 1 { "y" } else { "ies" },
            marker
        );
    }
    Ok(())
}

fn handle_log(cmd: LogCommand) -> Result<()> {
    let lines = logging::read_recent(cmd.limit)?;
    if lines.is_empty() {
        println!("no change log entries.");
        return Ok(());
    }
    for line in lines {
        println!("{line}");
    }
    Ok(())
}

fn handle_cleanup(cmd: CleanupCommand) -> Result<()> {
    let ledger = Ledger::new(&cmd.backup_dir);
    let consumed = ledger.cleanup_consumed(cmd.apply)?;
    if consumed.is_empty() {
        println!("no replayed backups to remove.");
        return Ok(());
    }
    for path in &consumed {
        if cmd.apply {
            println!("removed {}", path.display());
        } else {
            println!("would remove {}", path.display());
        }
    }
    if !cmd.apply {
        println!("dry-run: rerun with --apply to delete.");
    }
    Ok(())
}

fn print_match_previews(matches: &[MatchRecord], limit: usize, colorize: bool) {
    let mut current_table: Option<&str> = None;
    let mut shown = 0usize;
    for record in matches {
        if current_table != Some(record.table.as_str()) {
            current_table = Some(record.table.as_str());
            shown = 0;
            println!("matches in {}:", record.table);
        }
        if shown == limit {
            let remaining = matches
                .iter()
                .filter(|other| other.table == record.table)
                .count()
                - limit;
            println!("  ... ({remaining} more)");
        }
        if shown >= limit {
            shown += 1;
            continue;
        }
        shown += 1;
        println!(
            "  [{}] {} ({} hit(s)): {}",
            record.pk,
            record.column,
            record.occurrences,
            render_preview(&record.preview, colorize)
        );
    }
}

/// Flatten a preview into one console line: ellipses where the window cut
/// text, matched spans highlighted, newlines collapsed.
fn render_preview(preview: &Preview, colorize: bool) -> String {
    let mut out = String::new();
    if preview.truncated_start {
        out.push_str("...");
    }
    let mut last = 0;
    for span in &preview.spans {
        out.push_str(&preview.snippet[last..span.start]);
        if colorize {
            out.push_str(HIGHLIGHT);
        }
        out.push_str(&preview.snippet[span.clone()]);
        if colorize {
            out.push_str(RESET);
        }
        last = span.end;
    }
    out.push_str(&preview.snippet[last..]);
    if preview.truncated_end {
        out.push_str("...");
    }
    out.replace(['\n', '\r'], " ")
}

fn print_commit_summary(summary: &CommitSummary) {
    for outcome in &summary.outcomes {
        match &outcome.status {
            TableStatus::Committed { rows } => {
                println!("  {}: {} row(s) written", outcome.table, rows);
            }
            TableStatus::Failed { rows, error } => {
                println!("  {error}; {rows} row(s) rolled back");
            }
            TableStatus::Cancelled => {
                println!("  {}: skipped (cancelled)", outcome.table);
            }
        }
    }
    if let Some(backup) = &summary.backup {
        println!("backup saved: {}", backup.display());
    }
    for warning in &summary.warnings {
        println!("warning: {warning}");
    }
    println!(
        "run summary: written={}, failed={}, skipped={}",
        summary.rows_written(),
        summary.rows_failed(),
        summary.tables_skipped()
    );
}

#[derive(Debug, Parser)]
#[command(
    name = "dbshift",
    version,
    about = "Serialization-aware search and replace for WordPress database dumps"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Execute an operation plan against a dump (dry-run unless --apply).
    Run(RunCommand),
    /// Replay a recorded backup, restoring the original values.
    Undo(UndoCommand),
    /// List recorded backup operations.
    Backups(BackupsCommand),
    /// Show recent change log entries.
    Log(LogCommand),
    /// Delete replayed backup files.
    Cleanup(CleanupCommand),
}

#[derive(Debug, Args)]
struct RunCommand {
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    plan: PathBuf,
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    dump: PathBuf,
    #[arg(long, action = ArgAction::SetTrue)]
    apply: bool,
    #[arg(long = "backup-dir", value_name = "DIR", default_value = "backups", value_hint = ValueHint::DirPath)]
    backup_dir: PathBuf,
    #[arg(long = "color", value_enum, default_value = "auto")]
    color: ColorChoice,
    #[arg(long = "max-previews", value_name = "N", default_value_t = 10)]
    max_previews: usize,
}

#[derive(Debug, Args)]
struct UndoCommand {
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    dump: PathBuf,
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    backup: Option<PathBuf>,
    #[arg(long = "backup-dir", value_name = "DIR", default_value = "backups", value_hint = ValueHint::DirPath)]
    backup_dir: PathBuf,
    #[arg(long, action = ArgAction::SetTrue)]
    apply: bool,
}

#[derive(Debug, Args)]
struct BackupsCommand {
    #[arg(long = "backup-dir", value_name = "DIR", default_value = "backups", value_hint = ValueHint::DirPath)]
    backup_dir: PathBuf,
}

#[derive(Debug, Args)]
struct LogCommand {
    #[arg(long, value_name = "N", default_value_t = 20)]
    limit: usize,
}

#[derive(Debug, Args)]
struct CleanupCommand {
    #[arg(long = "backup-dir", value_name = "DIR", default_value = "backups", value_hint = ValueHint::DirPath)]
    backup_dir: PathBuf,
    #[arg(long, action = ArgAction::SetTrue)]
    apply: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_preview_marks_spans_and_edges() {
        let preview = Preview {
            snippet: "visit example.com now".to_string(),
            spans: vec![6..17],
            truncated_start: true,
            truncated_end: false,
        };
        assert_eq!(
            render_preview(&preview, false),
            "...visit example.com now"
        );
        let colored = render_preview(&preview, true);
        assert!(colored.contains("\x1b[1;31mexample.com\x1b[0m"));
    }

    #[test]
    fn render_preview_collapses_newlines() {
        let preview = Preview {
            snippet: "line one\nline two".to_string(),
            spans: vec![0..4],
            truncated_start: false,
            truncated_end: true,
        };
        assert_eq!(render_preview(&preview, false), "line one line two...");
    }

    #[test]
    fn color_choice_never_disables_color() {
        assert!(!ColorChoice::Never.should_color());
        assert!(ColorChoice::Always.should_color());
    }
}
