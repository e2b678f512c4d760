use similar::{ChangeTag, TextDiff};

const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const RESET: &str = "\x1b[0m";

/// Print a line diff of one cell's old and new value. Cell values are often
/// a single long line, so this usually renders as one removed and one added
/// line.
pub fn print_diff(old: &str, new: &str, colorize: bool) {
    let diff = TextDiff::configure()
        .algorithm(similar::Algorithm::Myers)
        .diff_lines(old, new);

    for (idx, group) in diff.grouped_ops(3).iter().enumerate() {
        if idx > 0 {
            println!("...");
        }
        for op in group {
            for change in diff.iter_changes(op) {
                let (sign, color) = match change.tag() {
                    ChangeTag::Delete => ("- ", RED),
                    ChangeTag::Insert => ("+ ", GREEN),
                    ChangeTag::Equal => ("  ", ""),
                };
                if colorize && !color.is_empty() {
                    print!("{color}{sign}{change}{RESET}");
                } else {
                    print!("{sign}{change}");
                }
                if change.missing_newline() {
                    println!();
                }
            }
        }
    }
}
