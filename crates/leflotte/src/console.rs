//! Aligned status lines
//!
//! Every machine-scoped action prints one line:
//!
//! ```text
//!      [Debian x64]   Linux x64 > Build                   [12.34s]
//! ```
//!
//! The name column is as wide as the longest selected machine name. Colors come from
//! `console` and are dropped automatically when stdout is not a terminal.

use console::style;
use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Width of the action column
const ACTION_WIDTH: usize = 34;

/// Indent of the line prefix before the machine name
const PREFIX_WIDTH: usize = 5;

/// Status shown at the end of a line
#[derive(Debug, Clone, PartialEq)]
pub enum Status {
    /// `[ok]`
    Ok,
    /// `[error]`
    Error,
    /// `[ignore]`
    Ignore,
    /// Elapsed time of a successful command, e.g. `[12.34s]`
    Elapsed(Duration),
    /// Custom tag such as `manual` or `missing`
    Tag(String),
}

impl Status {
    /// Pick `Ok` or `Error`
    #[must_use]
    pub fn from_success(success: bool) -> Self {
        if success {
            Status::Ok
        } else {
            Status::Error
        }
    }

    fn plain(&self) -> String {
        match self {
            Status::Ok => "[ok]".to_string(),
            Status::Error => "[error]".to_string(),
            Status::Ignore => "[ignore]".to_string(),
            Status::Elapsed(elapsed) => format!("[{:.2}s]", elapsed.as_secs_f64()),
            Status::Tag(tag) => format!("[{tag}]"),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = style(self.plain()).bold();
        let text = match self {
            Status::Ok | Status::Elapsed(_) => text.green(),
            Status::Error | Status::Tag(_) => text.red(),
            Status::Ignore => text.black().bright(),
        };
        write!(f, "{text}")
    }
}

#[derive(Debug, Clone)]
enum Sink {
    Terminal,
    Capture(Arc<Mutex<Vec<String>>>),
}

/// Status output of one run
#[derive(Debug)]
pub struct StatusLog {
    names: Vec<String>,
    align: OnceCell<usize>,
    sink: Sink,
}

impl StatusLog {
    /// Log aligned on the given machine names, printing to the terminal
    #[must_use]
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            align: OnceCell::new(),
            sink: Sink::Terminal,
        }
    }

    /// Log that keeps lines in memory instead of printing them
    #[must_use]
    pub fn capturing<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sink: Sink::Capture(Arc::new(Mutex::new(Vec::new()))),
            ..Self::new(names)
        }
    }

    /// Width of the name column, computed on first use
    pub fn align(&self) -> usize {
        *self.align.get_or_init(|| {
            self.names
                .iter()
                .map(|name| name.chars().count())
                .max()
                .unwrap_or(0)
        })
    }

    /// Format a status line without printing it
    #[must_use]
    pub fn format_line(&self, name: &str, action: &str, status: &Status) -> String {
        let pad_name = self.align().saturating_sub(name.chars().count());
        let pad_action = ACTION_WIDTH.saturating_sub(action.chars().count());

        format!(
            "{:prefix$}[{name}]{:pad_name$}  {action}{:pad_action$}  {status}",
            "",
            "",
            "",
            prefix = PREFIX_WIDTH,
        )
    }

    /// Print a machine status line
    pub fn line(&self, name: &str, action: &str, status: Status) {
        let line = self.format_line(name, action, &status);
        self.out(line);
    }

    /// Print a phase header such as `>> Upload source code...`
    pub fn phase(&self, title: &str) {
        self.out(format!(">> {title}"));
    }

    /// Print a free-form line
    pub fn say(&self, text: impl Into<String>) {
        self.out(text.into());
    }

    /// Print a free-form line to standard error
    pub fn warn(&self, text: impl Into<String>) {
        self.err(text.into());
    }

    /// Dump captured command output below a failed line
    pub fn output(&self, stdout: &str, stderr: &str) {
        let stdout = stdout.trim_end();
        let stderr = stderr.trim_end();
        if stdout.is_empty() && stderr.is_empty() {
            return;
        }

        self.err(String::new());
        let indent = self.align() + PREFIX_WIDTH + 4;
        for (title, text) in [("Standard output:", stdout), ("Standard error:", stderr)] {
            if text.is_empty() {
                continue;
            }

            let body = text
                .lines()
                .map(|line| format!("{:indent$}{line}", "", indent = indent + 4))
                .collect::<Vec<_>>()
                .join("\n");
            self.err(format!("{:indent$}{title}\n{}\n", "", style(body).yellow()));
        }
    }

    /// Print the final status of a run
    pub fn summary(&self, success: bool, skipped: bool) {
        self.out(String::new());
        if success {
            self.out(format!(">> Status: {}", style("SUCCESS").bold().green()));
            if skipped {
                self.out("   (but some machines could not be tested)".to_string());
            }
        } else {
            self.out(format!(">> Status: {}", style("FAILED").bold().red()));
        }
    }

    /// Lines captured so far, stdout and stderr interleaved
    #[must_use]
    pub fn captured(&self) -> Vec<String> {
        match &self.sink {
            Sink::Terminal => Vec::new(),
            Sink::Capture(lines) => lines.lock().map(|l| l.clone()).unwrap_or_default(),
        }
    }

    fn out(&self, line: String) {
        match &self.sink {
            Sink::Terminal => println!("{line}"),
            Sink::Capture(lines) => push(lines, line),
        }
    }

    fn err(&self, line: String) {
        match &self.sink {
            Sink::Terminal => eprintln!("{line}"),
            Sink::Capture(lines) => push(lines, line),
        }
    }
}

fn push(lines: &Mutex<Vec<String>>, line: String) {
    if let Ok(mut lines) = lines.lock() {
        lines.push(console::strip_ansi_codes(&line).into_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_alignment() {
        let log = StatusLog::capturing(["Debian x64", "macOS ARM64", "Win"]);
        let line = log.format_line("Win", "Upload", &Status::Ok);
        let plain = console::strip_ansi_codes(&line);

        let expected = format!("     [Win]{}  Upload{}  [ok]", " ".repeat(8), " ".repeat(28));
        assert_eq!(plain, expected);
        assert_eq!(log.align(), 11);
    }

    #[test]
    fn test_long_action_is_not_truncated() {
        let log = StatusLog::capturing(["a"]);
        let action = "x".repeat(40);
        let line = log.format_line("a", &action, &Status::Ignore);
        assert!(console::strip_ansi_codes(&line).ends_with(&format!("{action}  [ignore]")));
    }

    #[test]
    fn test_status_text() {
        assert_eq!(Status::Elapsed(Duration::from_millis(12_345)).plain(), "[12.35s]");
        assert_eq!(Status::Tag("manual".into()).plain(), "[manual]");
        assert_eq!(Status::from_success(false), Status::Error);
    }

    #[test]
    fn test_output_dump_is_indented() {
        let log = StatusLog::capturing(["abc"]);
        log.output("line 1\nline 2\n", "");

        let captured = log.captured();
        assert_eq!(captured[0], "");
        let expected = format!(
            "{}Standard output:\n{}line 1\n{}line 2\n",
            " ".repeat(12),
            " ".repeat(16),
            " ".repeat(16)
        );
        assert_eq!(captured[1], expected);
        assert_eq!(captured.len(), 2);
    }

    #[test]
    fn test_summary() {
        let log = StatusLog::capturing(["a"]);
        log.summary(true, true);
        log.summary(false, true);

        assert_eq!(
            log.captured(),
            vec![
                "",
                ">> Status: SUCCESS",
                "   (but some machines could not be tested)",
                "",
                ">> Status: FAILED",
            ]
        );
    }
}
