//! Lint error accounting: baseline, delta and autofix targets.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::verify::commands::FixCommand;

/// Upper bound on files handed to one autofix pass.
pub const MAX_FIX_FILES: usize = 50;

static ERROR_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(^|[\s\[(])error(\[[A-Z]?\d+\])?[:\s]|^\S+:\d+(:\d+)?:\s")
        .expect("error line regex")
});
static SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(could not compile|aborting due to|previous errors?|generated \d+ (warnings?|errors?))\b",
    )
    .expect("summary regex")
});
static POSITION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":\d+(:\d+)?").expect("position regex"));

/// Lint state captured before the first attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LintBaseline {
    /// The lint command exited 0; there is no debt to tolerate.
    pub success: bool,
    pub error_count: usize,
    pub lines: Vec<String>,
}

impl LintBaseline {
    pub fn from_output(output: &str, success: bool) -> Self {
        if success {
            return Self {
                success: true,
                ..Self::default()
            };
        }
        let lines = error_lines(output);
        Self {
            success: false,
            error_count: lines.len(),
            lines,
        }
    }

    /// A failing lint run is forgiven only when the baseline already failed
    /// with at least as many error lines.
    pub fn tolerates(&self, current: &[String]) -> bool {
        !self.success && current.len() <= self.error_count
    }
}

/// Diagnostic lines that report an error, excluding tool summaries.
pub fn error_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim_end)
        .filter(|line| ERROR_LINE_RE.is_match(line) && !SUMMARY_RE.is_match(line))
        .map(str::to_string)
        .collect()
}

/// Error lines in `current` that the baseline did not already contain.
///
/// Positions (`:12:5`) are ignored when matching so edits that shift existing
/// errors do not surface them as new.
pub fn delta_lines(baseline: Option<&LintBaseline>, current: &[String]) -> Vec<String> {
    let Some(baseline) = baseline else {
        return current.to_vec();
    };
    let mut known: HashMap<String, usize> = HashMap::new();
    for line in &baseline.lines {
        *known.entry(normalize(line)).or_insert(0) += 1;
    }
    current
        .iter()
        .filter(|line| match known.get_mut(&normalize(line)) {
            Some(count) if *count > 0 => {
                *count -= 1;
                false
            }
            _ => true,
        })
        .cloned()
        .collect()
}

fn normalize(line: &str) -> String {
    POSITION_RE.replace_all(line.trim(), ":_").to_string()
}

/// Changed files the fixer understands, capped at [`MAX_FIX_FILES`].
pub fn fix_targets(changed: &[String], fix: &FixCommand) -> Vec<String> {
    changed
        .iter()
        .filter(|path| {
            fix.extensions.is_empty()
                || path
                    .rsplit_once('.')
                    .is_some_and(|(_, ext)| fix.extensions.iter().any(|e| e == ext))
        })
        .take(MAX_FIX_FILES)
        .cloned()
        .collect()
}

/// Shell command line for one autofix pass, or `None` when there is nothing to fix.
pub fn fix_command_line(fix: &FixCommand, targets: &[String]) -> Option<String> {
    if !fix.takes_files {
        return Some(fix.command.clone());
    }
    if targets.is_empty() {
        return None;
    }
    let files = targets
        .iter()
        .map(|t| shell_quote(t))
        .collect::<Vec<_>>()
        .join(" ");
    if fix.command.contains("{files}") {
        Some(fix.command.replace("{files}", &files))
    } else {
        Some(format!("{} {files}", fix.command))
    }
}

fn shell_quote(arg: &str) -> String {
    if arg
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "/._-+".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIPPY: &str = "\
error: unused variable: `x`
  --> src/lib.rs:3:9
error[E0308]: mismatched types
warning: field is never read
error: could not compile `demo` (lib) due to 2 previous errors
";

    #[test]
    fn counts_error_lines_without_summaries() {
        let lines = error_lines(CLIPPY);
        assert_eq!(
            lines,
            vec![
                "error: unused variable: `x`".to_string(),
                "error[E0308]: mismatched types".to_string()
            ]
        );
    }

    #[test]
    fn counts_path_position_diagnostics() {
        let output =
            "src/a.py:10:1: F401 unused import\nsrc/b.go:4: undefined: x\nFound 2 errors.\n";
        assert_eq!(error_lines(output).len(), 2);
    }

    #[test]
    fn delta_ignores_shifted_preexisting_errors() {
        let baseline = LintBaseline {
            success: false,
            error_count: 1,
            lines: vec!["src/a.py:10:1: F401 unused import".to_string()],
        };
        let current = vec![
            "src/a.py:14:1: F401 unused import".to_string(),
            "src/new.py:1:1: E999 syntax error".to_string(),
        ];
        assert_eq!(
            delta_lines(Some(&baseline), &current),
            vec!["src/new.py:1:1: E999 syntax error".to_string()]
        );
        assert_eq!(delta_lines(None, &current).len(), 2);
    }

    #[test]
    fn only_a_failing_baseline_tolerates_failures() {
        let clean = LintBaseline::from_output("", true);
        assert!(!clean.tolerates(&[]));

        let debt = LintBaseline::from_output("src/a.rs:1:1: error: old", false);
        assert!(debt.tolerates(&["src/a.rs:2:1: error: old".to_string()]));
        assert!(!debt.tolerates(&["x:1: a".to_string(), "y:2: b".to_string()]));
    }

    #[test]
    fn fix_targets_filter_and_cap() {
        let fix = FixCommand {
            command: "rustfmt {files}".to_string(),
            extensions: vec!["rs".to_string()],
            takes_files: true,
        };
        let mut changed: Vec<String> = (0..80).map(|i| format!("src/m{i}.rs")).collect();
        changed.push("README.md".to_string());
        let targets = fix_targets(&changed, &fix);
        assert_eq!(targets.len(), MAX_FIX_FILES);
        assert!(targets.iter().all(|t| t.ends_with(".rs")));

        let line = fix_command_line(&fix, &["src/a b.rs".to_string()]).expect("line");
        assert_eq!(line, "rustfmt 'src/a b.rs'");
        assert_eq!(fix_command_line(&fix, &[]), None);
    }
}
