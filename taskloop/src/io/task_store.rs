//! In-place edits to the checklist file.
//!
//! Only checkbox markers are rewritten, plus insertion of decomposition
//! children. Every edit re-reads the file first so concurrent human edits are
//! preserved, and writes atomically.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tracing::{debug, instrument, warn};

use crate::core::parser::{normalize_text, parse_task_file, parse_task_text};
use crate::core::task::{Task, TaskFile, TaskKey};

static MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([ \t]*[-*+]\s+\[)[ xX](\])").expect("marker regex"));

/// Re-read the task file from disk.
pub fn reload(path: &Path) -> Result<TaskFile> {
    parse_task_file(path).with_context(|| format!("reload {}", path.display()))
}

/// Set the checkbox of the task identified by `task` and return the re-parsed file.
///
/// The task is located by key in the file's current contents; if the key no
/// longer matches (the file was edited underneath us), the nearest task with the
/// same text and phase path is used instead.
#[instrument(skip_all, fields(key = %task.key, checked))]
pub fn set_checked(path: &Path, task: &Task, checked: bool) -> Result<TaskFile> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let current = parse_task_text(path, &text)
        .with_context(|| format!("parse {} before update", path.display()))?;
    let line = locate(&current, task)
        .ok_or_else(|| anyhow!("task '{}' no longer present in {}", task.text, path.display()))?;

    let mark = if checked { "x" } else { " " };
    let mut lines: Vec<String> = text.split_inclusive('\n').map(str::to_string).collect();
    let target = lines
        .get_mut(line - 1)
        .ok_or_else(|| anyhow!("line {line} out of range"))?;
    if !MARKER_RE.is_match(target) {
        return Err(anyhow!("line {line} is not a checkbox"));
    }
    *target = MARKER_RE
        .replace(target, format!("${{1}}{mark}${{2}}").as_str())
        .into_owned();

    let updated: String = lines.concat();
    crate::io::write_atomic(path, &updated)?;
    debug!(line, "checkbox updated");
    parse_task_text(path, &updated).with_context(|| format!("re-parse {}", path.display()))
}

/// Insert unchecked children directly after `parent`'s subtree.
///
/// Returns the re-parsed file and the keys of the inserted children in order.
#[instrument(skip_all, fields(key = %parent.key, count = children.len()))]
pub fn insert_children(
    path: &Path,
    parent: &Task,
    children: &[String],
) -> Result<(TaskFile, Vec<TaskKey>)> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let current = parse_task_text(path, &text)
        .with_context(|| format!("parse {} before insert", path.display()))?;
    let parent_line = locate(&current, parent)
        .ok_or_else(|| anyhow!("task '{}' no longer present in {}", parent.text, path.display()))?;
    let located = current
        .tasks
        .iter()
        .find(|t| t.line == parent_line)
        .ok_or_else(|| anyhow!("no task at line {parent_line}"))?;
    let end_line = current
        .subtree_end_line(&located.key)
        .unwrap_or(parent_line);

    let mut lines: Vec<String> = text.split_inclusive('\n').map(str::to_string).collect();
    let parent_indent: String = lines[parent_line - 1]
        .chars()
        .take_while(|c| *c == ' ' || *c == '\t')
        .collect();
    let indent = format!("{parent_indent}{}", current.indent_unit);
    if let Some(last) = lines.get_mut(end_line - 1)
        && !last.ends_with('\n')
    {
        last.push('\n');
    }

    let new_lines: Vec<String> = children
        .iter()
        .map(|child| normalize_text(child))
        .filter(|child| !child.is_empty())
        .map(|child| format!("{indent}- [ ] {child}\n"))
        .collect();
    if new_lines.is_empty() {
        return Err(anyhow!("decomposition produced no usable children"));
    }
    lines.splice(end_line..end_line, new_lines);

    let updated: String = lines.concat();
    let reparsed = parse_task_text(path, &updated)
        .with_context(|| format!("inserted children make {} ambiguous", path.display()))?;
    crate::io::write_atomic(path, &updated)?;

    let parent_key = reparsed
        .tasks
        .iter()
        .find(|t| t.line == parent_line)
        .map(|t| t.key.clone())
        .ok_or_else(|| anyhow!("parent vanished after insert"))?;
    let existing = located.children.len();
    let inserted: Vec<TaskKey> = reparsed
        .get(&parent_key)
        .map(|t| t.children.iter().skip(existing).cloned().collect())
        .unwrap_or_default();
    debug!(inserted = inserted.len(), "children inserted");
    Ok((reparsed, inserted))
}

/// Line of `task` in `file`, by key or by text fallback.
fn locate(file: &TaskFile, task: &Task) -> Option<usize> {
    if let Some(found) = file.get(&task.key) {
        return Some(found.line);
    }
    let found = file
        .tasks
        .iter()
        .filter(|t| t.text == task.text && t.phase_path == task.phase_path)
        .min_by_key(|t| t.line.abs_diff(task.line))?;
    warn!(key = %task.key, line = found.line, "task key changed, matched by text");
    Some(found.line)
}
