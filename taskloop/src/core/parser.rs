//! Checklist parsing: markdown checkboxes under headings → [`TaskFile`].

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::core::task::{Task, TaskFile, TaskKey};
use crate::error::ParseError;

const DEFAULT_SPACE_UNIT: usize = 2;
const KEY_HEX_LEN: usize = 16;

static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ {0,3}(#{1,6})\s+(.*?)\s*#*\s*$").expect("heading regex"));
static CHECKBOX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([ \t]*)[-*+]\s+\[([ xX])\](?:\s+(.*))?\s*$").expect("checkbox regex")
});

/// A checkbox line before tree construction.
#[derive(Debug)]
struct RawCheckbox {
    line: usize,
    indent: String,
    checked: bool,
    text: String,
    phase_path: Vec<String>,
    /// True when this is the first checkbox after a heading change.
    section_start: bool,
}

/// Read and parse a checklist file.
pub fn parse_task_file(path: &Path) -> Result<TaskFile, ParseError> {
    let bytes = fs::read(path).map_err(|source| ParseError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let text = String::from_utf8(bytes).map_err(|_| ParseError::Ambiguous {
        path: path.to_path_buf(),
        line: 1,
        reason: "task file is not valid UTF-8".to_string(),
    })?;
    parse_task_text(path, &text)
}

/// Parse checklist text already in memory. `path` is only used for reporting.
pub fn parse_task_text(path: &Path, text: &str) -> Result<TaskFile, ParseError> {
    let raw = scan_lines(text);
    let unit = indent_unit(path, &raw)?;

    let mut tasks: Vec<Task> = Vec::with_capacity(raw.len());
    let mut roots = Vec::new();
    let mut root_counters: HashMap<Vec<String>, usize> = HashMap::new();
    // (depth, arena index) of the open ancestors for the current section.
    let mut stack: Vec<(usize, usize)> = Vec::new();
    let mut seen: HashMap<TaskKey, usize> = HashMap::new();

    for item in raw {
        let ambiguous = |reason: String| ParseError::Ambiguous {
            path: path.to_path_buf(),
            line: item.line,
            reason,
        };

        if item.section_start {
            stack.clear();
        }
        let depth = depth_of(&item.indent, &unit).map_err(ambiguous)?;
        let task_text = normalize_text(&item.text);
        if task_text.is_empty() {
            return Err(ambiguous("checkbox has no text".to_string()));
        }

        match stack.last() {
            None if depth > 0 => {
                return Err(ambiguous(format!(
                    "checkbox indented to depth {depth} without a parent"
                )));
            }
            Some((prev_depth, _)) if depth > prev_depth + 1 => {
                return Err(ambiguous(format!(
                    "checkbox jumps from depth {prev_depth} to depth {depth}"
                )));
            }
            _ => {}
        }
        while stack.last().is_some_and(|(d, _)| *d >= depth) {
            stack.pop();
        }

        let parent_idx = stack.last().map(|(_, idx)| *idx);
        let sibling_index = match parent_idx {
            Some(idx) => tasks[idx].children.len(),
            None => {
                let counter = root_counters.entry(item.phase_path.clone()).or_insert(0);
                let index = *counter;
                *counter += 1;
                index
            }
        };
        let parent_key = parent_idx.map(|idx| tasks[idx].key.clone());
        let key = task_key(&item.phase_path, parent_key.as_ref(), &task_text, sibling_index);
        if let Some(previous) = seen.insert(key.clone(), item.line) {
            return Err(ambiguous(format!(
                "task identity collides with line {previous}"
            )));
        }

        let idx = tasks.len();
        match parent_idx {
            Some(p) => tasks[p].children.push(key.clone()),
            None => roots.push(key.clone()),
        }
        tasks.push(Task {
            key,
            text: task_text,
            phase_path: item.phase_path,
            depth,
            line: item.line,
            checked: item.checked,
            parent: parent_key,
            children: Vec::new(),
        });
        stack.push((depth, idx));
    }

    let mut file = TaskFile::new(path, tasks, roots, content_hash(text.as_bytes()));
    file.indent_unit = unit.as_string();
    Ok(file)
}

/// SHA-256 hex digest of raw file bytes, used for cheap change detection.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Derive a task key from its identity tuple.
pub fn task_key(
    phase_path: &[String],
    parent: Option<&TaskKey>,
    text: &str,
    sibling_index: usize,
) -> TaskKey {
    let mut hasher = Sha256::new();
    for (i, phase) in phase_path.iter().enumerate() {
        if i > 0 {
            hasher.update([0x1f]);
        }
        hasher.update(normalize_text(phase).as_bytes());
    }
    hasher.update([0x1e]);
    hasher.update(parent.map(TaskKey::as_str).unwrap_or("").as_bytes());
    hasher.update([0x1e]);
    hasher.update(normalize_text(text).as_bytes());
    hasher.update([0x1e]);
    hasher.update(sibling_index.to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    TaskKey::new(&digest[..KEY_HEX_LEN])
}

/// Collapse internal whitespace and trim.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn scan_lines(text: &str) -> Vec<RawCheckbox> {
    let mut out = Vec::new();
    let mut headings: Vec<(usize, String)> = Vec::new();
    let mut in_fence = false;
    let mut section_start = true;

    for (idx, line) in text.lines().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if let Some(caps) = HEADING_RE.captures(line) {
            let level = caps[1].len();
            let title = caps[2].trim().to_string();
            while headings.last().is_some_and(|(l, _)| *l >= level) {
                headings.pop();
            }
            headings.push((level, title));
            section_start = true;
            continue;
        }
        if let Some(caps) = CHECKBOX_RE.captures(line) {
            out.push(RawCheckbox {
                line: idx + 1,
                indent: caps[1].to_string(),
                checked: !caps[2].trim().is_empty(),
                text: caps.get(3).map(|m| m.as_str()).unwrap_or("").to_string(),
                phase_path: headings.iter().map(|(_, t)| t.clone()).collect(),
                section_start,
            });
            section_start = false;
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IndentUnit {
    Tab,
    Spaces(usize),
}

impl IndentUnit {
    fn as_string(self) -> String {
        match self {
            IndentUnit::Tab => "\t".to_string(),
            IndentUnit::Spaces(n) => " ".repeat(n),
        }
    }
}

fn indent_unit(path: &Path, raw: &[RawCheckbox]) -> Result<IndentUnit, ParseError> {
    let mut uses_tabs = false;
    let mut min_spaces: Option<usize> = None;
    for item in raw {
        if item.indent.is_empty() {
            continue;
        }
        let tabs = item.indent.chars().filter(|c| *c == '\t').count();
        if tabs > 0 && tabs != item.indent.len() {
            return Err(ParseError::Ambiguous {
                path: path.to_path_buf(),
                line: item.line,
                reason: "indentation mixes tabs and spaces".to_string(),
            });
        }
        if tabs > 0 {
            uses_tabs = true;
        } else {
            let n = item.indent.len();
            min_spaces = Some(min_spaces.map_or(n, |m| m.min(n)));
        }
    }
    match (uses_tabs, min_spaces) {
        (true, Some(_)) => Err(ParseError::Ambiguous {
            path: path.to_path_buf(),
            line: raw
                .iter()
                .find(|item| item.indent.starts_with(' '))
                .map_or(1, |item| item.line),
            reason: "file indents checkboxes with both tabs and spaces".to_string(),
        }),
        (true, None) => Ok(IndentUnit::Tab),
        (false, Some(n)) => Ok(IndentUnit::Spaces(n)),
        (false, None) => Ok(IndentUnit::Spaces(DEFAULT_SPACE_UNIT)),
    }
}

fn depth_of(indent: &str, unit: &IndentUnit) -> Result<usize, String> {
    match unit {
        IndentUnit::Tab => Ok(indent.len()),
        IndentUnit::Spaces(n) => {
            if indent.len() % n != 0 {
                return Err(format!(
                    "indent of {} spaces is not a multiple of {n}",
                    indent.len()
                ));
            }
            Ok(indent.len() / n)
        }
    }
}
