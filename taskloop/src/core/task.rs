//! Task arena built from a checklist document.
//!
//! Tasks live in a flat vector in document order. Parent/child links are
//! stored as [`TaskKey`]s so the tree can be cloned, serialized and diffed
//! without aliasing.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Content-addressed task identity.
///
/// Derived from the heading breadcrumb, the parent key, the normalized text
/// and the sibling position. Independent of the line number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKey(String);

impl TaskKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One checkbox line of the checklist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub key: TaskKey,
    pub text: String,
    pub phase_path: Vec<String>,
    pub depth: usize,
    /// 1-based line number in the parsed document. Shifts between parses.
    pub line: usize,
    pub checked: bool,
    pub parent: Option<TaskKey>,
    pub children: Vec<TaskKey>,
}

impl Task {
    /// Heading breadcrumb rendered as `Phase 1 > Parser`.
    pub fn phase_label(&self) -> String {
        self.phase_path.join(" > ")
    }
}

/// Parsed checklist document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskFile {
    pub path: PathBuf,
    /// All tasks in document order (which is also depth-first order).
    pub tasks: Vec<Task>,
    pub roots: Vec<TaskKey>,
    pub content_hash: String,
    /// Indentation for one nesting level (`"  "`, `"    "` or `"\t"`).
    pub indent_unit: String,
    #[serde(skip)]
    index: HashMap<TaskKey, usize>,
}

impl TaskFile {
    pub fn new(path: &Path, tasks: Vec<Task>, roots: Vec<TaskKey>, content_hash: String) -> Self {
        let index = tasks
            .iter()
            .enumerate()
            .map(|(idx, task)| (task.key.clone(), idx))
            .collect();
        Self {
            path: path.to_path_buf(),
            tasks,
            roots,
            content_hash,
            indent_unit: "  ".to_string(),
            index,
        }
    }

    pub fn get(&self, key: &TaskKey) -> Option<&Task> {
        self.index.get(key).map(|idx| &self.tasks[*idx])
    }

    pub fn contains(&self, key: &TaskKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn children(&self, key: &TaskKey) -> Vec<&Task> {
        self.get(key)
            .map(|task| task.children.iter().filter_map(|c| self.get(c)).collect())
            .unwrap_or_default()
    }

    pub fn parent(&self, key: &TaskKey) -> Option<&Task> {
        self.get(key)
            .and_then(|task| task.parent.as_ref())
            .and_then(|parent| self.get(parent))
    }

    /// Unchecked tasks, depth-first.
    pub fn pending(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|task| !task.checked)
    }

    pub fn completed(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|task| task.checked)
    }

    pub fn total_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending().count()
    }

    pub fn all_checked(&self) -> bool {
        self.tasks.iter().all(|task| task.checked)
    }

    /// Keys of every descendant of `key`, depth-first.
    pub fn descendants(&self, key: &TaskKey) -> Vec<TaskKey> {
        let mut out = Vec::new();
        let mut stack: Vec<TaskKey> = self
            .get(key)
            .map(|task| task.children.iter().rev().cloned().collect())
            .unwrap_or_default();
        while let Some(next) = stack.pop() {
            if let Some(task) = self.get(&next) {
                stack.extend(task.children.iter().rev().cloned());
            }
            out.push(next);
        }
        out
    }

    /// Last line occupied by `key` or any of its descendants.
    pub fn subtree_end_line(&self, key: &TaskKey) -> Option<usize> {
        let own = self.get(key)?.line;
        Some(
            self.descendants(key)
                .iter()
                .filter_map(|k| self.get(k))
                .map(|task| task.line)
                .max()
                .unwrap_or(own)
                .max(own),
        )
    }
}
