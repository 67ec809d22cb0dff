//! Deterministic selection logic for the task tree.

use std::collections::HashSet;

use crate::core::task::{Task, TaskFile, TaskKey};

/// Find the first unchecked task, depth-first, whose children are all checked.
///
/// Tasks in `skipped` are never selected. A parent with an unchecked child is
/// not selectable: its children are worked first.
pub fn next_task<'a>(file: &'a TaskFile, skipped: &HashSet<TaskKey>) -> Option<&'a Task> {
    file.pending().find(|task| {
        !skipped.contains(&task.key)
            && file.children(&task.key).iter().all(|child| child.checked)
    })
}

/// Unchecked parents whose children are all checked, deepest first.
///
/// Completing a parent can complete its own parent in turn, so the cascade is
/// resolved here in one pass over reverse document order.
pub fn completable_parents(file: &TaskFile) -> Vec<TaskKey> {
    let mut newly_checked: HashSet<&TaskKey> = HashSet::new();
    let mut out = Vec::new();
    for task in file.tasks.iter().rev() {
        if task.checked || task.children.is_empty() {
            continue;
        }
        let done = task.children.iter().all(|child| {
            newly_checked.contains(child) || file.get(child).is_some_and(|c| c.checked)
        });
        if done {
            newly_checked.insert(&task.key);
            out.push(task.key.clone());
        }
    }
    out
}
