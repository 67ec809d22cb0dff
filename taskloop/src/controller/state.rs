//! Mutable bookkeeping threaded through one run.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use crate::core::budget::Usage;
use crate::core::task::{TaskFile, TaskKey};
use crate::core::types::{Attempt, PreflightRecord, RunResult, StopReason};
use crate::io::progress::Heartbeat;
use crate::io::process::millis;

/// A plan file prepared by preflight for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanFile {
    /// Path relative to the project root, as shown to the agent.
    pub path: String,
    pub content: String,
}

#[derive(Debug)]
pub struct RunState {
    pub started: Instant,
    pub iterations: u32,
    pub tokens_used: u64,
    pub completed: usize,
    pub failed: usize,
    pub decomposed: usize,
    pub auto_completed: usize,
    pub commits: usize,
    pub skipped: HashSet<TaskKey>,
    pub attempts: Vec<Attempt>,
    pub preflight: Vec<PreflightRecord>,
    pub plans: HashMap<TaskKey, PlanFile>,
    /// Decomposition generation per task; authored tasks are generation 0.
    generations: HashMap<TaskKey, u32>,
    /// Hash of the task file as the controller last wrote or read it.
    pub expected_hash: String,
    pub total_tasks: usize,
}

impl RunState {
    pub fn new(file: &TaskFile) -> Self {
        Self {
            started: Instant::now(),
            iterations: 0,
            tokens_used: 0,
            completed: 0,
            failed: 0,
            decomposed: 0,
            auto_completed: 0,
            commits: 0,
            skipped: HashSet::new(),
            attempts: Vec::new(),
            preflight: Vec::new(),
            plans: HashMap::new(),
            generations: HashMap::new(),
            expected_hash: file.content_hash.clone(),
            total_tasks: file.total_count(),
        }
    }

    pub fn usage(&self) -> Usage {
        Usage {
            iterations: self.iterations,
            elapsed: self.started.elapsed(),
            tokens: self.tokens_used,
        }
    }

    pub fn generation(&self, key: &TaskKey) -> u32 {
        self.generations.get(key).copied().unwrap_or(0)
    }

    pub fn record_children(&mut self, parent: &TaskKey, children: &[TaskKey]) {
        let next = self.generation(parent) + 1;
        for child in children {
            self.generations.insert(child.clone(), next);
        }
    }

    /// Adopt a freshly read or written task file.
    pub fn observe(&mut self, file: &TaskFile) {
        self.expected_hash = file.content_hash.clone();
        self.total_tasks = file.total_count();
    }

    pub fn heartbeat(&self, file: &TaskFile, current: Option<&str>) -> Heartbeat {
        Heartbeat {
            iteration: self.iterations,
            current_task: current.map(str::to_string),
            completed: file.completed().count(),
            pending: file.pending_count(),
            tokens_used: self.tokens_used,
            elapsed_ms: millis(self.started.elapsed()),
        }
    }

    pub fn finish(
        self,
        file: &TaskFile,
        stop_reason: StopReason,
        error: Option<String>,
    ) -> RunResult {
        RunResult {
            task_file: file.path.display().to_string(),
            total_tasks: file.total_count(),
            completed: self.completed,
            failed: self.failed,
            skipped: self.skipped.len(),
            decomposed: self.decomposed,
            auto_completed: self.auto_completed,
            completed_all: file.all_checked(),
            stop_reason,
            error,
            iterations: self.iterations,
            attempts: self.attempts,
            preflight: self.preflight,
            duration_ms: millis(self.started.elapsed()),
            tokens_used: self.tokens_used,
            commits: self.commits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::parse_task_text;
    use std::path::PathBuf;

    #[test]
    fn generations_accumulate_through_decomposition() {
        let file = parse_task_text(&PathBuf::from("TASKS.md"), "- [ ] a\n").expect("parse");
        let mut state = RunState::new(&file);
        let root = TaskKey::new("root");
        let child = TaskKey::new("child");
        let grandchild = TaskKey::new("grandchild");
        assert_eq!(state.generation(&root), 0);
        state.record_children(&root, std::slice::from_ref(&child));
        state.record_children(&child, std::slice::from_ref(&grandchild));
        assert_eq!(state.generation(&child), 1);
        assert_eq!(state.generation(&grandchild), 2);
    }

    #[test]
    fn finish_reports_completion_from_the_file() {
        let file =
            parse_task_text(&PathBuf::from("TASKS.md"), "- [x] a\n- [ ] b\n").expect("parse");
        let mut state = RunState::new(&file);
        state.skipped.insert(file.tasks[1].key.clone());
        let result = state.finish(&file, StopReason::AllDone, None);
        assert!(!result.completed_all);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.total_tasks, 2);
    }
}
