//! Shared types for tasks, attempts and run summaries.
//!
//! These types define stable contracts between the controller, the verifier
//! and progress consumers. They serialize to snake_case so run summaries can be
//! written as JSON by the binary.

use serde::{Deserialize, Serialize};

use crate::core::task::TaskKey;

/// Status the agent declared in its result block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Done,
    Blocked,
    Failed,
    Decompose,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Done => "done",
            AgentStatus::Blocked => "blocked",
            AgentStatus::Failed => "failed",
            AgentStatus::Decompose => "decompose",
        }
    }
}

/// Interpreted result block from one agent reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedResult {
    pub status: AgentStatus,
    pub summary: String,
    /// Diagnostic for degraded parses or the agent's own blocking reason.
    pub reason: Option<String>,
    /// Ordered child task texts when `status` is `decompose`.
    pub subtasks: Vec<String>,
}

impl ParsedResult {
    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            status: AgentStatus::Blocked,
            summary: String::new(),
            reason: Some(reason.into()),
            subtasks: Vec::new(),
        }
    }
}

/// Outcome of a single check in the cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckState {
    Pass,
    Fail,
    NotConfigured,
}

impl CheckState {
    /// True unless the check ran and failed.
    pub fn allows_pass(self) -> bool {
        self != CheckState::Fail
    }
}

/// Result of the L0/L1/L2 verification cascade for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub l0: bool,
    pub l1_build: CheckState,
    pub l1_test: CheckState,
    pub l1_lint: CheckState,
    pub l2_ai: CheckState,
    pub l2_reason: Option<String>,
    pub passed: bool,
    pub summary: String,
    /// Combined command output, bounded.
    pub raw_output: String,
    /// Lint error lines introduced by this attempt (empty when lint passed).
    pub lint_delta: Vec<String>,
    pub duration_ms: u64,
}

impl VerificationResult {
    /// Result for an attempt whose L0 check failed.
    pub fn agent_rejected(status: AgentStatus) -> Self {
        Self {
            l0: false,
            l1_build: CheckState::NotConfigured,
            l1_test: CheckState::NotConfigured,
            l1_lint: CheckState::NotConfigured,
            l2_ai: CheckState::NotConfigured,
            l2_reason: None,
            passed: false,
            summary: format!("Agent reported status: {}", status.as_str()),
            raw_output: String::new(),
            lint_delta: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn l1_passed(&self) -> bool {
        self.l1_build.allows_pass() && self.l1_test.allows_pass() && self.l1_lint.allows_pass()
    }
}

/// Terminal status of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Passed,
    Failed,
    Decomposed,
    Blocked,
    Skipped,
    Timeout,
    Error,
    Aborted,
}

impl AttemptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptStatus::Passed => "passed",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Decomposed => "decomposed",
            AttemptStatus::Blocked => "blocked",
            AttemptStatus::Skipped => "skipped",
            AttemptStatus::Timeout => "timeout",
            AttemptStatus::Error => "error",
            AttemptStatus::Aborted => "aborted",
        }
    }
}

/// Immutable record of one attempt against a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub task_key: TaskKey,
    pub task_text: String,
    /// 1-based attempt number for this task.
    pub attempt: u32,
    /// 1-based global iteration number.
    pub iteration: u32,
    pub duration_ms: u64,
    pub tokens_used: u64,
    pub status: AttemptStatus,
    pub verification: Option<VerificationResult>,
    pub error: Option<String>,
    pub commit: Option<String>,
}

/// The single condition that ended a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    AllDone,
    MaxIterations,
    TotalTimeout,
    TokenBudget,
    Abort,
    FatalError,
    TaskCeiling,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::AllDone => "all_done",
            StopReason::MaxIterations => "max_iterations",
            StopReason::TotalTimeout => "total_timeout",
            StopReason::TokenBudget => "token_budget",
            StopReason::Abort => "abort",
            StopReason::FatalError => "fatal_error",
            StopReason::TaskCeiling => "task_ceiling",
        }
    }
}

/// Outcome of the preflight stage for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreflightStatus {
    AlreadySatisfied,
    Planned,
    Reviewed,
    ReviewRejected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightRecord {
    pub task_key: TaskKey,
    pub status: PreflightStatus,
    pub plan_file: Option<String>,
    pub duration_ms: u64,
    pub tokens_used: u64,
    pub error: Option<String>,
}

/// Final summary of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub task_file: String,
    pub total_tasks: usize,
    /// Tasks checked off during this run, including auto-completed parents.
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub decomposed: usize,
    pub auto_completed: usize,
    pub completed_all: bool,
    pub stop_reason: StopReason,
    pub error: Option<String>,
    pub iterations: u32,
    pub attempts: Vec<Attempt>,
    pub preflight: Vec<PreflightRecord>,
    pub duration_ms: u64,
    pub tokens_used: u64,
    pub commits: usize,
}

impl RunResult {
    pub fn attempts_for<'a>(&'a self, key: &'a TaskKey) -> impl Iterator<Item = &'a Attempt> {
        self.attempts.iter().filter(move |a| &a.task_key == key)
    }
}
