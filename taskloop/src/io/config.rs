//! Run configuration stored as TOML (default `.taskloop/config.toml`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::budget::Budgets;

/// Fully resolved configuration for one run.
///
/// This file is intended to be edited by humans. Missing fields default to
/// values that suit an unattended overnight run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunConfig {
    /// Retries after the first attempt before a task is given up on.
    pub max_retries_per_task: u32,

    /// Per-attempt wall-clock budget in seconds (agent call only).
    pub task_timeout_secs: u64,

    /// Tool-loop turn ceiling handed to each agent session.
    pub max_agent_turns: Option<u32>,

    /// Global attempt budget across all tasks.
    pub max_iterations: Option<u32>,

    /// Global wall-clock budget in seconds.
    pub total_timeout_secs: Option<u64>,

    /// Global token budget across agent calls.
    pub max_total_tokens: Option<u64>,

    /// Consecutive attempts with the same failure signature before giving up.
    pub max_identical_failures: u32,

    /// Safety ceiling on the number of tasks in the file.
    pub max_total_tasks: usize,

    /// Skip a task whose retries are exhausted instead of stopping the run.
    pub skip_on_fail: bool,

    /// Discard a failed attempt's working-tree changes before retrying.
    pub rollback_on_fail: bool,

    /// Commit after every passing task.
    pub auto_commit: bool,

    pub commit_prefix: String,

    /// Interval between heartbeat progress events; 0 disables them.
    pub heartbeat_secs: u64,

    pub decompose: DecomposeConfig,
    pub verify: VerifyConfig,
    pub prompt: PromptConfig,
    pub preflight: PreflightConfig,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DecomposeConfig {
    pub enabled: bool,
    /// Maximum generations of decomposition below an authored task.
    pub max_depth: u32,
    /// Children beyond this count are dropped from a decomposition request.
    pub max_children: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerifyConfig {
    pub build: bool,
    pub test: bool,
    pub lint: bool,
    pub build_command: Option<String>,
    pub test_command: Option<String>,
    pub lint_command: Option<String>,
    pub lint_fix_command: Option<String>,
    pub command_timeout_secs: u64,
    pub lint_autofix: bool,
    /// Capture the lint error count before the first attempt and tolerate it.
    pub lint_baseline: bool,
    pub ai_review: bool,
    pub review_timeout_secs: u64,
    pub max_diff_chars: usize,
    /// Truncate captured command output beyond this many bytes per stream.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PromptConfig {
    pub max_context_tokens: usize,
    pub memory_excerpts: usize,
    pub max_excerpt_chars: usize,
    pub memory_timeout_ms: u64,
    pub retry_context_chars: usize,
    /// Markdown notes recalled into prompts, relative to the project root.
    pub memory_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PreflightConfig {
    pub enabled: bool,
    pub requirements_review: bool,
    pub review_max_rounds: u32,
    /// Plan directory, relative to the project root.
    pub plan_dir: PathBuf,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Command that receives the prompt on stdin (e.g. `["codex","exec","-"]`).
    pub command: Vec<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_retries_per_task: 3,
            task_timeout_secs: 30 * 60,
            max_agent_turns: None,
            max_iterations: None,
            total_timeout_secs: None,
            max_total_tokens: None,
            max_identical_failures: 3,
            max_total_tasks: 500,
            skip_on_fail: true,
            rollback_on_fail: true,
            auto_commit: true,
            commit_prefix: "taskloop: ".to_string(),
            heartbeat_secs: 30,
            decompose: DecomposeConfig::default(),
            verify: VerifyConfig::default(),
            prompt: PromptConfig::default(),
            preflight: PreflightConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

impl Default for DecomposeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_depth: 2,
            max_children: 8,
        }
    }
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            build: true,
            test: true,
            lint: true,
            build_command: None,
            test_command: None,
            lint_command: None,
            lint_fix_command: None,
            command_timeout_secs: 10 * 60,
            lint_autofix: true,
            lint_baseline: true,
            ai_review: false,
            review_timeout_secs: 5 * 60,
            max_diff_chars: 60_000,
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 32_000,
            memory_excerpts: 5,
            max_excerpt_chars: 1_200,
            memory_timeout_ms: 2_000,
            retry_context_chars: 6_000,
            memory_dir: PathBuf::from(".taskloop/memory"),
        }
    }
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requirements_review: false,
            review_max_rounds: 2,
            plan_dir: PathBuf::from(".taskloop/plans"),
            timeout_secs: 10 * 60,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec!["codex".to_string(), "exec".to_string(), "-".to_string()],
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.task_timeout_secs == 0 {
            return Err(anyhow!("task_timeout_secs must be > 0"));
        }
        if self.max_identical_failures == 0 {
            return Err(anyhow!("max_identical_failures must be > 0"));
        }
        if self.max_total_tasks == 0 {
            return Err(anyhow!("max_total_tasks must be > 0"));
        }
        if self.decompose.max_children == 0 {
            return Err(anyhow!("decompose.max_children must be > 0"));
        }
        if self.verify.command_timeout_secs == 0 {
            return Err(anyhow!("verify.command_timeout_secs must be > 0"));
        }
        if self.verify.review_timeout_secs == 0 {
            return Err(anyhow!("verify.review_timeout_secs must be > 0"));
        }
        if self.verify.output_limit_bytes == 0 {
            return Err(anyhow!("verify.output_limit_bytes must be > 0"));
        }
        if self.prompt.max_context_tokens == 0 {
            return Err(anyhow!("prompt.max_context_tokens must be > 0"));
        }
        if self.preflight.timeout_secs == 0 {
            return Err(anyhow!("preflight.timeout_secs must be > 0"));
        }
        if self.prompt.memory_dir.is_absolute() {
            return Err(anyhow!("prompt.memory_dir must be relative to the project"));
        }
        if self.preflight.plan_dir.is_absolute() {
            return Err(anyhow!("preflight.plan_dir must be relative to the project"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        Ok(())
    }

    /// Total attempts allowed per task.
    pub fn max_attempts_per_task(&self) -> u32 {
        self.max_retries_per_task.saturating_add(1)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn budgets(&self) -> Budgets {
        Budgets {
            max_iterations: self.max_iterations,
            total_timeout: self.total_timeout_secs.map(Duration::from_secs),
            max_total_tokens: self.max_total_tokens,
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunConfig> {
    if !path.exists() {
        let cfg = RunConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
