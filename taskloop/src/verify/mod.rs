//! Verification cascade run after every attempt.
//!
//! - L0: the agent must report `done`.
//! - L1: every configured build/test/lint command must exit 0 (lint may be
//!   autofixed once and tolerates a pre-run baseline).
//! - L2: optional AI review of the diff, only after L0 and L1 pass.

pub mod commands;
pub mod lint;
pub mod review;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{AgentStatus, CheckState, ParsedResult, VerificationResult};
use crate::io::agent::{
    AgentSessionFactory, AskOutcome, SessionOptions, SessionPurpose, ask_bounded,
};
use crate::io::config::VerifyConfig;
use crate::io::git::VersionControl;
use crate::io::process::{CommandOutcome, CommandRequest, CommandRunner, millis};
use crate::prompt::render_code_review;

use self::commands::{ResolvedCommands, resolve_commands};
use self::lint::{LintBaseline, delta_lines, error_lines, fix_command_line, fix_targets};
use self::review::parse_review;

/// Lines of failing command output kept for retry context.
const FAILURE_TAIL_LINES: usize = 80;

/// What the controller hands the verifier for one attempt.
#[derive(Debug, Clone, Copy)]
pub struct VerifyInput<'a> {
    pub parsed: &'a ParsedResult,
    pub task_text: &'a str,
    /// Files changed by this attempt, for the lint autofix pass.
    pub changed_files: &'a [String],
}

/// Verification result plus tokens the review session consumed.
#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    pub result: VerificationResult,
    pub tokens_used: u64,
    /// The run was aborted while the review was in flight; `result.passed` is false.
    pub aborted: bool,
}

/// How the L2 review ended.
enum ReviewRun {
    Finished {
        state: CheckState,
        reason: Option<String>,
        tokens: u64,
    },
    Aborted,
}

impl ReviewRun {
    fn skipped(reason: impl Into<Option<String>>) -> Self {
        Self::Finished {
            state: CheckState::NotConfigured,
            reason: reason.into(),
            tokens: 0,
        }
    }
}

/// Collaborators for the L2 review.
#[derive(Clone)]
pub struct ReviewSetup {
    pub factory: Arc<dyn AgentSessionFactory>,
    pub vcs: Arc<dyn VersionControl>,
}

pub struct Verifier {
    root: PathBuf,
    config: VerifyConfig,
    commands: ResolvedCommands,
    runner: Arc<dyn CommandRunner>,
    review: Option<ReviewSetup>,
    baseline: Option<LintBaseline>,
}

struct CheckRun {
    state: CheckState,
    report: String,
}

impl Verifier {
    /// Resolve commands for `root` once; they stay fixed for the run.
    pub fn new(
        root: impl Into<PathBuf>,
        config: VerifyConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let root = root.into();
        let commands = resolve_commands(&root, &config);
        Self {
            root,
            config,
            commands,
            runner,
            review: None,
            baseline: None,
        }
    }

    pub fn with_review(mut self, review: ReviewSetup) -> Self {
        self.review = Some(review);
        self
    }

    pub fn baseline(&self) -> Option<&LintBaseline> {
        self.baseline.as_ref()
    }

    /// Record the lint error count before any attempt runs.
    #[instrument(skip_all)]
    pub async fn capture_baseline(&mut self) {
        if !self.config.lint_baseline {
            return;
        }
        let Some(lint) = self.commands.lint.clone() else {
            return;
        };
        match self.run(&lint.command).await {
            Ok(out) => {
                let baseline = LintBaseline::from_output(&out.combined(), out.success());
                info!(errors = baseline.error_count, "lint baseline captured");
                self.baseline = Some(baseline);
            }
            Err(err) => warn!(err = %err, "lint baseline failed, running without one"),
        }
    }

    /// Run the cascade for one attempt.
    #[instrument(skip_all, fields(status = input.parsed.status.as_str()))]
    pub async fn verify(&self, input: VerifyInput<'_>, abort: &CancellationToken) -> VerifyOutcome {
        let started = Instant::now();
        if input.parsed.status != AgentStatus::Done {
            let mut result = VerificationResult::agent_rejected(input.parsed.status);
            if let Some(reason) = &input.parsed.reason {
                result.raw_output = reason.clone();
            }
            return VerifyOutcome {
                result,
                tokens_used: 0,
                aborted: false,
            };
        }

        let build = self
            .run_check("build", self.commands.build.as_ref().map(|c| c.command.as_str()))
            .await;
        let test = self
            .run_check("test", self.commands.test.as_ref().map(|c| c.command.as_str()))
            .await;
        let (lint, lint_delta) = self.run_lint(input.changed_files).await;

        let mut result = VerificationResult {
            l0: true,
            l1_build: build.state,
            l1_test: test.state,
            l1_lint: lint.state,
            l2_ai: CheckState::NotConfigured,
            l2_reason: None,
            passed: false,
            summary: String::new(),
            raw_output: String::new(),
            lint_delta,
            duration_ms: 0,
        };
        let reports: Vec<&str> = [&build, &test, &lint]
            .iter()
            .filter(|c| c.state == CheckState::Fail)
            .map(|c| c.report.as_str())
            .collect();
        result.raw_output = bound(&reports.join("\n\n"), self.config.output_limit_bytes);

        let mut tokens_used = 0;
        let mut aborted = false;
        if result.l1_passed() {
            match self.run_review(input.task_text, abort).await {
                ReviewRun::Finished {
                    state,
                    reason,
                    tokens,
                } => {
                    result.l2_ai = state;
                    result.l2_reason = reason;
                    tokens_used = tokens;
                }
                ReviewRun::Aborted => {
                    aborted = true;
                    result.l2_reason = Some("review aborted".to_string());
                }
            }
        }

        result.passed =
            !aborted && result.l0 && result.l1_passed() && result.l2_ai.allows_pass();
        result.summary = if aborted {
            "Run aborted during review".to_string()
        } else {
            summarize(&result)
        };
        result.duration_ms = millis(started.elapsed());
        debug!(passed = result.passed, summary = %result.summary, "verification finished");
        VerifyOutcome {
            result,
            tokens_used,
            aborted,
        }
    }

    async fn run_check(&self, label: &str, command: Option<&str>) -> CheckRun {
        let Some(command) = command else {
            return CheckRun {
                state: CheckState::NotConfigured,
                report: String::new(),
            };
        };
        match self.run(command).await {
            Ok(out) if out.success() => CheckRun {
                state: CheckState::Pass,
                report: String::new(),
            },
            Ok(out) => CheckRun {
                state: CheckState::Fail,
                report: failure_report(label, command, &out),
            },
            Err(err) => CheckRun {
                state: CheckState::Fail,
                report: format!("{label} failed to run `{command}`: {err:#}"),
            },
        }
    }

    /// Lint with one autofix pass and baseline tolerance. Returns the new error lines.
    async fn run_lint(&self, changed_files: &[String]) -> (CheckRun, Vec<String>) {
        let Some(lint) = self.commands.lint.as_ref().map(|c| c.command.clone()) else {
            return (
                CheckRun {
                    state: CheckState::NotConfigured,
                    report: String::new(),
                },
                Vec::new(),
            );
        };
        let mut outcome = match self.run(&lint).await {
            Ok(out) => out,
            Err(err) => {
                return (
                    CheckRun {
                        state: CheckState::Fail,
                        report: format!("lint failed to run `{lint}`: {err:#}"),
                    },
                    Vec::new(),
                );
            }
        };
        if outcome.success() {
            return (
                CheckRun {
                    state: CheckState::Pass,
                    report: String::new(),
                },
                Vec::new(),
            );
        }

        if let Some(fix) = &self.commands.lint_fix {
            let targets = fix_targets(changed_files, fix);
            if let Some(fix_line) = fix_command_line(fix, &targets) {
                debug!(files = targets.len(), "running lint autofix");
                match self.run(&fix_line).await {
                    Ok(_) => match self.run(&lint).await {
                        Ok(after) => outcome = after,
                        Err(err) => warn!(err = %err, "lint re-check failed to run"),
                    },
                    Err(err) => warn!(err = %err, "lint autofix failed to run"),
                }
                if outcome.success() {
                    return (
                        CheckRun {
                            state: CheckState::Pass,
                            report: String::new(),
                        },
                        Vec::new(),
                    );
                }
            }
        }

        let current = error_lines(&outcome.combined());
        let delta = delta_lines(self.baseline.as_ref(), &current);
        if let Some(baseline) = &self.baseline
            && baseline.tolerates(&current)
        {
            debug!(
                errors = current.len(),
                baseline = baseline.error_count,
                "lint within baseline"
            );
            return (
                CheckRun {
                    state: CheckState::Pass,
                    report: String::new(),
                },
                Vec::new(),
            );
        }

        let report = if self.baseline.is_some() && !delta.is_empty() {
            format!(
                "lint `{lint}` reported {} new error(s):\n{}",
                delta.len(),
                delta.join("\n")
            )
        } else {
            failure_report("lint", &lint, &outcome)
        };
        (
            CheckRun {
                state: CheckState::Fail,
                report,
            },
            delta,
        )
    }

    async fn run_review(&self, task_text: &str, abort: &CancellationToken) -> ReviewRun {
        if !self.config.ai_review {
            return ReviewRun::skipped(None::<String>);
        }
        let Some(setup) = &self.review else {
            return ReviewRun::skipped("no reviewer configured".to_string());
        };
        let vcs = setup.vcs.clone();
        let max_chars = self.config.max_diff_chars;
        let diff = match crate::io::blocking(move || vcs.diff_text(max_chars)).await {
            Ok(diff) => diff,
            Err(err) => {
                warn!(err = %err, "diff for review failed");
                return ReviewRun::skipped(format!("review skipped: diff failed: {err:#}"));
            }
        };
        if diff.trim().is_empty() {
            return ReviewRun::skipped("review skipped: empty diff".to_string());
        }
        let prompt = match render_code_review(task_text, &diff) {
            Ok(prompt) => prompt,
            Err(err) => return ReviewRun::skipped(format!("review skipped: {err:#}")),
        };
        let options = SessionOptions {
            workdir: self.root.clone(),
            purpose: SessionPurpose::CodeReview,
            max_turns: Some(1),
        };
        let mut session = match setup.factory.create(options).await {
            Ok(session) => session,
            Err(err) => {
                warn!(err = %err, "review session could not start");
                return ReviewRun::skipped(format!("review skipped: {err:#}"));
            }
        };
        let timeout = Duration::from_secs(self.config.review_timeout_secs);
        match ask_bounded(session.as_mut(), &prompt, timeout, abort).await {
            AskOutcome::Reply(reply) => {
                let verdict = parse_review(&reply.text);
                debug!(pass = verdict.pass, tier = ?verdict.tier, "review verdict");
                ReviewRun::Finished {
                    state: if verdict.pass {
                        CheckState::Pass
                    } else {
                        CheckState::Fail
                    },
                    reason: Some(verdict.reason),
                    tokens: reply.tokens_used,
                }
            }
            AskOutcome::Failed(err) => {
                warn!(err = %err, "review session failed, treating as skipped");
                ReviewRun::skipped(format!("review skipped: {err:#}"))
            }
            AskOutcome::TimedOut => ReviewRun::skipped(format!(
                "review skipped: timed out after {}s",
                timeout.as_secs()
            )),
            AskOutcome::Aborted => ReviewRun::Aborted,
        }
    }

    async fn run(&self, command: &str) -> anyhow::Result<CommandOutcome> {
        let request = CommandRequest {
            command: command.to_string(),
            workdir: self.root.clone(),
            timeout: Duration::from_secs(self.config.command_timeout_secs),
        };
        let runner = self.runner.clone();
        crate::io::blocking(move || runner.run(&request)).await
    }
}

fn failure_report(label: &str, command: &str, out: &CommandOutcome) -> String {
    let status = if out.timed_out {
        "timed out".to_string()
    } else {
        match out.exit_code {
            Some(code) => format!("exit {code}"),
            None => "killed".to_string(),
        }
    };
    let combined = out.combined();
    let lines: Vec<&str> = combined.lines().collect();
    let tail = lines[lines.len().saturating_sub(FAILURE_TAIL_LINES)..].join("\n");
    format!("{label} failed ({status}): `{command}`\n{tail}")
}

fn summarize(result: &VerificationResult) -> String {
    if result.passed {
        return match result.l2_ai {
            CheckState::Pass => "All checks passed, review approved".to_string(),
            _ => "All checks passed".to_string(),
        };
    }
    let mut failed = Vec::new();
    for (name, state) in [
        ("build", result.l1_build),
        ("test", result.l1_test),
        ("lint", result.l1_lint),
    ] {
        if state == CheckState::Fail {
            failed.push(name);
        }
    }
    if !failed.is_empty() {
        return format!("Failed checks: {}", failed.join(", "));
    }
    format!(
        "Review rejected: {}",
        result.l2_reason.as_deref().unwrap_or("no reason given")
    )
}

fn bound(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n[output truncated]", &text[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeVcs, ScriptedCommandRunner, ScriptedSessionFactory, hang, reply};

    fn done() -> ParsedResult {
        ParsedResult {
            status: AgentStatus::Done,
            summary: "ok".to_string(),
            reason: None,
            subtasks: Vec::new(),
        }
    }

    fn config() -> VerifyConfig {
        VerifyConfig {
            build_command: Some("build".to_string()),
            test_command: Some("test".to_string()),
            lint_command: Some("lint".to_string()),
            lint_fix_command: Some("fix {files}".to_string()),
            ..VerifyConfig::default()
        }
    }

    fn verifier(config: VerifyConfig, runner: &Arc<ScriptedCommandRunner>) -> Verifier {
        let temp = std::env::temp_dir();
        Verifier::new(temp, config, runner.clone())
    }

    async fn check(v: &Verifier, parsed: &ParsedResult) -> VerificationResult {
        v.verify(
            VerifyInput {
                parsed,
                task_text: "task",
                changed_files: &["src/lib.rs".to_string()],
            },
            &CancellationToken::new(),
        )
        .await
        .result
    }

    #[tokio::test]
    async fn non_done_status_short_circuits() {
        let runner = Arc::new(ScriptedCommandRunner::default());
        let v = verifier(config(), &runner);
        let result = check(&v, &ParsedResult::blocked("need credentials")).await;
        assert!(!result.l0);
        assert!(!result.passed);
        assert_eq!(result.summary, "Agent reported status: blocked");
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn all_commands_run_and_failures_are_reported() {
        let runner = Arc::new(ScriptedCommandRunner::default());
        runner.fail("build", "error: expected `;`");
        runner.fail("lint", "error: unused import");
        runner.fail("lint", "error: unused import");
        let v = verifier(config(), &runner);
        let result = check(&v, &done()).await;
        assert_eq!(result.l1_build, CheckState::Fail);
        assert_eq!(result.l1_test, CheckState::Pass);
        assert_eq!(result.l1_lint, CheckState::Fail);
        assert!(!result.passed);
        assert_eq!(result.summary, "Failed checks: build, lint");
        assert!(result.raw_output.contains("expected `;`"));
        assert_eq!(
            runner.calls(),
            vec!["build", "test", "lint", "fix src/lib.rs", "lint"]
        );
    }

    #[tokio::test]
    async fn autofix_then_recheck_can_pass() {
        let runner = Arc::new(ScriptedCommandRunner::default());
        runner.fail("lint", "error: formatting");
        let v = verifier(config(), &runner);
        let result = check(&v, &done()).await;
        assert_eq!(result.l1_lint, CheckState::Pass);
        assert!(result.passed);
    }

    #[tokio::test]
    async fn baseline_tolerates_preexisting_errors_only() {
        let runner = Arc::new(ScriptedCommandRunner::default());
        let old = "src/a.rs:1:1: error: old debt";
        runner.fail("lint", old);
        let mut v = verifier(
            VerifyConfig {
                lint_autofix: false,
                ..config()
            },
            &runner,
        );
        v.capture_baseline().await;
        assert_eq!(v.baseline().expect("baseline").error_count, 1);

        runner.fail("lint", old);
        let tolerated = check(&v, &done()).await;
        assert_eq!(tolerated.l1_lint, CheckState::Pass);

        runner.fail("lint", &format!("{old}\nsrc/b.rs:9:2: error: new problem"));
        let rejected = check(&v, &done()).await;
        assert_eq!(rejected.l1_lint, CheckState::Fail);
        assert_eq!(
            rejected.lint_delta,
            vec!["src/b.rs:9:2: error: new problem".to_string()]
        );
        assert!(!rejected.raw_output.contains("old debt"));
    }

    #[tokio::test]
    async fn review_runs_after_l1_and_can_reject() {
        let runner = Arc::new(ScriptedCommandRunner::default());
        let factory = Arc::new(ScriptedSessionFactory::new(vec![reply(
            r#"{"pass": false, "reason": "wrong file"}"#,
            40,
        )]));
        let vcs = Arc::new(FakeVcs::default());
        vcs.set_diff("+changed");
        let v = verifier(
            VerifyConfig {
                ai_review: true,
                ..config()
            },
            &runner,
        )
        .with_review(ReviewSetup {
            factory: factory.clone(),
            vcs,
        });
        let outcome = v
            .verify(
                VerifyInput {
                    parsed: &done(),
                    task_text: "task",
                    changed_files: &[],
                },
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome.result.l2_ai, CheckState::Fail);
        assert_eq!(outcome.result.l2_reason.as_deref(), Some("wrong file"));
        assert!(!outcome.result.passed);
        assert_eq!(outcome.tokens_used, 40);
        assert_eq!(factory.sessions_created(), 1);
    }

    #[tokio::test]
    async fn review_skipped_on_empty_diff_or_error() {
        let runner = Arc::new(ScriptedCommandRunner::default());
        let factory = Arc::new(ScriptedSessionFactory::always_error("provider down"));
        let vcs = Arc::new(FakeVcs::default());
        let v = verifier(
            VerifyConfig {
                ai_review: true,
                ..config()
            },
            &runner,
        )
        .with_review(ReviewSetup {
            factory: factory.clone(),
            vcs: vcs.clone(),
        });

        let empty = check(&v, &done()).await;
        assert_eq!(empty.l2_ai, CheckState::NotConfigured);
        assert!(empty.passed);
        assert_eq!(factory.sessions_created(), 0);

        vcs.set_diff("+x");
        let errored = check(&v, &done()).await;
        assert_eq!(errored.l2_ai, CheckState::NotConfigured);
        assert!(errored.passed);
        assert!(errored.l2_reason.expect("reason").contains("provider down"));
    }

    #[tokio::test]
    async fn aborted_review_never_passes() {
        let runner = Arc::new(ScriptedCommandRunner::default());
        let factory = Arc::new(ScriptedSessionFactory::new(vec![hang()]));
        let vcs = Arc::new(FakeVcs::default());
        vcs.set_diff("+changed");
        let v = verifier(
            VerifyConfig {
                ai_review: true,
                ..config()
            },
            &runner,
        )
        .with_review(ReviewSetup { factory, vcs });
        let abort = CancellationToken::new();
        abort.cancel();

        let outcome = v
            .verify(
                VerifyInput {
                    parsed: &done(),
                    task_text: "task",
                    changed_files: &[],
                },
                &abort,
            )
            .await;
        assert!(outcome.aborted);
        assert!(!outcome.result.passed);
        assert_eq!(outcome.result.l2_reason.as_deref(), Some("review aborted"));
    }

    #[tokio::test]
    async fn clean_baseline_does_not_excuse_unrecognized_lint_failures() {
        let runner = Arc::new(ScriptedCommandRunner::default());
        let mut v = verifier(
            VerifyConfig {
                lint_autofix: false,
                ..config()
            },
            &runner,
        );
        v.capture_baseline().await;
        assert!(v.baseline().expect("baseline").success);

        runner.fail("lint", "[warn] src/new.ts\nCode style issues found in the above file.");
        let result = check(&v, &done()).await;
        assert_eq!(result.l1_lint, CheckState::Fail);
        assert!(!result.passed);
        assert!(result.raw_output.contains("Code style issues"));
    }
}
