//! The attempt loop for a single task.

use std::time::Instant;

use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::controller::Controller;
use crate::controller::state::RunState;
use crate::core::signature::{RepeatTracker, failure_signature};
use crate::core::task::{Task, TaskFile};
use crate::core::types::{
    AgentStatus, Attempt, AttemptStatus, ParsedResult, StopReason, VerificationResult,
};
use crate::io::agent::{AskOutcome, SessionOptions, SessionPurpose, ask_bounded};
use crate::io::process::millis;
use crate::io::progress::{Heartbeat, TaskStarted};
use crate::io::task_store;
use crate::prompt::result::parse_result;
use crate::prompt::{DecomposeHint, PlanRef, PromptRequest, build_prompt};
use crate::verify::{Verifier, VerifyInput};

/// Subject line limit for commit messages.
const COMMIT_SUBJECT_CHARS: usize = 72;

/// How working on one task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum TaskOutcome {
    Passed,
    Decomposed,
    /// Retries exhausted with `skip_on_fail`; the run continues.
    Skipped,
    Stop {
        reason: StopReason,
        error: Option<String>,
    },
}

/// Result of a single attempt before it is recorded.
enum Step {
    Passed {
        verification: VerificationResult,
        commit: Option<String>,
    },
    Decomposed {
        children: usize,
    },
    Failed {
        status: AttemptStatus,
        verification: Option<VerificationResult>,
        failure: String,
    },
    Aborted,
    Fatal(String),
}

impl Controller {
    /// Attempt `task` until it passes, decomposes or runs out of retries.
    #[instrument(skip_all, fields(key = %task.key, line = task.line))]
    pub(super) async fn work_task(
        &self,
        state: &mut RunState,
        file: &mut TaskFile,
        task: &Task,
        verifier: &Verifier,
        beat: &watch::Sender<Heartbeat>,
    ) -> TaskOutcome {
        let max_attempts = self.config.max_attempts_per_task();
        let budgets = self.config.budgets();
        let mut repeats = RepeatTracker::default();
        let mut retry_context: Option<String> = None;

        for attempt in 1..=max_attempts {
            if self.abort.is_cancelled() {
                return TaskOutcome::Stop {
                    reason: StopReason::Abort,
                    error: None,
                };
            }
            if let Some(reason) = budgets.exhausted(&state.usage()) {
                return TaskOutcome::Stop { reason, error: None };
            }
            state.iterations += 1;
            let iteration = state.iterations;
            self.deps.progress.task_started(&TaskStarted {
                key: task.key.clone(),
                text: task.text.clone(),
                phase: task.phase_label(),
                attempt,
                max_attempts,
                iteration,
            });
            beat.send_replace(state.heartbeat(file, Some(&task.text)));

            let started = Instant::now();
            let (step, tokens_used) = self
                .attempt_once(state, file, task, retry_context.as_deref(), verifier)
                .await;
            let mut record = Attempt {
                task_key: task.key.clone(),
                task_text: task.text.clone(),
                attempt,
                iteration,
                duration_ms: millis(started.elapsed()),
                tokens_used,
                status: AttemptStatus::Passed,
                verification: None,
                error: None,
                commit: None,
            };

            let failure = match step {
                Step::Passed {
                    verification,
                    commit,
                } => {
                    record.verification = Some(verification);
                    record.commit = commit;
                    self.finish_attempt(state, record);
                    return TaskOutcome::Passed;
                }
                Step::Decomposed { children } => {
                    record.status = AttemptStatus::Decomposed;
                    self.deps.progress.stage(&format!(
                        "Decomposed '{}' into {children} subtask(s)",
                        task.text
                    ));
                    self.finish_attempt(state, record);
                    return TaskOutcome::Decomposed;
                }
                Step::Aborted => {
                    record.status = AttemptStatus::Aborted;
                    record.error = Some("run aborted before the attempt finished".to_string());
                    self.finish_attempt(state, record);
                    return TaskOutcome::Stop {
                        reason: StopReason::Abort,
                        error: None,
                    };
                }
                Step::Fatal(message) => {
                    record.status = AttemptStatus::Error;
                    record.error = Some(message.clone());
                    self.finish_attempt(state, record);
                    return TaskOutcome::Stop {
                        reason: StopReason::FatalError,
                        error: Some(message),
                    };
                }
                Step::Failed {
                    status,
                    verification,
                    failure,
                } => {
                    record.status = status;
                    record.verification = verification;
                    failure
                }
            };

            let streak = repeats.record(&failure_signature(&failure));
            let repeated = streak >= self.config.max_identical_failures;
            let last = attempt == max_attempts || repeated;
            if last && self.config.skip_on_fail {
                record.error = Some(format!(
                    "skipped after {} ({}): {failure}",
                    record.status.as_str(),
                    give_up_reason(attempt, streak, repeated)
                ));
                record.status = AttemptStatus::Skipped;
            } else {
                record.error = Some(failure.clone());
            }
            let status = record.status;
            self.finish_attempt(state, record);

            if last {
                state.failed += 1;
                let reason = give_up_reason(attempt, streak, repeated);
                if self.config.skip_on_fail {
                    info!(reason = %reason, "skipping task");
                    state.skipped.insert(task.key.clone());
                    self.deps.progress.task_skipped(task, &reason);
                    return TaskOutcome::Skipped;
                }
                return TaskOutcome::Stop {
                    reason: StopReason::FatalError,
                    error: Some(format!("task '{}' failed ({reason}): {failure}", task.text)),
                };
            }
            retry_context = Some(retry_notes(
                attempt,
                status,
                &failure,
                self.config.prompt.retry_context_chars,
            ));
        }
        // `max_attempts` is at least 1, so the loop always returns.
        TaskOutcome::Skipped
    }

    fn finish_attempt(&self, state: &mut RunState, record: Attempt) {
        debug!(status = record.status.as_str(), attempt = record.attempt, "attempt recorded");
        self.deps.progress.task_finished(&record);
        state.attempts.push(record);
    }

    async fn attempt_once(
        &self,
        state: &mut RunState,
        file: &mut TaskFile,
        task: &Task,
        retry_context: Option<&str>,
        verifier: &Verifier,
    ) -> (Step, u64) {
        let before = self.changed_files().await;
        let decompose = self.decompose_hint(state, task);
        let prompt = {
            let plan = state.plans.get(&task.key).map(|p| PlanRef {
                path: &p.path,
                content: &p.content,
            });
            let request = PromptRequest {
                task,
                file: &*file,
                config: &self.config.prompt,
                retry_context,
                plan,
                decompose,
            };
            build_prompt(&request, self.deps.memory.as_deref()).await
        };
        let prompt = match prompt {
            Ok(prompt) => prompt,
            Err(err) => return (Step::Fatal(format!("render prompt: {err:#}")), 0),
        };

        let options = SessionOptions {
            workdir: self.root.clone(),
            purpose: SessionPurpose::Implement,
            max_turns: self.config.max_agent_turns,
        };
        let mut session = match self.deps.sessions.create(options).await {
            Ok(session) => session,
            Err(err) => {
                return (
                    Step::Failed {
                        status: AttemptStatus::Error,
                        verification: None,
                        failure: format!("create agent session: {err:#}"),
                    },
                    0,
                );
            }
        };
        let timeout = self.config.task_timeout();
        let reply = match ask_bounded(session.as_mut(), &prompt, timeout, &self.abort).await {
            AskOutcome::Reply(reply) => reply,
            AskOutcome::Failed(err) => {
                self.rollback(&before).await;
                return (
                    Step::Failed {
                        status: AttemptStatus::Error,
                        verification: None,
                        failure: format!("agent error: {err:#}"),
                    },
                    0,
                );
            }
            AskOutcome::TimedOut => {
                self.rollback(&before).await;
                return (
                    Step::Failed {
                        status: AttemptStatus::Timeout,
                        verification: None,
                        failure: format!("agent timed out after {}s", timeout.as_secs()),
                    },
                    0,
                );
            }
            AskOutcome::Aborted => return (Step::Aborted, 0),
        };
        drop(session);

        let mut tokens = reply.tokens_used;
        state.tokens_used += reply.tokens_used;
        for notice in &reply.notices {
            self.deps.progress.agent_notice(&task.key, notice);
        }
        let parsed = parse_result(&reply.text);

        if parsed.status == AgentStatus::Decompose
            && let Some(hint) = decompose
        {
            let children: Vec<String> = parsed
                .subtasks
                .iter()
                .take(hint.max_children)
                .cloned()
                .collect();
            return match task_store::insert_children(&self.task_file, task, &children) {
                Ok((updated, keys)) => {
                    state.record_children(&task.key, &keys);
                    state.decomposed += 1;
                    state.observe(&updated);
                    *file = updated;
                    (Step::Decomposed { children: keys.len() }, tokens)
                }
                Err(err) => (Step::Fatal(format!("insert subtasks: {err:#}")), tokens),
            };
        }

        let after = self.changed_files().await;
        let changed = newly_changed(&before, &after);
        let outcome = verifier
            .verify(
                VerifyInput {
                    parsed: &parsed,
                    task_text: &task.text,
                    changed_files: &changed,
                },
                &self.abort,
            )
            .await;
        tokens += outcome.tokens_used;
        state.tokens_used += outcome.tokens_used;
        self.deps.progress.verification(&task.key, &outcome.result);
        if outcome.aborted {
            return (Step::Aborted, tokens);
        }

        if !outcome.result.passed {
            self.rollback(&before).await;
            let status = if parsed.status == AgentStatus::Blocked {
                AttemptStatus::Blocked
            } else {
                AttemptStatus::Failed
            };
            let failure = failure_text(&parsed, &outcome.result);
            return (
                Step::Failed {
                    status,
                    verification: Some(outcome.result),
                    failure,
                },
                tokens,
            );
        }

        match task_store::set_checked(&self.task_file, task, true) {
            Ok(updated) => {
                state.observe(&updated);
                *file = updated;
            }
            Err(err) => return (Step::Fatal(format!("check off task: {err:#}")), tokens),
        }
        state.completed += 1;
        let commit = self.commit(state, task).await;
        (
            Step::Passed {
                verification: outcome.result,
                commit,
            },
            tokens,
        )
    }

    fn decompose_hint(&self, state: &RunState, task: &Task) -> Option<DecomposeHint> {
        let config = &self.config.decompose;
        let generation = state.generation(&task.key);
        (config.enabled && generation < config.max_depth).then(|| DecomposeHint {
            max_depth: config.max_depth,
            remaining: config.max_depth - generation,
            max_children: config.max_children,
        })
    }

    async fn changed_files(&self) -> Vec<String> {
        let Some(vcs) = self.deps.vcs.clone() else {
            return Vec::new();
        };
        match crate::io::blocking(move || vcs.changed_files()).await {
            Ok(files) => files,
            Err(err) => {
                warn!(err = %err, "listing changed files failed");
                Vec::new()
            }
        }
    }

    /// Discard files this attempt changed, never the task file.
    async fn rollback(&self, before: &[String]) {
        if !self.config.rollback_on_fail {
            return;
        }
        let Some(vcs) = self.deps.vcs.clone() else {
            return;
        };
        let after = self.changed_files().await;
        let paths: Vec<String> = newly_changed(before, &after)
            .into_iter()
            .filter(|path| Some(path.as_str()) != self.task_rel.as_deref())
            .collect();
        if paths.is_empty() {
            return;
        }
        let count = paths.len();
        match crate::io::blocking(move || vcs.discard_paths(&paths)).await {
            Ok(()) => self
                .deps
                .progress
                .stage(&format!("Rolled back {count} file(s) changed by the failed attempt")),
            Err(err) => warn!(err = %err, "rollback failed"),
        }
    }

    async fn commit(&self, state: &mut RunState, task: &Task) -> Option<String> {
        if !self.config.auto_commit {
            return None;
        }
        let vcs = self.deps.vcs.clone()?;
        let message = commit_message(&self.config.commit_prefix, &task.text);
        match crate::io::blocking(move || vcs.commit_all(&message)).await {
            Ok(Some(hash)) => {
                state.commits += 1;
                info!(commit = %hash, "task committed");
                Some(hash)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(err = %err, "commit failed");
                self.deps
                    .progress
                    .stage(&format!("Commit for '{}' failed: {err:#}", task.text));
                None
            }
        }
    }
}

/// Paths in `after` that were not already changed in `before`.
fn newly_changed(before: &[String], after: &[String]) -> Vec<String> {
    after
        .iter()
        .filter(|path| !before.contains(path))
        .cloned()
        .collect()
}

fn failure_text(parsed: &ParsedResult, result: &VerificationResult) -> String {
    let mut parts = vec![result.summary.clone()];
    if !result.l0 {
        if let Some(reason) = &parsed.reason {
            parts.push(reason.clone());
        }
    } else if !result.raw_output.trim().is_empty() {
        parts.push(result.raw_output.clone());
    } else if let Some(reason) = &result.l2_reason {
        parts.push(reason.clone());
    }
    parts.join("\n")
}

fn give_up_reason(attempt: u32, streak: u32, repeated: bool) -> String {
    if repeated {
        format!("same failure {streak} times in a row")
    } else {
        format!("{attempt} attempt(s) exhausted")
    }
}

/// Context handed to the next attempt, keeping the tail of long output.
fn retry_notes(attempt: u32, status: AttemptStatus, failure: &str, limit: usize) -> String {
    let count = failure.chars().count();
    let body = if count > limit {
        let tail: String = failure.chars().skip(count - limit).collect();
        format!("[earlier output truncated]\n{tail}")
    } else {
        failure.to_string()
    };
    format!("Attempt {attempt} ended with status `{}`.\n\n{body}", status.as_str())
}

fn commit_message(prefix: &str, text: &str) -> String {
    let subject = format!("{prefix}{}", text.lines().next().unwrap_or_default().trim());
    if subject.chars().count() <= COMMIT_SUBJECT_CHARS {
        return subject;
    }
    let cut: String = subject.chars().take(COMMIT_SUBJECT_CHARS - 3).collect();
    format!("{}...", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_subject_is_prefixed_and_bounded() {
        assert_eq!(commit_message("taskloop: ", "Add parser"), "taskloop: Add parser");
        let long = commit_message("taskloop: ", &"word ".repeat(40));
        assert_eq!(long.chars().count(), COMMIT_SUBJECT_CHARS);
        assert!(long.ends_with("..."));
    }

    #[test]
    fn retry_notes_keep_the_tail() {
        let failure = format!("{}END", "x".repeat(100));
        let notes = retry_notes(2, AttemptStatus::Failed, &failure, 10);
        assert!(notes.starts_with("Attempt 2 ended with status `failed`."));
        assert!(notes.contains("[earlier output truncated]\nxxxxxxxEND"));
    }

    #[test]
    fn newly_changed_ignores_preexisting_dirt() {
        let before = vec!["notes.md".to_string()];
        let after = vec!["notes.md".to_string(), "src/lib.rs".to_string()];
        assert_eq!(newly_changed(&before, &after), vec!["src/lib.rs".to_string()]);
    }

    #[test]
    fn failure_text_prefers_agent_reason_when_l0_fails() {
        let parsed = ParsedResult::blocked("needs an API key");
        let result = VerificationResult::agent_rejected(AgentStatus::Blocked);
        assert_eq!(
            failure_text(&parsed, &result),
            "Agent reported status: blocked\nneeds an API key"
        );
    }
}
