//! Optional per-task preflight: discovery, plan bootstrap and requirements review.
//!
//! Preflight never fails a run. Problems are recorded on the task's
//! [`PreflightRecord`] and implementation proceeds without a plan.

use std::fs;
use std::path::{Component, Path};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::controller::Controller;
use crate::controller::state::{PlanFile, RunState};
use crate::core::task::{Task, TaskFile};
use crate::core::types::{PreflightRecord, PreflightStatus};
use crate::io::agent::{AgentReply, AskOutcome, SessionOptions, SessionPurpose, ask_bounded};
use crate::io::process::millis;
use crate::prompt::result::{parse_discovery, parse_plan_review};
use crate::prompt::{render_discovery, render_requirements_review};

const STUB_BODY: &str = "Discovery named this plan file but did not write it. \
    Implement the task directly and keep the change minimal.";

impl Controller {
    /// Run preflight for `task`. Returns true when discovery found it already satisfied.
    #[instrument(skip_all, fields(key = %task.key))]
    pub(super) async fn preflight(
        &self,
        state: &mut RunState,
        file: &TaskFile,
        task: &Task,
    ) -> bool {
        let started = Instant::now();
        let mut record = PreflightRecord {
            task_key: task.key.clone(),
            status: PreflightStatus::Error,
            plan_file: None,
            duration_ms: 0,
            tokens_used: 0,
            error: None,
        };
        self.deps
            .progress
            .stage(&format!("Preflight for '{}'", task.text));
        if let Err(err) = self.run_preflight(state, file, task, &mut record).await {
            warn!(err = %err, "preflight failed, continuing without it");
            record.status = PreflightStatus::Error;
            record.error = Some(format!("{err:#}"));
            self.deps
                .progress
                .stage(&format!("Preflight for '{}' failed: {err:#}", task.text));
        }
        record.duration_ms = millis(started.elapsed());
        let satisfied = record.status == PreflightStatus::AlreadySatisfied;
        debug!(status = ?record.status, "preflight finished");
        state.preflight.push(record);
        satisfied
    }

    async fn run_preflight(
        &self,
        state: &mut RunState,
        file: &TaskFile,
        task: &Task,
        record: &mut PreflightRecord,
    ) -> Result<()> {
        let default_plan = self
            .config
            .preflight
            .plan_dir
            .join(format!("{}.md", task.key))
            .display()
            .to_string();
        let prompt = render_discovery(
            task,
            file,
            &default_plan,
            self.config.prompt.max_context_tokens,
        )?;
        let reply = self.ask_preflight(SessionPurpose::Discovery, &prompt).await?;
        self.absorb(state, record, task, &reply);
        let verdict = parse_discovery(&reply.text)?;
        if verdict.satisfied {
            record.status = PreflightStatus::AlreadySatisfied;
            return Ok(());
        }

        let plan_path = match verdict.plan_file {
            Some(path) if is_project_relative(&path) => path,
            Some(path) => {
                warn!(path = %path, "plan file outside the project, using default");
                default_plan
            }
            None => default_plan,
        };
        let content = self.ensure_plan(&plan_path, task, &verdict.summary)?;
        record.plan_file = Some(plan_path.clone());
        record.status = PreflightStatus::Planned;
        state.plans.insert(
            task.key.clone(),
            PlanFile {
                path: plan_path.clone(),
                content,
            },
        );

        if !self.config.preflight.requirements_review {
            return Ok(());
        }
        record.status = PreflightStatus::ReviewRejected;
        for round in 1..=self.config.preflight.review_max_rounds {
            let current = state
                .plans
                .get(&task.key)
                .map(|p| p.content.clone())
                .unwrap_or_default();
            let prompt = render_requirements_review(task, &plan_path, &current, round)?;
            let reply = self
                .ask_preflight(SessionPurpose::RequirementsReview, &prompt)
                .await?;
            self.absorb(state, record, task, &reply);
            let verdict = parse_plan_review(&reply.text)?;
            // The reviewer edits the plan in place.
            if let Ok(revised) = fs::read_to_string(self.root.join(&plan_path))
                && let Some(plan) = state.plans.get_mut(&task.key)
            {
                plan.content = revised;
            }
            if verdict.approved {
                record.status = PreflightStatus::Reviewed;
                break;
            }
            self.deps.progress.stage(&format!(
                "Plan for '{}' needs revision (round {round}): {}",
                task.text, verdict.feedback
            ));
        }
        Ok(())
    }

    async fn ask_preflight(&self, purpose: SessionPurpose, prompt: &str) -> Result<AgentReply> {
        let options = SessionOptions {
            workdir: self.root.clone(),
            purpose,
            max_turns: self.config.max_agent_turns,
        };
        let mut session = self
            .deps
            .sessions
            .create(options)
            .await
            .with_context(|| format!("create {} session", purpose.as_str()))?;
        let timeout = Duration::from_secs(self.config.preflight.timeout_secs);
        match ask_bounded(session.as_mut(), prompt, timeout, &self.abort).await {
            AskOutcome::Reply(reply) => Ok(reply),
            AskOutcome::Failed(err) => {
                Err(err.context(format!("{} session failed", purpose.as_str())))
            }
            AskOutcome::TimedOut => Err(anyhow!(
                "{} timed out after {}s",
                purpose.as_str(),
                timeout.as_secs()
            )),
            AskOutcome::Aborted => Err(anyhow!("{} aborted", purpose.as_str())),
        }
    }

    fn absorb(
        &self,
        state: &mut RunState,
        record: &mut PreflightRecord,
        task: &Task,
        reply: &AgentReply,
    ) {
        record.tokens_used += reply.tokens_used;
        state.tokens_used += reply.tokens_used;
        for notice in &reply.notices {
            self.deps.progress.agent_notice(&task.key, notice);
        }
    }

    /// Read the plan, writing a stub first when discovery never wrote it.
    fn ensure_plan(&self, plan_path: &str, task: &Task, summary: &str) -> Result<String> {
        let path = self.root.join(plan_path);
        if let Ok(existing) = fs::read_to_string(&path)
            && !existing.trim().is_empty()
        {
            return Ok(existing);
        }
        let notes = if summary.trim().is_empty() {
            STUB_BODY
        } else {
            summary.trim()
        };
        let stub = format!("# Plan: {}\n\n{notes}\n", task.text);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create plan directory {}", parent.display()))?;
        }
        crate::io::write_atomic(&path, &stub)?;
        debug!(path = %path.display(), "plan stub written");
        Ok(stub)
    }
}

fn is_project_relative(path: &str) -> bool {
    let path = Path::new(path);
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_paths_must_stay_inside_the_project() {
        assert!(is_project_relative(".taskloop/plans/a.md"));
        assert!(is_project_relative("./plan.md"));
        assert!(!is_project_relative("/etc/passwd"));
        assert!(!is_project_relative("../outside.md"));
        assert!(!is_project_relative(""));
    }
}
