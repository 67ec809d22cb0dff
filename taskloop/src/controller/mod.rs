//! The run loop.
//!
//! A [`Controller`] owns the resolved config and the injected collaborators.
//! [`Controller::run`] takes the machine-wide lock, parses the task file and
//! drives tasks one attempt at a time until exactly one [`StopReason`] applies.

mod preflight;
pub mod state;
mod task_runner;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::core::parser::parse_task_file;
use crate::core::selector::{completable_parents, next_task};
use crate::core::task::TaskFile;
use crate::core::types::{RunResult, StopReason};
use crate::error::RunError;
use crate::io::agent::AgentSessionFactory;
use crate::io::config::RunConfig;
use crate::io::git::VersionControl;
use crate::io::lock::LockManager;
use crate::io::memory::MemoryStore;
use crate::io::process::CommandRunner;
use crate::io::progress::{Heartbeat, ProgressSink, spawn_heartbeat};
use crate::io::task_store;
use crate::verify::{ReviewSetup, Verifier};

use self::state::RunState;
use self::task_runner::TaskOutcome;

/// Collaborators injected into the controller.
pub struct RunDeps {
    pub sessions: Arc<dyn AgentSessionFactory>,
    /// `None` disables rollback, commits and AI review.
    pub vcs: Option<Arc<dyn VersionControl>>,
    pub commands: Arc<dyn CommandRunner>,
    pub progress: Arc<dyn ProgressSink>,
    pub memory: Option<Arc<dyn MemoryStore>>,
    pub lock: LockManager,
}

pub struct Controller {
    root: PathBuf,
    task_file: PathBuf,
    /// Task file relative to `root`, as version control reports it.
    task_rel: Option<String>,
    config: RunConfig,
    deps: RunDeps,
    abort: CancellationToken,
}

impl Controller {
    /// `task_file` is resolved against `root` when relative.
    pub fn new(
        root: impl Into<PathBuf>,
        task_file: impl Into<PathBuf>,
        config: RunConfig,
        deps: RunDeps,
    ) -> Self {
        let root = root.into();
        let task_file = task_file.into();
        let task_file = if task_file.is_absolute() {
            task_file
        } else {
            root.join(task_file)
        };
        let task_rel = task_file
            .strip_prefix(&root)
            .ok()
            .map(|rel| rel.to_string_lossy().replace('\\', "/"));
        Self {
            root,
            task_file,
            task_rel,
            config,
            deps,
            abort: CancellationToken::new(),
        }
    }

    /// Use an externally owned abort token.
    pub fn with_abort(mut self, abort: CancellationToken) -> Self {
        self.abort = abort;
        self
    }

    /// Cancelling this token stops the run after the in-flight call is cancelled.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Run until a stop condition. Errors only when the run could not start.
    #[instrument(skip_all, fields(task_file = %self.task_file.display()))]
    pub async fn run(&self) -> Result<RunResult, RunError> {
        self.config
            .validate()
            .map_err(|err| RunError::Config(format!("{err:#}")))?;
        let guard = self
            .deps
            .lock
            .acquire(&self.task_file.display().to_string())?;
        let file = match parse_task_file(&self.task_file) {
            Ok(file) => file,
            Err(err) => {
                if let Err(release) = guard.release() {
                    warn!(err = %release, "lock release failed");
                }
                return Err(err.into());
            }
        };

        let result = self.run_locked(file).await;
        if let Err(err) = guard.release() {
            warn!(err = %err, "lock release failed");
        }
        info!(
            stop_reason = result.stop_reason.as_str(),
            completed = result.completed,
            iterations = result.iterations,
            "run finished"
        );
        self.deps.progress.run_completed(&result);
        Ok(result)
    }

    async fn run_locked(&self, mut file: TaskFile) -> RunResult {
        let mut state = RunState::new(&file);
        let mut verifier = Verifier::new(
            self.root.clone(),
            self.config.verify.clone(),
            self.deps.commands.clone(),
        );
        if let Some(vcs) = &self.deps.vcs {
            verifier = verifier.with_review(ReviewSetup {
                factory: self.deps.sessions.clone(),
                vcs: vcs.clone(),
            });
        }

        let (beat_tx, beat_rx) = watch::channel(state.heartbeat(&file, None));
        let stop_beat = CancellationToken::new();
        let beat_task = spawn_heartbeat(
            self.deps.progress.clone(),
            Duration::from_secs(self.config.heartbeat_secs),
            beat_rx,
            stop_beat.clone(),
        );

        if file.pending_count() > 0 {
            verifier.capture_baseline().await;
        }
        let (stop_reason, error) = self.drive(&mut state, &mut file, &verifier, &beat_tx).await;

        stop_beat.cancel();
        if let Some(handle) = beat_task
            && let Err(err) = handle.await
        {
            warn!(err = %err, "heartbeat task failed");
        }
        state.finish(&file, stop_reason, error)
    }

    async fn drive(
        &self,
        state: &mut RunState,
        file: &mut TaskFile,
        verifier: &Verifier,
        beat: &watch::Sender<Heartbeat>,
    ) -> (StopReason, Option<String>) {
        let budgets = self.config.budgets();
        loop {
            if let Err(err) = self.refresh(state, file) {
                return (StopReason::FatalError, Some(format!("{err:#}")));
            }
            if file.total_count() > self.config.max_total_tasks {
                return (
                    StopReason::TaskCeiling,
                    Some(format!(
                        "{} tasks exceed the ceiling of {}",
                        file.total_count(),
                        self.config.max_total_tasks
                    )),
                );
            }
            if let Err(err) = self.complete_parents(state, file) {
                return (StopReason::FatalError, Some(format!("{err:#}")));
            }
            beat.send_replace(state.heartbeat(file, None));
            if self.abort.is_cancelled() {
                return (StopReason::Abort, None);
            }
            let Some(task) = next_task(file, &state.skipped).cloned() else {
                return (StopReason::AllDone, None);
            };
            if let Some(reason) = budgets.exhausted(&state.usage()) {
                return (reason, None);
            }

            if self.config.preflight.enabled
                && !state.preflight.iter().any(|r| r.task_key == task.key)
                && self.preflight(state, file, &task).await
            {
                match task_store::set_checked(&self.task_file, &task, true) {
                    Ok(updated) => {
                        state.observe(&updated);
                        *file = updated;
                        state.completed += 1;
                        self.deps.progress.stage(&format!(
                            "'{}' is already satisfied, checked off without an attempt",
                            task.text
                        ));
                    }
                    Err(err) => {
                        return (StopReason::FatalError, Some(format!("check off task: {err:#}")));
                    }
                }
                continue;
            }

            match self.work_task(state, file, &task, verifier, beat).await {
                TaskOutcome::Passed | TaskOutcome::Decomposed | TaskOutcome::Skipped => {}
                TaskOutcome::Stop { reason, error } => return (reason, error),
            }
        }
    }

    /// Re-read the task file; edits made outside the run are reported, not rejected.
    fn refresh(&self, state: &mut RunState, file: &mut TaskFile) -> Result<()> {
        let fresh = task_store::reload(&self.task_file)?;
        if fresh.content_hash != state.expected_hash {
            self.deps.progress.stage(&format!(
                "{} changed outside the run, continuing with the new content",
                self.task_file.display()
            ));
        }
        state.observe(&fresh);
        *file = fresh;
        Ok(())
    }

    /// Check off every parent whose children are all checked.
    fn complete_parents(&self, state: &mut RunState, file: &mut TaskFile) -> Result<()> {
        for key in completable_parents(file) {
            let Some(task) = file.get(&key).cloned() else {
                continue;
            };
            let updated = task_store::set_checked(&self.task_file, &task, true)?;
            state.observe(&updated);
            *file = updated;
            state.auto_completed += 1;
            state.completed += 1;
            self.deps
                .progress
                .stage(&format!("Auto-completed '{}': all subtasks done", task.text));
        }
        Ok(())
    }
}
