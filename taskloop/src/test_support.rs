//! Test-only collaborators: scripted agent sessions, fake version control,
//! scripted commands, a recording progress sink and scratch projects.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::controller::{Controller, RunDeps};
use crate::core::task::TaskKey;
use crate::core::types::{Attempt, AttemptStatus, RunResult, StopReason, VerificationResult};
use crate::io::agent::{
    AgentReply, AgentSession, AgentSessionFactory, SessionOptions, SessionPurpose,
};
use crate::io::config::{RunConfig, VerifyConfig};
use crate::io::git::VersionControl;
use crate::io::lock::LockManager;
use crate::io::process::{CommandOutcome, CommandRequest, CommandRunner};
use crate::io::progress::{Heartbeat, ProgressSink, TaskStarted};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

type Effect = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone)]
enum ScriptKind {
    Reply(AgentReply),
    Error(String),
    Hang,
}

/// What one scripted session does when asked.
#[derive(Clone)]
pub struct Script {
    kind: ScriptKind,
    effect: Option<Effect>,
}

impl Script {
    pub fn with_tokens(mut self, tokens: u64) -> Self {
        if let ScriptKind::Reply(reply) = &mut self.kind {
            reply.tokens_used = tokens;
        }
        self
    }

    pub fn with_notice(mut self, notice: &str) -> Self {
        if let ScriptKind::Reply(reply) = &mut self.kind {
            reply.notices.push(notice.to_string());
        }
        self
    }

    /// Run `effect` when the session is asked, before it answers.
    pub fn with_effect(mut self, effect: impl Fn() + Send + Sync + 'static) -> Self {
        self.effect = Some(Arc::new(effect));
        self
    }
}

pub fn reply(text: &str, tokens: u64) -> Script {
    Script {
        kind: ScriptKind::Reply(AgentReply {
            text: text.to_string(),
            tokens_used: tokens,
            notices: Vec::new(),
        }),
        effect: None,
    }
}

/// A reply carrying one result block.
pub fn result_block(json: &str) -> Script {
    reply(&format!("Work log...\n<task_result>{json}</task_result>\n"), 100)
}

pub fn done(summary: &str) -> Script {
    result_block(&serde_json::json!({"status": "done", "summary": summary}).to_string())
}

pub fn status(status: &str, reason: &str) -> Script {
    result_block(&serde_json::json!({"status": status, "reason": reason}).to_string())
}

pub fn decompose(subtasks: &[&str]) -> Script {
    result_block(&serde_json::json!({"status": "decompose", "subtasks": subtasks}).to_string())
}

pub fn agent_error(message: &str) -> Script {
    Script {
        kind: ScriptKind::Error(message.to_string()),
        effect: None,
    }
}

/// Never answers; only cancellation ends the call.
pub fn hang() -> Script {
    Script {
        kind: ScriptKind::Hang,
        effect: None,
    }
}

/// Hands out sessions that replay scripts in order.
pub struct ScriptedSessionFactory {
    scripts: Mutex<VecDeque<Script>>,
    fallback: Option<Script>,
    created: AtomicUsize,
    cancelled: Arc<AtomicUsize>,
    prompts: Arc<Mutex<Vec<(SessionPurpose, String)>>>,
}

impl ScriptedSessionFactory {
    /// Replays `scripts`; once they run out every ask fails.
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            fallback: None,
            created: AtomicUsize::new(0),
            cancelled: Arc::new(AtomicUsize::new(0)),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every session behaves like `script`.
    pub fn repeating(script: Script) -> Self {
        Self {
            fallback: Some(script),
            ..Self::new(Vec::new())
        }
    }

    pub fn always_done() -> Self {
        Self::repeating(done("implemented"))
    }

    pub fn always_error(message: &str) -> Self {
        Self::repeating(agent_error(message))
    }

    /// Append a script after the ones already queued.
    pub fn push(&self, script: Script) {
        lock(&self.scripts).push_back(script);
    }

    pub fn sessions_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn sessions_cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Prompts received so far, with the purpose of their session.
    pub fn prompts(&self) -> Vec<(SessionPurpose, String)> {
        lock(&self.prompts).clone()
    }

    fn next_script(&self) -> Option<Script> {
        lock(&self.scripts)
            .pop_front()
            .or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl AgentSessionFactory for ScriptedSessionFactory {
    async fn create(&self, options: SessionOptions) -> Result<Box<dyn AgentSession>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            script: self.next_script(),
            purpose: options.purpose,
            cancelled: self.cancelled.clone(),
            prompts: self.prompts.clone(),
        }))
    }
}

struct ScriptedSession {
    script: Option<Script>,
    purpose: SessionPurpose,
    cancelled: Arc<AtomicUsize>,
    prompts: Arc<Mutex<Vec<(SessionPurpose, String)>>>,
}

#[async_trait]
impl AgentSession for ScriptedSession {
    async fn ask(&mut self, prompt: &str, cancel: CancellationToken) -> Result<AgentReply> {
        lock(&self.prompts).push((self.purpose, prompt.to_string()));
        let script = self
            .script
            .take()
            .ok_or_else(|| anyhow!("no scripted reply left"))?;
        if let Some(effect) = &script.effect {
            effect();
        }
        match script.kind {
            ScriptKind::Reply(reply) => Ok(reply),
            ScriptKind::Error(message) => Err(anyhow!(message)),
            ScriptKind::Hang => {
                cancel.cancelled().await;
                Err(anyhow!("cancelled"))
            }
        }
    }

    async fn cancel(&mut self) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
    }
}

/// In-memory version control.
#[derive(Debug, Default)]
pub struct FakeVcs {
    state: Mutex<FakeVcsState>,
}

#[derive(Debug, Default, Clone)]
struct FakeVcsState {
    changed: Vec<String>,
    diff: String,
    commits: Vec<String>,
    discarded: Vec<String>,
}

impl FakeVcs {
    pub fn set_diff(&self, diff: &str) {
        lock(&self.state).diff = diff.to_string();
    }

    /// Mark `path` as modified in the working tree.
    pub fn touch(&self, path: &str) {
        let mut state = lock(&self.state);
        if !state.changed.iter().any(|p| p == path) {
            state.changed.push(path.to_string());
        }
    }

    pub fn changed(&self) -> Vec<String> {
        lock(&self.state).changed.clone()
    }

    /// Commit messages, oldest first.
    pub fn commits(&self) -> Vec<String> {
        lock(&self.state).commits.clone()
    }

    pub fn discarded(&self) -> Vec<String> {
        lock(&self.state).discarded.clone()
    }
}

impl VersionControl for FakeVcs {
    fn changed_files(&self) -> Result<Vec<String>> {
        Ok(self.changed())
    }

    fn commit_all(&self, message: &str) -> Result<Option<String>> {
        let mut state = lock(&self.state);
        state.changed.clear();
        state.commits.push(message.to_string());
        Ok(Some(format!("{:07x}", state.commits.len())))
    }

    fn discard_paths(&self, paths: &[String]) -> Result<()> {
        let mut state = lock(&self.state);
        state.changed.retain(|p| !paths.contains(p));
        state.discarded.extend(paths.iter().cloned());
        Ok(())
    }

    fn diff_text(&self, _max_chars: usize) -> Result<String> {
        Ok(lock(&self.state).diff.clone())
    }
}

/// Commands succeed with empty output unless a failure was queued for them.
#[derive(Debug, Default)]
pub struct ScriptedCommandRunner {
    queued: Mutex<HashMap<String, VecDeque<CommandOutcome>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedCommandRunner {
    /// Queue one failing run of `command` printing `output`.
    pub fn fail(&self, command: &str, output: &str) {
        lock(&self.queued)
            .entry(command.to_string())
            .or_default()
            .push_back(CommandOutcome {
                exit_code: Some(1),
                stdout: output.to_string(),
                stderr: String::new(),
                timed_out: false,
                duration_ms: 1,
            });
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }
}

impl CommandRunner for ScriptedCommandRunner {
    fn run(&self, request: &CommandRequest) -> Result<CommandOutcome> {
        lock(&self.calls).push(request.command.clone());
        let queued = lock(&self.queued)
            .get_mut(&request.command)
            .and_then(VecDeque::pop_front);
        Ok(queued.unwrap_or(CommandOutcome {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            timed_out: false,
            duration_ms: 1,
        }))
    }
}

/// One progress callback, flattened for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Started { key: TaskKey, attempt: u32 },
    Finished { key: TaskKey, status: AttemptStatus },
    Skipped { key: TaskKey, reason: String },
    Completed(StopReason),
    Heartbeat,
    Notice { key: TaskKey, notice: String },
    Verification { key: TaskKey, passed: bool },
    Stage(String),
}

#[derive(Debug, Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgress {
    pub fn events(&self) -> Vec<ProgressEvent> {
        lock(&self.events).clone()
    }

    pub fn stages(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ProgressEvent::Stage(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: ProgressEvent) {
        lock(&self.events).push(event);
    }
}

impl ProgressSink for RecordingProgress {
    fn task_started(&self, event: &TaskStarted) {
        self.push(ProgressEvent::Started {
            key: event.key.clone(),
            attempt: event.attempt,
        });
    }

    fn task_finished(&self, attempt: &Attempt) {
        self.push(ProgressEvent::Finished {
            key: attempt.task_key.clone(),
            status: attempt.status,
        });
    }

    fn task_skipped(&self, task: &crate::core::task::Task, reason: &str) {
        self.push(ProgressEvent::Skipped {
            key: task.key.clone(),
            reason: reason.to_string(),
        });
    }

    fn run_completed(&self, result: &RunResult) {
        self.push(ProgressEvent::Completed(result.stop_reason));
    }

    fn heartbeat(&self, _beat: &Heartbeat) {
        self.push(ProgressEvent::Heartbeat);
    }

    fn agent_notice(&self, key: &TaskKey, notice: &str) {
        self.push(ProgressEvent::Notice {
            key: key.clone(),
            notice: notice.to_string(),
        });
    }

    fn verification(&self, key: &TaskKey, result: &VerificationResult) {
        self.push(ProgressEvent::Verification {
            key: key.clone(),
            passed: result.passed,
        });
    }

    fn stage(&self, message: &str) {
        self.push(ProgressEvent::Stage(message.to_string()));
    }
}

/// Scratch project with a `TASKS.md` and a private lock path.
pub struct TempProject {
    dir: TempDir,
}

impl TempProject {
    pub fn new(tasks: &str) -> Self {
        let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let project = Self { dir };
        project.write("TASKS.md", tasks);
        project
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn task_file(&self) -> PathBuf {
        self.root().join("TASKS.md")
    }

    pub fn tasks(&self) -> String {
        self.read("TASKS.md")
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.root().join(rel)).unwrap_or_else(|err| panic!("read {rel}: {err}"))
    }

    pub fn write(&self, rel: &str, contents: &str) {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap_or_else(|err| panic!("mkdir {rel}: {err}"));
        }
        fs::write(&path, contents).unwrap_or_else(|err| panic!("write {rel}: {err}"));
    }

    pub fn lock_manager(&self) -> LockManager {
        LockManager::new(self.root().join(".locks").join("run.lock"))
    }
}

/// Config for tests: no heartbeat, no baseline, short timeouts.
pub fn test_config() -> RunConfig {
    RunConfig {
        task_timeout_secs: 5,
        heartbeat_secs: 0,
        verify: VerifyConfig {
            lint_baseline: false,
            command_timeout_secs: 5,
            ..VerifyConfig::default()
        },
        ..RunConfig::default()
    }
}

/// A scratch project wired to scripted collaborators.
pub struct Harness {
    pub project: TempProject,
    pub sessions: Arc<ScriptedSessionFactory>,
    pub vcs: Arc<FakeVcs>,
    pub commands: Arc<ScriptedCommandRunner>,
    pub progress: Arc<RecordingProgress>,
    pub config: RunConfig,
}

impl Harness {
    pub fn new(tasks: &str, sessions: ScriptedSessionFactory) -> Self {
        Self {
            project: TempProject::new(tasks),
            sessions: Arc::new(sessions),
            vcs: Arc::new(FakeVcs::default()),
            commands: Arc::new(ScriptedCommandRunner::default()),
            progress: Arc::new(RecordingProgress::default()),
            config: test_config(),
        }
    }

    pub fn controller(&self) -> Controller {
        let deps = RunDeps {
            sessions: self.sessions.clone(),
            vcs: Some(self.vcs.clone()),
            commands: self.commands.clone(),
            progress: self.progress.clone(),
            memory: None,
            lock: self.project.lock_manager(),
        };
        Controller::new(
            self.project.root(),
            self.project.task_file(),
            self.config.clone(),
            deps,
        )
    }

    pub async fn run(&self) -> RunResult {
        self.controller()
            .run()
            .await
            .unwrap_or_else(|err| panic!("run failed to start: {err}"))
    }
}
