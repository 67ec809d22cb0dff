//! Agent session abstraction.
//!
//! The controller never knows which model or provider sits behind a session.
//! Each attempt asks a [`AgentSessionFactory`] for a brand-new session, sends
//! exactly one prompt, and drops it. [`ask_bounded`] is the single place where
//! a call is raced against its timeout and the run's abort token.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

static TOKENS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)tokens[ _]used:?\s*\n?\s*([\d,]+)").expect("tokens regex")
});
static NOTICE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*(?:notice|warning):\s*(.+)$").expect("notice regex"));

/// What a session is used for. Lets a factory pick different settings per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPurpose {
    Implement,
    Discovery,
    RequirementsReview,
    CodeReview,
}

impl SessionPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionPurpose::Implement => "implement",
            SessionPurpose::Discovery => "discovery",
            SessionPurpose::RequirementsReview => "requirements_review",
            SessionPurpose::CodeReview => "code_review",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub workdir: PathBuf,
    pub purpose: SessionPurpose,
    /// Tool-loop turn ceiling, if the backend supports one.
    pub max_turns: Option<u32>,
}

/// One completed exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentReply {
    pub text: String,
    pub tokens_used: u64,
    /// Tool-loop and compaction notices surfaced by the backend.
    pub notices: Vec<String>,
}

/// A single-use conversation with the agent.
#[async_trait]
pub trait AgentSession: Send {
    /// Send `prompt` and wait for the final reply. Implementations should stop
    /// promptly once `cancel` fires.
    async fn ask(&mut self, prompt: &str, cancel: CancellationToken) -> Result<AgentReply>;

    /// Abandon any in-flight work. Called before the session is dropped when a
    /// call lost its race against a timeout or abort.
    async fn cancel(&mut self);
}

/// Creates fresh sessions. Injected into the controller.
#[async_trait]
pub trait AgentSessionFactory: Send + Sync {
    async fn create(&self, options: SessionOptions) -> Result<Box<dyn AgentSession>>;
}

/// How a bounded call ended.
#[derive(Debug)]
pub enum AskOutcome {
    Reply(AgentReply),
    Failed(anyhow::Error),
    TimedOut,
    Aborted,
}

/// Ask once, racing the call against `timeout` and `abort`.
///
/// A call that loses the race has its token cancelled and the session told to
/// cancel before this returns.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs()))]
pub async fn ask_bounded(
    session: &mut dyn AgentSession,
    prompt: &str,
    timeout: Duration,
    abort: &CancellationToken,
) -> AskOutcome {
    if abort.is_cancelled() {
        return AskOutcome::Aborted;
    }
    let call_token = abort.child_token();
    let outcome = {
        let call = session.ask(prompt, call_token.clone());
        tokio::select! {
            biased;
            () = abort.cancelled() => AskOutcome::Aborted,
            () = tokio::time::sleep(timeout) => AskOutcome::TimedOut,
            result = call => match result {
                Ok(reply) => AskOutcome::Reply(reply),
                Err(err) => AskOutcome::Failed(err),
            },
        }
    };
    if matches!(outcome, AskOutcome::TimedOut | AskOutcome::Aborted) {
        debug!(aborted = abort.is_cancelled(), "cancelling agent session");
        call_token.cancel();
        session.cancel().await;
    }
    outcome
}

/// Runs an agent CLI per prompt: the prompt is written to stdin and the reply
/// is whatever the process prints to stdout.
pub struct CommandSessionFactory {
    command: Vec<String>,
}

impl CommandSessionFactory {
    pub fn new(command: Vec<String>) -> Result<Self> {
        if command.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(anyhow!("agent command is empty"));
        }
        Ok(Self { command })
    }
}

#[async_trait]
impl AgentSessionFactory for CommandSessionFactory {
    async fn create(&self, options: SessionOptions) -> Result<Box<dyn AgentSession>> {
        Ok(Box::new(CommandAgentSession {
            command: self.command.clone(),
            options,
            cancelled: CancellationToken::new(),
        }))
    }
}

pub struct CommandAgentSession {
    command: Vec<String>,
    options: SessionOptions,
    cancelled: CancellationToken,
}

#[async_trait]
impl AgentSession for CommandAgentSession {
    #[instrument(skip_all, fields(purpose = self.options.purpose.as_str()))]
    async fn ask(&mut self, prompt: &str, cancel: CancellationToken) -> Result<AgentReply> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("agent command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.options.workdir)
            .env("TASKLOOP_SESSION_PURPOSE", self.options.purpose.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(turns) = self.options.max_turns {
            cmd.env("TASKLOOP_MAX_TURNS", turns.to_string());
        }

        info!(program = %program, "starting agent process");
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn agent command {program}"))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        // A process may exit without reading its input; its exit status says why.
        if let Err(err) = stdin.write_all(prompt.as_bytes()).await {
            warn!(err = %err, "agent process closed stdin early");
        }
        drop(stdin);

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;
        let stdout_task = tokio::spawn(async move {
            let mut buf = String::new();
            stdout.read_to_string(&mut buf).await.map(|_| buf)
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            stderr.read_to_string(&mut buf).await.map(|_| buf)
        });

        let status = tokio::select! {
            status = child.wait() => status.context("wait for agent process")?,
            () = cancel.cancelled() => {
                warn!("agent call cancelled, killing process");
                child.kill().await.context("kill agent process")?;
                return Err(anyhow!("agent call cancelled"));
            }
            () = self.cancelled.cancelled() => {
                child.kill().await.context("kill agent process")?;
                return Err(anyhow!("agent session cancelled"));
            }
        };

        let out = stdout_task
            .await
            .context("join stdout reader")?
            .context("read agent stdout")?;
        let err = stderr_task
            .await
            .context("join stderr reader")?
            .context("read agent stderr")?;

        if !status.success() {
            let tail: String = err.lines().rev().take(20).collect::<Vec<_>>().join("\n");
            return Err(anyhow!(
                "agent exited with {:?}: {}",
                status.code(),
                tail.trim()
            ));
        }

        let tokens_used = reported_tokens(&out, &err)
            .unwrap_or_else(|| estimate_tokens(prompt) + estimate_tokens(&out));
        let notices = NOTICE_RE
            .captures_iter(&err)
            .filter_map(|caps| caps.get(1).map(|m| m.as_str().trim().to_string()))
            .collect();
        debug!(tokens_used, bytes = out.len(), "agent reply received");
        Ok(AgentReply {
            text: out,
            tokens_used,
            notices,
        })
    }

    async fn cancel(&mut self) {
        self.cancelled.cancel();
    }
}

fn reported_tokens(stdout: &str, stderr: &str) -> Option<u64> {
    [stderr, stdout].iter().find_map(|text| {
        TOKENS_RE
            .captures_iter(text)
            .last()
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().replace(',', "").parse().ok())
    })
}

/// Rough token estimate at four characters per token.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}
