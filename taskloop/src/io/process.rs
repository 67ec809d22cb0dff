//! Shell command execution with timeouts and bounded output.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// One shell command to run in a working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub command: String,
    pub workdir: PathBuf,
    pub timeout: Duration,
}

/// Exit status and captured output of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// `None` when the process was killed by a signal (including on timeout).
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// stdout and stderr joined, for reports and lint counting.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (true, true) => String::new(),
            (false, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

/// Runs arbitrary shell commands for the verifier.
pub trait CommandRunner: Send + Sync {
    fn run(&self, request: &CommandRequest) -> Result<CommandOutcome>;
}

/// Runs commands through `sh -c`.
#[derive(Debug, Clone)]
pub struct ShellCommandRunner {
    output_limit_bytes: usize,
}

impl ShellCommandRunner {
    pub fn new(output_limit_bytes: usize) -> Self {
        Self { output_limit_bytes }
    }
}

impl CommandRunner for ShellCommandRunner {
    #[instrument(skip_all, fields(command = %request.command))]
    fn run(&self, request: &CommandRequest) -> Result<CommandOutcome> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&request.command)
            .current_dir(&request.workdir);
        let started = Instant::now();
        let output =
            run_command_with_timeout(cmd, None, request.timeout, self.output_limit_bytes)
                .with_context(|| format!("run `{}`", request.command))?;
        let mut stdout = String::from_utf8_lossy(&output.stdout).to_string();
        stdout.push_str(&output.stdout_truncated_notice("command"));
        let mut stderr = String::from_utf8_lossy(&output.stderr).to_string();
        stderr.push_str(&output.stderr_truncated_notice("command"));
        Ok(CommandOutcome {
            exit_code: output.status.code(),
            stdout,
            stderr,
            timed_out: output.timed_out,
            duration_ms: millis(started.elapsed()),
        })
    }
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        truncated_notice(label, "stdout", self.stdout_truncated)
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        truncated_notice(label, "stderr", self.stderr_truncated)
    }
}

fn truncated_notice(label: &str, stream: &str, bytes: usize) -> String {
    if bytes > 0 {
        format!("\n[{label} {stream} truncated {bytes} bytes]\n")
    } else {
        String::new()
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        child_stdin.write_all(input).context("write stdin")?;
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            kill_process_tree(&mut child)?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// Kill the child and everything it spawned, so no grandchild keeps the
/// output pipes open.
fn kill_process_tree(child: &mut Child) -> Result<()> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    let mut tree = vec![Pid::from_u32(child.id())];
    let mut next = 0;
    while let Some(&parent) = tree.get(next) {
        for (pid, process) in system.processes() {
            if process.parent() == Some(parent) && !tree.contains(pid) {
                tree.push(*pid);
            }
        }
        next += 1;
    }
    // Descendants first; the child itself goes through `Child::kill` below.
    for pid in tree.iter().skip(1) {
        if let Some(process) = system.process(*pid)
            && !process.kill()
        {
            warn!(pid = pid.as_u32(), "failed to kill descendant process");
        }
    }
    debug!(descendants = tree.len() - 1, "killing command process tree");
    child.kill().context("kill command")
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(command: &str, timeout: Duration) -> CommandRequest {
        CommandRequest {
            command: command.to_string(),
            workdir: std::env::temp_dir(),
            timeout,
        }
    }

    #[test]
    fn captures_exit_code_and_streams() {
        let runner = ShellCommandRunner::new(10_000);
        let out = runner
            .run(&request("echo out; echo err >&2; exit 3", Duration::from_secs(10)))
            .expect("run");
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.success());
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert_eq!(out.combined().lines().count(), 2);
    }

    #[test]
    fn kills_on_timeout() {
        let runner = ShellCommandRunner::new(10_000);
        let out = runner
            .run(&request("sleep 5", Duration::from_millis(100)))
            .expect("run");
        assert!(out.timed_out);
        assert!(!out.success());
        assert!(out.duration_ms < 5_000);
    }

    #[test]
    fn timeout_kills_grandchildren_holding_the_pipes() {
        let runner = ShellCommandRunner::new(10_000);
        let out = runner
            .run(&request("sleep 5 | cat; echo never", Duration::from_millis(100)))
            .expect("run");
        assert!(out.timed_out);
        assert!(out.duration_ms < 4_000);
        assert!(!out.stdout.contains("never"));
    }

    #[test]
    fn truncates_large_output() {
        let runner = ShellCommandRunner::new(16);
        let out = runner
            .run(&request(
                "printf '%0100d' 0",
                Duration::from_secs(10),
            ))
            .expect("run");
        assert!(out.success());
        assert!(out.stdout.contains("[command stdout truncated 84 bytes]"));
    }
}
