//! Progress callbacks fired by the controller.
//!
//! Every callback is advisory: nothing returns a value and the controller never
//! waits on a sink for a decision.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::task::{Task, TaskKey};
use crate::core::types::{Attempt, RunResult, VerificationResult};

/// An attempt is about to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStarted {
    pub key: TaskKey,
    pub text: String,
    pub phase: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub iteration: u32,
}

/// Periodic run snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Heartbeat {
    pub iteration: u32,
    pub current_task: Option<String>,
    pub completed: usize,
    pub pending: usize,
    pub tokens_used: u64,
    pub elapsed_ms: u64,
}

pub trait ProgressSink: Send + Sync {
    fn task_started(&self, _event: &TaskStarted) {}
    fn task_finished(&self, _attempt: &Attempt) {}
    fn task_skipped(&self, _task: &Task, _reason: &str) {}
    fn run_completed(&self, _result: &RunResult) {}
    fn heartbeat(&self, _beat: &Heartbeat) {}
    /// Tool-loop or context-compaction notice from the agent backend.
    fn agent_notice(&self, _key: &TaskKey, _notice: &str) {}
    fn verification(&self, _key: &TaskKey, _result: &VerificationResult) {}
    fn stage(&self, _message: &str) {}
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {}

/// Emits progress as `info` tracing events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn task_started(&self, event: &TaskStarted) {
        info!(
            key = %event.key,
            attempt = event.attempt,
            max_attempts = event.max_attempts,
            iteration = event.iteration,
            phase = %event.phase,
            "task started: {}",
            event.text
        );
    }

    fn task_finished(&self, attempt: &Attempt) {
        info!(
            key = %attempt.task_key,
            status = ?attempt.status,
            duration_ms = attempt.duration_ms,
            tokens = attempt.tokens_used,
            commit = attempt.commit.as_deref().unwrap_or(""),
            "task finished: {}",
            attempt.task_text
        );
    }

    fn task_skipped(&self, task: &Task, reason: &str) {
        info!(key = %task.key, reason, "task skipped: {}", task.text);
    }

    fn run_completed(&self, result: &RunResult) {
        info!(
            stop_reason = result.stop_reason.as_str(),
            completed = result.completed,
            failed = result.failed,
            skipped = result.skipped,
            iterations = result.iterations,
            tokens = result.tokens_used,
            "run completed"
        );
    }

    fn heartbeat(&self, beat: &Heartbeat) {
        info!(
            iteration = beat.iteration,
            completed = beat.completed,
            pending = beat.pending,
            tokens = beat.tokens_used,
            elapsed_ms = beat.elapsed_ms,
            current = beat.current_task.as_deref().unwrap_or("-"),
            "heartbeat"
        );
    }

    fn agent_notice(&self, key: &TaskKey, notice: &str) {
        info!(key = %key, "agent notice: {notice}");
    }

    fn verification(&self, key: &TaskKey, result: &VerificationResult) {
        info!(
            key = %key,
            passed = result.passed,
            build = ?result.l1_build,
            test = ?result.l1_test,
            lint = ?result.l1_lint,
            review = ?result.l2_ai,
            "verification: {}",
            result.summary
        );
    }

    fn stage(&self, message: &str) {
        info!("{message}");
    }
}

/// Publish the latest snapshot from `rx` every `every` until `stop` fires.
pub fn spawn_heartbeat(
    sink: Arc<dyn ProgressSink>,
    every: Duration,
    rx: watch::Receiver<Heartbeat>,
    stop: CancellationToken,
) -> Option<JoinHandle<()>> {
    if every.is_zero() {
        return None;
    }
    let started = Instant::now();
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let mut beat = rx.borrow().clone();
                    beat.elapsed_ms = crate::io::process::millis(started.elapsed());
                    sink.heartbeat(&beat);
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Beats(Mutex<Vec<Heartbeat>>);

    impl ProgressSink for Beats {
        fn heartbeat(&self, beat: &Heartbeat) {
            self.0.lock().expect("lock").push(beat.clone());
        }
    }

    #[tokio::test]
    async fn heartbeat_publishes_latest_snapshot_until_stopped() {
        let sink = Arc::new(Beats::default());
        let (tx, rx) = watch::channel(Heartbeat::default());
        let stop = CancellationToken::new();
        let handle = spawn_heartbeat(sink.clone(), Duration::from_millis(10), rx, stop.clone())
            .expect("spawned");

        tx.send_modify(|beat| beat.iteration = 4);
        tokio::time::sleep(Duration::from_millis(60)).await;
        stop.cancel();
        handle.await.expect("join");

        let beats = sink.0.lock().expect("lock");
        assert!(!beats.is_empty());
        assert_eq!(beats.last().expect("beat").iteration, 4);
    }

    #[test]
    fn zero_interval_disables_heartbeat() {
        let (_tx, rx) = watch::channel(Heartbeat::default());
        assert!(
            spawn_heartbeat(
                Arc::new(NoopProgress),
                Duration::ZERO,
                rx,
                CancellationToken::new()
            )
            .is_none()
        );
    }
}
