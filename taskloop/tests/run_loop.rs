//! Run-level tests for the controller.
//!
//! Each test builds a scratch project with a `TASKS.md`, scripts the agent's
//! replies and drives `Controller::run` to a stop condition.

use std::time::{Duration, Instant};

use taskloop::core::parser::parse_task_file;
use taskloop::core::types::{AttemptStatus, CheckState, PreflightStatus, StopReason};
use taskloop::error::{LockError, RunError};
use taskloop::io::agent::SessionPurpose;
use taskloop::test_support::{
    Harness, ProgressEvent, ScriptedSessionFactory, agent_error, decompose, done, hang, reply,
    result_block, status,
};
use tokio_util::sync::CancellationToken;

const THREE_TASKS: &str = "# Phase 1\n\n- [ ] first\n- [ ] second\n- [ ] third\n";

#[tokio::test]
async fn every_task_gets_a_fresh_session_until_all_done() {
    let harness = Harness::new(THREE_TASKS, ScriptedSessionFactory::always_done());
    let result = harness.run().await;

    assert_eq!(result.stop_reason, StopReason::AllDone);
    assert!(result.completed_all);
    assert_eq!(result.completed, 3);
    assert_eq!(result.iterations, 3);
    assert_eq!(harness.sessions.sessions_created(), 3);
    assert_eq!(result.tokens_used, 300);
    assert_eq!(result.commits, 3);
    assert_eq!(
        harness.vcs.commits(),
        vec!["taskloop: first", "taskloop: second", "taskloop: third"]
    );
    assert_eq!(
        harness.project.tasks(),
        "# Phase 1\n\n- [x] first\n- [x] second\n- [x] third\n"
    );
    assert_eq!(
        harness.progress.events().last(),
        Some(&ProgressEvent::Completed(StopReason::AllDone))
    );
}

#[tokio::test]
async fn failed_attempt_is_retried_with_context() {
    let harness = Harness::new(
        "- [ ] only\n",
        ScriptedSessionFactory::new(vec![status("failed", "tests do not compile"), done("fixed")]),
    );
    let result = harness.run().await;

    assert_eq!(result.stop_reason, StopReason::AllDone);
    assert_eq!(result.failed, 0);
    assert_eq!(result.completed, 1);
    let key = &result.attempts[0].task_key;
    let statuses: Vec<AttemptStatus> = result.attempts_for(key).map(|a| a.status).collect();
    assert_eq!(statuses, vec![AttemptStatus::Failed, AttemptStatus::Passed]);

    let prompts = harness.sessions.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(!prompts[0].1.contains("### Previous Attempt"));
    assert!(prompts[1].1.contains("Attempt 1 ended with status `failed`"));
    assert!(prompts[1].1.contains("tests do not compile"));
}

#[tokio::test]
async fn exhausted_retries_skip_the_task_and_continue() {
    let mut harness = Harness::new(
        "- [ ] hard\n- [ ] easy\n",
        ScriptedSessionFactory::new(vec![
            status("failed", "first try"),
            status("failed", "second try"),
            done("easy one"),
        ]),
    );
    harness.config.max_retries_per_task = 1;
    let result = harness.run().await;

    assert_eq!(result.stop_reason, StopReason::AllDone);
    assert!(!result.completed_all);
    assert_eq!(result.skipped, 1);
    assert_eq!(result.failed, 1);
    assert_eq!(result.completed, 1);
    assert_eq!(result.attempts[1].status, AttemptStatus::Skipped);
    assert_eq!(harness.project.tasks(), "- [ ] hard\n- [x] easy\n");
    assert!(harness.progress.events().iter().any(|e| matches!(
        e,
        ProgressEvent::Skipped { reason, .. } if reason == "2 attempt(s) exhausted"
    )));
}

#[tokio::test]
async fn identical_failures_give_up_early() {
    let mut harness = Harness::new(
        "- [ ] flaky\n",
        ScriptedSessionFactory::repeating(status("failed", "error at line 12")),
    );
    harness.config.max_retries_per_task = 5;
    harness.config.max_identical_failures = 2;
    let result = harness.run().await;

    assert_eq!(result.attempts.len(), 2);
    assert_eq!(result.skipped, 1);
    assert_eq!(harness.sessions.sessions_created(), 2);
}

#[tokio::test]
async fn abort_between_attempts_stops_the_run() {
    let abort = CancellationToken::new();
    let trigger = abort.clone();
    let harness = Harness::new(
        THREE_TASKS,
        ScriptedSessionFactory::new(vec![done("one").with_effect(move || trigger.cancel())]),
    );
    let result = harness.controller().with_abort(abort).run().await.expect("run");

    assert_eq!(result.stop_reason, StopReason::Abort);
    assert_eq!(result.completed, 1);
    assert_eq!(result.attempts.len(), 1);
    assert_eq!(harness.sessions.sessions_created(), 1);
}

#[tokio::test]
async fn abort_cancels_an_in_flight_call() {
    let abort = CancellationToken::new();
    let harness = Harness::new(THREE_TASKS, ScriptedSessionFactory::new(vec![hang()]));
    let controller = harness.controller().with_abort(abort.clone());

    let trigger = abort.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let started = Instant::now();
    let result = controller.run().await.expect("run");

    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(result.stop_reason, StopReason::Abort);
    assert_eq!(result.attempts.len(), 1);
    assert_eq!(result.attempts[0].status, AttemptStatus::Aborted);
    assert_eq!(harness.sessions.sessions_cancelled(), 1);
}

#[tokio::test]
async fn abort_during_review_neither_checks_off_nor_commits() {
    let abort = CancellationToken::new();
    let mut harness = Harness::new(
        "- [ ] only\n- [ ] second\n",
        ScriptedSessionFactory::new(vec![done("implemented"), hang()]),
    );
    harness.config.verify.ai_review = true;
    harness.vcs.set_diff("+fn only() {}");
    let controller = harness.controller().with_abort(abort.clone());

    let trigger = abort.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });
    let result = controller.run().await.expect("run");

    assert_eq!(result.stop_reason, StopReason::Abort);
    assert_eq!(result.attempts.len(), 1);
    assert_eq!(result.attempts[0].status, AttemptStatus::Aborted);
    assert_eq!(result.completed, 0);
    assert!(harness.vcs.commits().is_empty());
    assert_eq!(harness.project.tasks(), "- [ ] only\n- [ ] second\n");
    assert_eq!(harness.sessions.sessions_cancelled(), 1);
}

#[tokio::test]
async fn timed_out_call_is_cancelled_and_recorded() {
    let mut harness = Harness::new(
        "- [ ] slow\n",
        ScriptedSessionFactory::new(vec![hang(), done("quick this time")]),
    );
    harness.config.task_timeout_secs = 1;
    let result = harness.run().await;

    assert_eq!(result.attempts[0].status, AttemptStatus::Timeout);
    assert_eq!(result.attempts[1].status, AttemptStatus::Passed);
    assert_eq!(harness.sessions.sessions_cancelled(), 1);
}

#[tokio::test]
async fn iteration_budget_stops_after_k_attempts() {
    let mut harness = Harness::new(THREE_TASKS, ScriptedSessionFactory::always_done());
    harness.config.max_iterations = Some(2);
    let result = harness.run().await;

    assert_eq!(result.stop_reason, StopReason::MaxIterations);
    assert_eq!(result.completed, 2);
    assert_eq!(result.iterations, 2);
}

#[tokio::test]
async fn zero_total_timeout_stops_before_any_attempt() {
    let mut harness = Harness::new(THREE_TASKS, ScriptedSessionFactory::always_done());
    harness.config.total_timeout_secs = Some(0);
    let result = harness.run().await;

    assert_eq!(result.stop_reason, StopReason::TotalTimeout);
    assert_eq!(result.completed, 0);
    assert_eq!(harness.sessions.sessions_created(), 0);
}

#[tokio::test]
async fn token_budget_below_one_task_stops_after_it() {
    let mut harness = Harness::new(THREE_TASKS, ScriptedSessionFactory::always_done());
    harness.config.max_total_tokens = Some(50);
    let result = harness.run().await;

    assert_eq!(result.stop_reason, StopReason::TokenBudget);
    assert_eq!(result.completed, 1);
    assert_eq!(result.tokens_used, 100);
}

#[tokio::test]
async fn throwing_sessions_without_skip_are_fatal() {
    let mut harness = Harness::new(
        THREE_TASKS,
        ScriptedSessionFactory::always_error("provider unavailable"),
    );
    harness.config.skip_on_fail = false;
    let result = harness.run().await;

    assert_eq!(result.stop_reason, StopReason::FatalError);
    assert!(result.attempts.iter().any(|a| a.status == AttemptStatus::Error));
    assert!(result.error.expect("error").contains("provider unavailable"));
    assert_eq!(result.failed, 1);
    assert_eq!(result.completed, 0);
}

#[tokio::test]
async fn parent_auto_completes_without_its_own_attempt() {
    let harness = Harness::new(
        "- [ ] parent\n  - [ ] child a\n  - [ ] child b\n",
        ScriptedSessionFactory::always_done(),
    );
    let before = parse_task_file(&harness.project.task_file()).expect("parse");
    let parent_key = before.tasks[0].key.clone();
    let result = harness.run().await;

    assert_eq!(result.stop_reason, StopReason::AllDone);
    assert!(result.completed_all);
    assert_eq!(harness.sessions.sessions_created(), 2);
    assert_eq!(result.auto_completed, 1);
    assert_eq!(result.completed, 3);
    assert_eq!(result.attempts_for(&parent_key).count(), 0);
}

#[tokio::test]
async fn checking_tasks_keeps_every_other_key() {
    let mut harness = Harness::new(THREE_TASKS, ScriptedSessionFactory::new(vec![done("first")]));
    harness.config.max_iterations = Some(1);
    let before = parse_task_file(&harness.project.task_file()).expect("parse");
    harness.run().await;
    let after = parse_task_file(&harness.project.task_file()).expect("parse");

    let keys = |file: &taskloop::core::task::TaskFile| {
        file.tasks.iter().map(|t| t.key.clone()).collect::<Vec<_>>()
    };
    assert_eq!(keys(&before), keys(&after));
    assert!(after.tasks[0].checked);
    assert!(!after.tasks[1].checked);
}

#[tokio::test]
async fn decomposition_inserts_children_and_works_them_first() {
    let harness = Harness::new(
        "- [ ] big feature\n- [ ] later\n",
        ScriptedSessionFactory::new(vec![
            decompose(&["step one", "step two"]),
            done("one"),
            done("two"),
            done("later"),
        ]),
    );
    let result = harness.run().await;

    assert_eq!(result.stop_reason, StopReason::AllDone);
    assert!(result.completed_all);
    assert_eq!(result.decomposed, 1);
    assert_eq!(result.auto_completed, 1);
    assert_eq!(result.attempts[0].status, AttemptStatus::Decomposed);
    assert_eq!(
        harness.project.tasks(),
        "- [x] big feature\n  - [x] step one\n  - [x] step two\n- [x] later\n"
    );
    let prompts = harness.sessions.prompts();
    assert!(prompts[0].1.contains("decomposition depth left: 2 of 2"));
    assert!(prompts[1].1.contains("step one"));
}

#[tokio::test]
async fn decomposition_beyond_max_depth_counts_as_failure() {
    let mut harness = Harness::new(
        "- [ ] big feature\n",
        ScriptedSessionFactory::new(vec![decompose(&["a", "b"]), done("did it whole")]),
    );
    harness.config.decompose.max_depth = 0;
    let result = harness.run().await;

    assert_eq!(result.decomposed, 0);
    assert_eq!(result.attempts[0].status, AttemptStatus::Failed);
    let verification = result.attempts[0].verification.as_ref().expect("verification");
    assert_eq!(verification.summary, "Agent reported status: decompose");
    assert!(!harness.sessions.prompts()[0].1.contains("decomposition depth left"));
    assert_eq!(harness.project.tasks(), "- [x] big feature\n");
}

#[tokio::test]
async fn failed_attempt_changes_are_rolled_back_except_the_task_file() {
    let harness = Harness::new("- [ ] only\n", ScriptedSessionFactory::new(Vec::new()));
    harness.vcs.touch("notes.md");
    let vcs = harness.vcs.clone();
    harness.sessions.push(status("failed", "broke it").with_effect(move || {
        vcs.touch("src/lib.rs");
        vcs.touch("TASKS.md");
    }));
    harness.sessions.push(done("fixed"));
    let result = harness.run().await;

    assert_eq!(result.completed, 1);
    assert_eq!(harness.vcs.discarded(), vec!["src/lib.rs".to_string()]);
    assert!(
        harness
            .progress
            .stages()
            .iter()
            .any(|s| s.starts_with("Rolled back 1 file(s)"))
    );
}

#[tokio::test]
async fn l1_failure_feeds_command_output_into_the_retry() {
    let mut harness = Harness::new(
        "- [ ] only\n",
        ScriptedSessionFactory::new(vec![done("first"), done("second")]),
    );
    harness.config.verify.test_command = Some("make check".to_string());
    harness.commands.fail("make check", "assertion failed: parser_handles_tabs");
    let result = harness.run().await;

    let first = result.attempts[0].verification.as_ref().expect("verification");
    assert_eq!(first.l1_test, CheckState::Fail);
    assert_eq!(first.l1_build, CheckState::NotConfigured);
    assert_eq!(result.attempts[1].status, AttemptStatus::Passed);
    assert!(harness.sessions.prompts()[1].1.contains("parser_handles_tabs"));
    assert_eq!(harness.commands.calls(), vec!["make check", "make check"]);
}

#[tokio::test]
async fn ai_review_rejection_fails_the_attempt() {
    let mut harness = Harness::new(
        "- [ ] only\n",
        ScriptedSessionFactory::new(vec![
            done("first"),
            reply(r#"{"pass": false, "reason": "parser ignores tabs"}"#, 20),
            done("second"),
            reply("LGTM", 20),
        ]),
    );
    harness.config.verify.ai_review = true;
    harness.vcs.set_diff("+fn parse() {}");
    let result = harness.run().await;

    let first = result.attempts[0].verification.as_ref().expect("verification");
    assert_eq!(first.l2_ai, CheckState::Fail);
    assert_eq!(first.l2_reason.as_deref(), Some("parser ignores tabs"));
    assert_eq!(result.attempts[0].tokens_used, 120);
    assert_eq!(result.attempts[1].status, AttemptStatus::Passed);
    let purposes: Vec<SessionPurpose> = harness.sessions.prompts().iter().map(|p| p.0).collect();
    assert_eq!(
        purposes,
        vec![
            SessionPurpose::Implement,
            SessionPurpose::CodeReview,
            SessionPurpose::Implement,
            SessionPurpose::CodeReview
        ]
    );
}

#[tokio::test]
async fn preflight_satisfied_task_is_checked_without_an_attempt() {
    let mut harness = Harness::new(
        "- [ ] already there\n",
        ScriptedSessionFactory::new(vec![result_block(r#"{"status": "done", "satisfied": true}"#)]),
    );
    harness.config.preflight.enabled = true;
    let result = harness.run().await;

    assert_eq!(result.stop_reason, StopReason::AllDone);
    assert!(result.attempts.is_empty());
    assert_eq!(result.completed, 1);
    assert_eq!(result.preflight[0].status, PreflightStatus::AlreadySatisfied);
    assert_eq!(harness.sessions.prompts()[0].0, SessionPurpose::Discovery);
}

#[tokio::test]
async fn preflight_bootstraps_a_missing_plan_and_reviews_it() {
    let mut harness = Harness::new(
        "- [ ] add parser\n",
        ScriptedSessionFactory::new(vec![
            result_block(
                r#"{"status": "done", "satisfied": false, "plan_file": "plans/parser.md", "summary": "Touch src/parser.rs only."}"#,
            ),
            result_block(r#"{"status": "done", "approved": false, "feedback": "name the tests"}"#),
            result_block(r#"{"status": "done", "approved": true}"#),
            done("parser added"),
        ]),
    );
    harness.config.preflight.enabled = true;
    harness.config.preflight.requirements_review = true;
    let result = harness.run().await;

    let plan = harness.project.read("plans/parser.md");
    assert!(plan.starts_with("# Plan: add parser"));
    assert!(plan.contains("Touch src/parser.rs only."));
    let record = &result.preflight[0];
    assert_eq!(record.status, PreflightStatus::Reviewed);
    assert_eq!(record.plan_file.as_deref(), Some("plans/parser.md"));
    assert_eq!(record.tokens_used, 300);

    let prompts = harness.sessions.prompts();
    assert_eq!(prompts[2].0, SessionPurpose::RequirementsReview);
    assert!(prompts[2].1.contains("review round 2"));
    assert_eq!(prompts[3].0, SessionPurpose::Implement);
    assert!(prompts[3].1.contains("Follow the reviewed plan in `plans/parser.md`"));
    assert_eq!(result.completed, 1);
}

#[tokio::test]
async fn preflight_errors_are_recorded_not_fatal() {
    let mut harness = Harness::new(
        "- [ ] only\n",
        ScriptedSessionFactory::new(vec![agent_error("discovery crashed"), done("done anyway")]),
    );
    harness.config.preflight.enabled = true;
    let result = harness.run().await;

    assert_eq!(result.preflight[0].status, PreflightStatus::Error);
    assert!(
        result.preflight[0]
            .error
            .as_deref()
            .expect("error")
            .contains("discovery crashed")
    );
    assert_eq!(result.stop_reason, StopReason::AllDone);
    assert_eq!(result.completed, 1);
}

#[tokio::test]
async fn external_task_file_edits_are_reported_and_picked_up() {
    let mut harness = Harness::new("- [ ] first\n", ScriptedSessionFactory::new(Vec::new()));
    harness.config.max_retries_per_task = 0;
    let root = harness.project.root().to_path_buf();
    harness.sessions.push(status("failed", "gave up").with_effect(move || {
        let path = root.join("TASKS.md");
        let text = std::fs::read_to_string(&path).expect("read");
        std::fs::write(&path, format!("{text}- [ ] added by hand\n")).expect("write");
    }));
    harness.sessions.push(done("second"));
    let result = harness.run().await;

    assert_eq!(result.skipped, 1);
    assert_eq!(result.completed, 1);
    assert_eq!(result.total_tasks, 2);
    assert_eq!(harness.project.tasks(), "- [ ] first\n- [x] added by hand\n");
    assert!(
        harness
            .progress
            .stages()
            .iter()
            .any(|s| s.contains("changed outside the run"))
    );
}

#[tokio::test]
async fn task_ceiling_stops_oversized_files() {
    let mut harness = Harness::new(THREE_TASKS, ScriptedSessionFactory::always_done());
    harness.config.max_total_tasks = 2;
    let result = harness.run().await;

    assert_eq!(result.stop_reason, StopReason::TaskCeiling);
    assert_eq!(harness.sessions.sessions_created(), 0);
}

#[tokio::test]
async fn agent_notices_are_forwarded() {
    let harness = Harness::new(
        "- [ ] only\n",
        ScriptedSessionFactory::new(vec![done("ok").with_notice("context compacted")]),
    );
    harness.run().await;

    assert!(harness.progress.events().iter().any(|e| matches!(
        e,
        ProgressEvent::Notice { notice, .. } if notice == "context compacted"
    )));
}

#[tokio::test]
async fn held_lock_refuses_to_start() {
    let harness = Harness::new(THREE_TASKS, ScriptedSessionFactory::always_done());
    let _guard = harness.project.lock_manager().acquire("other run").expect("lock");

    let err = harness.controller().run().await.expect_err("locked");
    assert!(matches!(err, RunError::Lock(LockError::Held { .. })));
    assert_eq!(harness.sessions.sessions_created(), 0);
}

#[tokio::test]
async fn lock_is_free_after_a_failing_run() {
    let mut harness = Harness::new(THREE_TASKS, ScriptedSessionFactory::always_error("boom"));
    harness.config.skip_on_fail = false;
    let result = harness.run().await;
    assert_eq!(result.stop_reason, StopReason::FatalError);

    let guard = harness.project.lock_manager().acquire("next run").expect("re-acquire");
    guard.release().expect("release");
}

#[tokio::test]
async fn ambiguous_task_file_is_a_parse_error_and_releases_the_lock() {
    let harness = Harness::new(
        "- [ ] a\n  - [ ] b\n      - [ ] too deep\n",
        ScriptedSessionFactory::always_done(),
    );
    let err = harness.controller().run().await.expect_err("ambiguous");
    assert!(matches!(err, RunError::Parse(_)));
    harness
        .project
        .lock_manager()
        .acquire("after parse error")
        .expect("lock released");
}
