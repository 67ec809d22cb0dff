//! Extraction of the agent's `<task_result>` block.
//!
//! Agents may print drafts before their final answer, so the last well-formed
//! block wins. Parsing never fails: anything unusable degrades to `blocked`
//! with a diagnostic reason.

use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use jsonschema::{Draft, Validator};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::types::{AgentStatus, ParsedResult};

const RESULT_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/result_block.schema.json"
));

static BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<task_result>\s*(.*?)\s*</task_result>").expect("result block regex")
});
static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^```[a-zA-Z]*\s*(.*?)\s*```$").expect("fence regex"));

static VALIDATOR: LazyLock<Option<Validator>> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(RESULT_SCHEMA).ok()?;
    match jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
    {
        Ok(validator) => Some(validator),
        Err(err) => {
            warn!(err = %err, "result block schema failed to compile");
            None
        }
    }
});

#[derive(Debug, Clone, Deserialize)]
struct RawBlock {
    status: String,
    #[serde(default)]
    summary: String,
    reason: Option<String>,
    #[serde(default)]
    subtasks: Vec<String>,
    satisfied: Option<bool>,
    plan_file: Option<String>,
    approved: Option<bool>,
    feedback: Option<String>,
}

/// Preflight discovery answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryVerdict {
    pub satisfied: bool,
    pub plan_file: Option<String>,
    pub summary: String,
}

/// Preflight requirements-review answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanReviewVerdict {
    pub approved: bool,
    pub feedback: String,
}

/// Interpret an implementation reply.
pub fn parse_result(output: &str) -> ParsedResult {
    let block = match last_block(output) {
        Ok(block) => block,
        Err(reason) => {
            debug!(reason = %reason, "agent output has no usable result block");
            return ParsedResult::blocked(reason);
        }
    };
    let status = match block.status.trim().to_ascii_lowercase().as_str() {
        "done" => AgentStatus::Done,
        "blocked" => AgentStatus::Blocked,
        "failed" => AgentStatus::Failed,
        "decompose" => AgentStatus::Decompose,
        other => {
            return ParsedResult {
                summary: block.summary,
                ..ParsedResult::blocked(format!("unknown result status '{other}'"))
            };
        }
    };
    let subtasks: Vec<String> = block
        .subtasks
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if status == AgentStatus::Decompose && subtasks.is_empty() {
        return ParsedResult {
            status: AgentStatus::Failed,
            summary: block.summary,
            reason: Some("decompose requested without subtasks".to_string()),
            subtasks: Vec::new(),
        };
    }
    ParsedResult {
        status,
        summary: block.summary,
        reason: block.reason,
        subtasks,
    }
}

/// Interpret a discovery reply.
pub fn parse_discovery(output: &str) -> Result<DiscoveryVerdict> {
    let block = last_block(output).map_err(|reason| anyhow!(reason))?;
    Ok(DiscoveryVerdict {
        satisfied: block.satisfied.unwrap_or(false),
        plan_file: block
            .plan_file
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty()),
        summary: block.summary,
    })
}

/// Interpret a requirements-review reply. A reply without `approved` counts as
/// approval when its status is `done`.
pub fn parse_plan_review(output: &str) -> Result<PlanReviewVerdict> {
    let block = last_block(output).map_err(|reason| anyhow!(reason))?;
    let approved = block
        .approved
        .unwrap_or_else(|| block.status.eq_ignore_ascii_case("done"));
    Ok(PlanReviewVerdict {
        approved,
        feedback: block.feedback.or(block.reason).unwrap_or(block.summary),
    })
}

fn last_block(output: &str) -> Result<RawBlock, String> {
    let candidates: Vec<&str> = BLOCK_RE
        .captures_iter(output)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();
    if candidates.is_empty() {
        return Err("no <task_result> block in agent output".to_string());
    }
    let mut last_error = String::new();
    for raw in candidates.iter().rev() {
        match decode_block(raw) {
            Ok(block) => return Ok(block),
            Err(err) => last_error = err,
        }
    }
    Err(format!(
        "no well-formed <task_result> block ({} found): {last_error}",
        candidates.len()
    ))
}

fn decode_block(raw: &str) -> Result<RawBlock, String> {
    let body = FENCE_RE
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .map_or(raw, |m| m.as_str());
    let value: Value = serde_json::from_str(body).map_err(|err| format!("invalid JSON: {err}"))?;
    if let Some(validator) = VALIDATOR.as_ref() {
        let messages: Vec<String> = validator
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect();
        if !messages.is_empty() {
            return Err(format!("schema validation failed: {}", messages.join("; ")));
        }
    }
    serde_json::from_value(value).map_err(|err| format!("unexpected shape: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_well_formed_block_wins() {
        let output = r#"
Draft: <task_result>{"status": "failed", "reason": "draft"}</task_result>
Working...
<task_result>{"status": "done", "summary": "implemented"}</task_result>
<task_result>{"status": "done", "summary": </task_result>
"#;
        let parsed = parse_result(output);
        assert_eq!(parsed.status, AgentStatus::Done);
        assert_eq!(parsed.summary, "implemented");
    }

    #[test]
    fn missing_block_degrades_to_blocked() {
        let parsed = parse_result("I changed some files.");
        assert_eq!(parsed.status, AgentStatus::Blocked);
        assert!(parsed.reason.expect("reason").contains("no <task_result>"));
    }

    #[test]
    fn unknown_status_degrades_to_blocked() {
        let parsed =
            parse_result(r#"<task_result>{"status": "maybe", "summary": "s"}</task_result>"#);
        assert_eq!(parsed.status, AgentStatus::Blocked);
        assert_eq!(parsed.reason.as_deref(), Some("unknown result status 'maybe'"));
        assert_eq!(parsed.summary, "s");
    }

    #[test]
    fn schema_violations_are_not_well_formed() {
        let parsed = parse_result(r#"<task_result>{"status": 3}</task_result>"#);
        assert_eq!(parsed.status, AgentStatus::Blocked);
        assert!(parsed.reason.expect("reason").contains("schema validation failed"));
    }

    #[test]
    fn decompose_keeps_ordered_subtasks() {
        let parsed = parse_result(
            "<task_result>\n```json\n{\"status\": \"decompose\", \"subtasks\": [\"one\", \" two \", \"\"]}\n```\n</task_result>",
        );
        assert_eq!(parsed.status, AgentStatus::Decompose);
        assert_eq!(parsed.subtasks, vec!["one".to_string(), "two".to_string()]);

        let empty =
            parse_result(r#"<task_result>{"status": "decompose", "subtasks": []}</task_result>"#);
        assert_eq!(empty.status, AgentStatus::Failed);
    }

    #[test]
    fn preflight_blocks_parse() {
        let discovery = parse_discovery(
            r#"<task_result>{"status": "done", "satisfied": false, "plan_file": ".taskloop/plans/a.md"}</task_result>"#,
        )
        .expect("discovery");
        assert!(!discovery.satisfied);
        assert_eq!(discovery.plan_file.as_deref(), Some(".taskloop/plans/a.md"));

        let review = parse_plan_review(r#"<task_result>{"status": "done"}</task_result>"#)
            .expect("review");
        assert!(review.approved);
        let rejected = parse_plan_review(
            r#"<task_result>{"status": "done", "approved": false, "feedback": "missing tests"}</task_result>"#,
        )
        .expect("review");
        assert!(!rejected.approved);
        assert_eq!(rejected.feedback, "missing tests");

        assert!(parse_discovery("nothing").is_err());
    }
}
