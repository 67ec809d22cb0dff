//! L2 AI review: one short-lived session judging the diff.
//!
//! The reply is parsed by an ordered list of strategies, first success wins:
//! the whole reply as JSON, then embedded JSON, then keyword-scored prose. The
//! prose tier never fails and leans towards passing.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

const MAX_REASON_CHARS: usize = 300;
/// `{` positions tried when hunting for embedded JSON.
const MAX_OBJECT_STARTS: usize = 32;

static FENCED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("fenced json regex"));
static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-z']+").expect("word regex"));

const POSITIVE: &[&str] = &[
    "lgtm", "approve", "approved", "pass", "passes", "correct", "correctly", "good", "complete",
    "acceptable", "satisfies", "implements",
];
const NEGATIVE: &[&str] = &[
    "reject", "rejected", "fail", "fails", "incorrect", "wrong", "missing", "bug", "broken",
    "incomplete", "regression", "doesn't", "not",
];

/// Which strategy produced the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewTier {
    Json,
    Embedded,
    Prose,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewVerdict {
    pub pass: bool,
    pub reason: String,
    pub tier: ReviewTier,
}

type Strategy = fn(&str) -> Option<ReviewVerdict>;

/// Parse a review reply. Always returns a verdict.
pub fn parse_review(reply: &str) -> ReviewVerdict {
    let strategies: [Strategy; 2] = [whole_json, embedded_json];
    strategies
        .iter()
        .find_map(|strategy| strategy(reply))
        .unwrap_or_else(|| scored_prose(reply))
}

fn whole_json(reply: &str) -> Option<ReviewVerdict> {
    let value: Value = serde_json::from_str(reply.trim()).ok()?;
    verdict_from(&value, ReviewTier::Json)
}

fn embedded_json(reply: &str) -> Option<ReviewVerdict> {
    for caps in FENCED_RE.captures_iter(reply) {
        if let Some(verdict) = caps
            .get(1)
            .and_then(|m| serde_json::from_str::<Value>(m.as_str()).ok())
            .and_then(|v| verdict_from(&v, ReviewTier::Embedded))
        {
            return Some(verdict);
        }
    }
    // First `{...}` that parses and carries "pass".
    let starts = reply.match_indices('{').map(|(i, _)| i).take(MAX_OBJECT_STARTS);
    for start in starts {
        let tail = &reply[start..];
        if !tail.contains("\"pass\"") {
            continue;
        }
        for (offset, _) in tail.match_indices('}') {
            let candidate = &tail[..=offset];
            if !candidate.contains("\"pass\"") {
                continue;
            }
            if let Some(verdict) = serde_json::from_str::<Value>(candidate)
                .ok()
                .and_then(|v| verdict_from(&v, ReviewTier::Embedded))
            {
                return Some(verdict);
            }
        }
    }
    None
}

fn verdict_from(value: &Value, tier: ReviewTier) -> Option<ReviewVerdict> {
    let pass = value.get("pass")?.as_bool()?;
    let reason = value
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Some(ReviewVerdict {
        pass,
        reason: clip(&reason),
        tier,
    })
}

/// Keyword scoring; ties and silence pass.
fn scored_prose(reply: &str) -> ReviewVerdict {
    let lower = reply.to_lowercase();
    let (mut positive, mut negative) = (0usize, 0usize);
    for word in WORD_RE.find_iter(&lower).map(|m| m.as_str()) {
        if POSITIVE.contains(&word) {
            positive += 1;
        } else if NEGATIVE.contains(&word) {
            negative += 1;
        }
    }
    let pass = negative <= positive;
    let reason = if reply.trim().is_empty() {
        "empty review reply".to_string()
    } else {
        clip(reply.trim())
    };
    ReviewVerdict {
        pass,
        reason,
        tier: ReviewTier::Prose,
    }
}

fn clip(text: &str) -> String {
    match text.char_indices().nth(MAX_REASON_CHARS) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
