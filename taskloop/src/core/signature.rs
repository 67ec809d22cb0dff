//! Failure signatures for the consecutive-identical-failure guard.
//!
//! Two failures share a signature when they differ only in volatile details:
//! numbers, hashes, temp paths, durations and whitespace.

use std::sync::LazyLock;

use regex::Regex;

const MAX_SIGNATURE_CHARS: usize = 400;

static HEX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[0-9a-f]{7,64}\b").expect("hex regex"));
static TMP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(/tmp|/var/folders)/\S+").expect("tmp regex"));
static NUM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("number regex"));
static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex"));

/// Normalize failure text into a comparable signature.
pub fn failure_signature(text: &str) -> String {
    let lower = text.to_lowercase();
    let out = TMP_RE.replace_all(&lower, "<tmp>");
    let out = HEX_RE.replace_all(&out, "<hex>");
    let out = NUM_RE.replace_all(&out, "<n>");
    let out = WS_RE.replace_all(&out, " ");
    out.trim().chars().take(MAX_SIGNATURE_CHARS).collect()
}

/// Tracks how many consecutive failures shared the same signature.
#[derive(Debug, Clone, Default)]
pub struct RepeatTracker {
    last: Option<String>,
    streak: u32,
}

impl RepeatTracker {
    /// Record a failure and return the current streak length.
    pub fn record(&mut self, signature: &str) -> u32 {
        if self.last.as_deref() == Some(signature) {
            self.streak += 1;
        } else {
            self.last = Some(signature.to_string());
            self.streak = 1;
        }
        self.streak
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volatile_details_are_normalized() {
        let a = failure_signature("test foo failed at src/lib.rs:42 in 1.23s (commit abcdef1234)");
        let b =
            failure_signature("Test foo failed at src/lib.rs:97   in 0.5s (commit 0123456789ab)");
        assert_eq!(a, b);
    }

    #[test]
    fn different_failures_differ() {
        assert_ne!(
            failure_signature("build failed: missing semicolon"),
            failure_signature("test failed: assertion")
        );
    }

    #[test]
    fn streak_resets_on_new_signature() {
        let mut tracker = RepeatTracker::default();
        assert_eq!(tracker.record("a"), 1);
        assert_eq!(tracker.record("a"), 2);
        assert_eq!(tracker.record("b"), 1);
    }
}
