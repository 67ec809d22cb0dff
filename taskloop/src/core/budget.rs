//! Global run budgets.

use std::time::Duration;

use crate::core::types::StopReason;

/// Run-wide ceilings resolved from the config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budgets {
    pub max_iterations: Option<u32>,
    pub total_timeout: Option<Duration>,
    pub max_total_tokens: Option<u64>,
}

/// Consumption so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    pub iterations: u32,
    pub elapsed: Duration,
    pub tokens: u64,
}

impl Budgets {
    /// Return the stop reason for the first exhausted budget, if any.
    ///
    /// Checked before every attempt, so `max_iterations = k` allows exactly
    /// `k` attempts.
    pub fn exhausted(&self, usage: &Usage) -> Option<StopReason> {
        if let Some(max) = self.max_iterations
            && usage.iterations >= max
        {
            return Some(StopReason::MaxIterations);
        }
        if let Some(limit) = self.total_timeout
            && usage.elapsed >= limit
        {
            return Some(StopReason::TotalTimeout);
        }
        if let Some(max) = self.max_total_tokens
            && usage.tokens >= max
        {
            return Some(StopReason::TokenBudget);
        }
        None
    }
}
