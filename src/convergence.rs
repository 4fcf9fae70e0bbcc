//! Bounded fix-then-verify loop.
//!
//! The gate compares the issue count before a remediation pass with the count
//! reported by the following verification pass. A pass that fails to reduce
//! the count halts immediately; otherwise the loop retries until the count is
//! acceptable or `max_rounds` retries have been spent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_ROUNDS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    /// The remediation pass did not reduce the issue count.
    Regression,
    RoundsExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Converged,
    Retry,
    Halted(HaltReason),
}

impl Verdict {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Retry)
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Converged => write!(f, "converged"),
            Self::Retry => write!(f, "retry"),
            Self::Halted(HaltReason::Regression) => write!(f, "halted (no improvement)"),
            Self::Halted(HaltReason::RoundsExhausted) => write!(f, "halted (rounds exhausted)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvergenceGate {
    pub max_rounds: u32,
    /// Highest issue count that still counts as converged.
    pub acceptance_threshold: u32,
}

impl Default for ConvergenceGate {
    fn default() -> Self {
        Self {
            max_rounds: DEFAULT_MAX_ROUNDS,
            acceptance_threshold: 0,
        }
    }
}

impl ConvergenceGate {
    pub fn new(max_rounds: u32, acceptance_threshold: u32) -> Self {
        Self {
            max_rounds,
            acceptance_threshold,
        }
    }

    pub fn evaluate(&self, issues_before: u32, issues_after: u32, round: u32) -> Verdict {
        if issues_before == 0 && issues_after == 0 {
            return Verdict::Converged;
        }
        if issues_after >= issues_before {
            return Verdict::Halted(HaltReason::Regression);
        }
        if issues_after <= self.acceptance_threshold {
            return Verdict::Converged;
        }
        if round < self.max_rounds {
            Verdict::Retry
        } else {
            Verdict::Halted(HaltReason::RoundsExhausted)
        }
    }
}

/// One evaluated round, kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round: u32,
    pub issues_before: u32,
    pub issues_after: u32,
    pub verdict: Verdict,
    #[serde(default = "Utc::now")]
    pub recorded_at: DateTime<Utc>,
}

/// Convergence progress persisted in the checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceState {
    #[serde(default)]
    pub round: u32,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    #[serde(default)]
    pub history: Vec<RoundRecord>,
    /// Issue count measured before the pending remediation pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<u32>,
}

fn default_max_rounds() -> u32 {
    DEFAULT_MAX_ROUNDS
}

impl Default for ConvergenceState {
    fn default() -> Self {
        Self {
            round: 0,
            max_rounds: DEFAULT_MAX_ROUNDS,
            history: Vec::new(),
            baseline: None,
        }
    }
}

impl ConvergenceState {
    /// Evaluate the current round, append it to the history and advance the
    /// round counter on `Retry`.
    pub fn record(&mut self, gate: &ConvergenceGate, issues_before: u32, issues_after: u32) -> Verdict {
        let verdict = gate.evaluate(issues_before, issues_after, self.round);
        self.history.push(RoundRecord {
            round: self.round,
            issues_before,
            issues_after,
            verdict,
            recorded_at: Utc::now(),
        });
        if verdict == Verdict::Retry {
            self.round += 1;
        }
        verdict
    }

    pub fn last_verdict(&self) -> Option<Verdict> {
        self.history.last().map(|r| r.verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regression_halts_on_first_round() {
        let gate = ConvergenceGate::default();
        assert_eq!(
            gate.evaluate(5, 7, 0),
            Verdict::Halted(HaltReason::Regression)
        );
        assert_eq!(
            gate.evaluate(5, 5, 0),
            Verdict::Halted(HaltReason::Regression)
        );
    }

    #[test]
    fn test_improvement_below_threshold_converges() {
        let gate = ConvergenceGate::new(2, 1);
        assert_eq!(gate.evaluate(5, 1, 0), Verdict::Converged);
        assert_eq!(gate.evaluate(5, 0, 2), Verdict::Converged);
        assert_eq!(ConvergenceGate::default().evaluate(0, 0, 0), Verdict::Converged);
    }

    #[test]
    fn test_improvement_above_threshold_retries_until_exhausted() {
        let gate = ConvergenceGate::new(2, 0);
        assert_eq!(gate.evaluate(5, 3, 0), Verdict::Retry);
        assert_eq!(gate.evaluate(3, 2, 1), Verdict::Retry);
        assert_eq!(
            gate.evaluate(2, 1, 2),
            Verdict::Halted(HaltReason::RoundsExhausted)
        );
    }

    #[test]
    fn test_max_two_rounds_allows_at_most_three_attempts() {
        let gate = ConvergenceGate::new(2, 0);
        let mut state = ConvergenceState::default();
        let mut issues = 100;
        let mut attempts = 0;

        loop {
            attempts += 1;
            let after = issues - 1;
            let verdict = state.record(&gate, issues, after);
            issues = after;
            if verdict.is_terminal() {
                assert!(matches!(verdict, Verdict::Converged | Verdict::Halted(_)));
                break;
            }
            assert!(attempts < 10, "gate never terminated");
        }

        assert_eq!(attempts, 3);
        assert_eq!(state.history.len(), 3);
        assert_eq!(state.round, 2);
    }

    #[test]
    fn test_record_appends_history() {
        let gate = ConvergenceGate::default();
        let mut state = ConvergenceState::default();
        assert_eq!(state.record(&gate, 4, 2), Verdict::Retry);
        assert_eq!(state.record(&gate, 2, 0), Verdict::Converged);

        assert_eq!(state.history[0].round, 0);
        assert_eq!(state.history[1].round, 1);
        assert_eq!(state.history[1].issues_after, 0);
        assert_eq!(state.last_verdict(), Some(Verdict::Converged));
    }

    #[test]
    fn test_verdict_serializes_readably() {
        let json = serde_json::to_value(Verdict::Halted(HaltReason::Regression)).unwrap();
        assert_eq!(json, serde_json::json!({ "halted": "regression" }));
        assert_eq!(serde_json::to_value(Verdict::Retry).unwrap(), "retry");
    }
}
