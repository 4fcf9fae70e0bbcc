//! Timeout budgets.
//!
//! Each phase has an inner timeout (the real enforcement: the pool's hard
//! timeout, or the handler's own deadline) nested strictly inside an outer
//! phase budget. The pipeline-wide budget is only consulted between phases
//! and is shared by every session that drives a run, until a session ends on
//! the budget itself.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::errors::PipelineError;
use crate::phase::PhaseDefinition;
use crate::pool::PollSettings;

/// `inner + setup (+ extra)`.
pub fn phase_outer_timeout(def: &PhaseDefinition) -> Duration {
    def.inner_timeout + def.setup_budget + def.extra_budget.unwrap_or_default()
}

/// True once `total` has elapsed since `started_at`.
pub fn check_pipeline_timeout(started_at: DateTime<Utc>, total: Duration, now: DateTime<Utc>) -> bool {
    let elapsed = (now - started_at).to_std().unwrap_or_default();
    elapsed >= total
}

/// Reject any phase whose inner timeout does not fit strictly inside its outer budget.
pub fn validate_budgets(defs: &[PhaseDefinition]) -> Result<(), PipelineError> {
    for def in defs {
        let outer = phase_outer_timeout(def);
        if def.inner_timeout.is_zero() || def.inner_timeout >= outer {
            return Err(PipelineError::InvalidBudget {
                phase: def.name.clone(),
                inner_secs: def.inner_timeout.as_secs_f64(),
                outer_secs: outer.as_secs_f64(),
            });
        }
    }
    Ok(())
}

/// Poll settings for a pool phase: the configured cadence with the hard
/// timeout taken from the phase's inner timeout.
pub fn poll_settings(def: &PhaseDefinition, base: &PollSettings) -> PollSettings {
    let settings = PollSettings {
        hard_timeout: def.inner_timeout,
        ..base.clone()
    };
    if settings.auto_release >= settings.hard_timeout {
        tracing::debug!(
            phase = %def.name,
            auto_release_secs = settings.auto_release.as_secs_f64(),
            hard_timeout_secs = settings.hard_timeout.as_secs_f64(),
            "Auto-release threshold exceeds the phase hard timeout; stale tasks will only be swept"
        );
    }
    settings
}

/// Longest stretch held back at the end of a pool phase for worker
/// shutdown, the group archive and the artifact.
const WRAP_UP_MARGIN: Duration = Duration::from_secs(1);

/// Share of `remaining` held back for wrap-up: a quarter, at most one second.
pub fn wrap_up_margin(remaining: Duration) -> Duration {
    WRAP_UP_MARGIN.min(remaining / 4)
}

/// Cut a pool's hard timeout short so its final sweep lands before the outer
/// deadline, given `remaining` time in the dispatch once planning is done.
pub fn clamp_hard_timeout(hard_timeout: Duration, remaining: Duration) -> Duration {
    hard_timeout.min(remaining.saturating_sub(wrap_up_margin(remaining)))
}

/// Wall-clock budget for one orchestrator session.
#[derive(Debug, Clone)]
pub struct BudgetClock {
    started_at: DateTime<Utc>,
    total: Duration,
}

impl BudgetClock {
    pub fn start(total: Duration) -> Self {
        Self::resume(total, Duration::ZERO)
    }

    /// Continue a budget of which `spent` was used by earlier sessions.
    pub fn resume(total: Duration, spent: Duration) -> Self {
        let spent = chrono::Duration::from_std(spent).unwrap_or(chrono::TimeDelta::MAX);
        Self {
            started_at: Utc::now().checked_sub_signed(spent).unwrap_or(DateTime::<Utc>::MIN_UTC),
            total,
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn total(&self) -> Duration {
        self.total
    }

    pub fn elapsed(&self) -> Duration {
        (Utc::now() - self.started_at).to_std().unwrap_or_default()
    }

    pub fn remaining(&self) -> Duration {
        self.total.saturating_sub(self.elapsed())
    }

    pub fn is_exhausted(&self) -> bool {
        check_pipeline_timeout(self.started_at, self.total, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(inner: u64, setup: u64, extra: Option<u64>) -> PhaseDefinition {
        PhaseDefinition::new("p", 1, Duration::from_secs(inner)).with_timeouts(
            Duration::from_secs(inner),
            Duration::from_secs(setup),
            extra.map(Duration::from_secs),
        )
    }

    #[test]
    fn test_outer_timeout_sums_components() {
        assert_eq!(phase_outer_timeout(&def(60, 10, None)), Duration::from_secs(70));
        assert_eq!(
            phase_outer_timeout(&def(60, 10, Some(5))),
            Duration::from_secs(75)
        );
    }

    #[test]
    fn test_pipeline_timeout_boundary() {
        let start = Utc::now();
        let total = Duration::from_secs(100);
        assert!(!check_pipeline_timeout(start, total, start + chrono::Duration::seconds(99)));
        assert!(check_pipeline_timeout(start, total, start + chrono::Duration::seconds(100)));
        // A clock that went backwards never reports a breach.
        assert!(!check_pipeline_timeout(start, total, start - chrono::Duration::seconds(5)));
    }

    #[test]
    fn test_validate_requires_strictly_nested_inner_timeout() {
        assert!(validate_budgets(&[def(60, 10, None)]).is_ok());
        let err = validate_budgets(&[def(60, 0, None)]).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidBudget { .. }));
        assert!(validate_budgets(&[def(0, 10, None)]).is_err());
        assert!(validate_budgets(&[def(60, 0, Some(1))]).is_ok());
    }

    #[test]
    fn test_poll_settings_hard_timeout_is_inner() {
        let base = PollSettings::default();
        let settings = poll_settings(&def(90, 10, None), &base);
        assert_eq!(settings.hard_timeout, Duration::from_secs(90));
        assert_eq!(settings.poll_interval, base.poll_interval);
    }

    #[test]
    fn test_hard_timeout_clamped_to_remaining_budget() {
        let inner = Duration::from_secs(90);
        assert_eq!(clamp_hard_timeout(inner, Duration::from_secs(300)), inner);
        // 20s left: a one second margin is held back.
        assert_eq!(
            clamp_hard_timeout(inner, Duration::from_secs(20)),
            Duration::from_secs(19)
        );
        // Short budgets keep a quarter for wrap-up.
        assert_eq!(
            clamp_hard_timeout(inner, Duration::from_millis(800)),
            Duration::from_millis(600)
        );
        assert_eq!(clamp_hard_timeout(inner, Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_budget_clock_remaining() {
        let clock = BudgetClock::start(Duration::from_secs(3600));
        assert!(!clock.is_exhausted());
        assert!(clock.remaining() <= Duration::from_secs(3600));

        let spent = BudgetClock::start(Duration::ZERO);
        assert!(spent.is_exhausted());
        assert_eq!(spent.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_resumed_clock_counts_earlier_sessions() {
        let total = Duration::from_secs(3600);
        let clock = BudgetClock::resume(total, Duration::from_secs(3000));
        assert!(clock.elapsed() >= Duration::from_secs(3000));
        assert!(clock.remaining() <= Duration::from_secs(600));
        assert!(!clock.is_exhausted());

        assert!(BudgetClock::resume(total, Duration::from_secs(3600)).is_exhausted());
        assert!(BudgetClock::resume(total, Duration::MAX).is_exhausted());
    }
}
