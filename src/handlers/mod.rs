//! Phase handler seam.
//!
//! A phase runs either directly (`PhaseHandler`) or by fanning out to a worker
//! pool (`PoolPhaseHandler`). The registry maps phase names to strategies and
//! is checked against the phase definitions before a run starts.

pub mod command;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

pub use command::{CommandPhaseHandler, CommandPoolHandler, CommandWorker, parse_issue_count};

use crate::errors::PipelineError;
use crate::phase::{PhaseContext, PhaseDefinition, PhaseOutcome, PhaseResultStatus};
use crate::pool::{PollResult, PoolSummary, TaskDescriptor, Worker};
use crate::util::write_atomic;

/// Runs a phase in one call. Never panics or errors out: every problem is
/// reported through the returned outcome.
#[async_trait]
pub trait PhaseHandler: Send + Sync {
    async fn run(&self, ctx: &PhaseContext) -> PhaseOutcome;
}

/// A phase that fans out into a dependency-ordered task set.
#[async_trait]
pub trait PoolPhaseHandler: Send + Sync {
    /// Produce the task set for this phase.
    async fn plan(&self, ctx: &PhaseContext) -> anyhow::Result<Vec<TaskDescriptor>>;

    fn worker(&self) -> Arc<dyn Worker>;

    /// Turn the pool's final state into the phase outcome. The default writes
    /// the poll result as the phase artifact.
    async fn finish(&self, ctx: &PhaseContext, result: &PollResult) -> PhaseOutcome {
        write_pool_artifact(ctx, result)
    }
}

/// Remove an earlier attempt's artifact so a re-run can only report fresh
/// output. The artifact directory is created if missing.
pub fn reset_artifact(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Write `result` as JSON to the phase artifact path and classify it.
pub fn write_pool_artifact(ctx: &PhaseContext, result: &PollResult) -> PhaseOutcome {
    let summary = PoolSummary::from(result);
    let json = match serde_json::to_vec_pretty(result) {
        Ok(json) => json,
        Err(e) => return PhaseOutcome::failure(format!("failed to encode pool result: {}", e)),
    };
    if let Err(e) = write_atomic(&ctx.artifact_path, &json) {
        return PhaseOutcome::failure(format!(
            "failed to write artifact {}: {}",
            ctx.artifact_path.display(),
            e
        ));
    }

    let mut outcome = PhaseOutcome::success(&ctx.artifact_path).with_pool(summary);
    if result.cancelled {
        outcome.status = PhaseResultStatus::Cancelled;
        outcome.message = Some("worker group cancelled".to_string());
    } else if result.timed_out {
        outcome.status = PhaseResultStatus::Timeout;
        outcome.message = Some(format!(
            "worker group hit its hard timeout with {} task(s) outstanding",
            result.outstanding.len()
        ));
    } else if !result.is_success() {
        outcome.status = PhaseResultStatus::Failure;
        outcome.message = Some(format!("failed tasks: {}", result.failed.join(", ")));
    }
    outcome
}

#[derive(Clone)]
pub enum PhaseStrategy {
    Direct(Arc<dyn PhaseHandler>),
    Pool(Arc<dyn PoolPhaseHandler>),
}

impl PhaseStrategy {
    pub fn is_pool(&self) -> bool {
        matches!(self, Self::Pool(_))
    }
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    strategies: HashMap<String, PhaseStrategy>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_direct(&mut self, phase: &str, handler: Arc<dyn PhaseHandler>) {
        self.strategies
            .insert(phase.to_string(), PhaseStrategy::Direct(handler));
    }

    pub fn register_pool(&mut self, phase: &str, handler: Arc<dyn PoolPhaseHandler>) {
        self.strategies
            .insert(phase.to_string(), PhaseStrategy::Pool(handler));
    }

    pub fn with_direct(mut self, phase: &str, handler: Arc<dyn PhaseHandler>) -> Self {
        self.register_direct(phase, handler);
        self
    }

    pub fn with_pool(mut self, phase: &str, handler: Arc<dyn PoolPhaseHandler>) -> Self {
        self.register_pool(phase, handler);
        self
    }

    pub fn get(&self, phase: &str) -> Option<&PhaseStrategy> {
        self.strategies.get(phase)
    }

    /// Every defined phase needs a strategy matching its `has_worker_pool`.
    pub fn validate(&self, defs: &[PhaseDefinition]) -> Result<(), PipelineError> {
        for def in defs {
            match self.strategies.get(&def.name) {
                None => {
                    return Err(PipelineError::NoHandler {
                        phase: def.name.clone(),
                    });
                }
                Some(strategy) if strategy.is_pool() != def.has_worker_pool => {
                    return Err(PipelineError::StrategyMismatch {
                        phase: def.name.clone(),
                        expects_pool: def.has_worker_pool,
                    });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}
