//! Phase selection and dispatch.
//!
//! `next_phase` reads the checkpoint and returns the first phase that still
//! has to run. `Dispatcher` runs one phase through its strategy, either a
//! direct handler call or a full worker-pool round trip, inside the phase's
//! outer budget.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::broker::BrokerHandle;
use crate::budget;
use crate::checkpoint::{Checkpoint, PhaseStatus};
use crate::errors::{PipelineError, SchedulerError};
use crate::handlers::{PhaseStrategy, PoolPhaseHandler, reset_artifact};
use crate::phase::{PhaseContext, PhaseDefinition, PhaseOutcome, PhaseResultStatus, UpstreamArtifact};
use crate::pool::{PollSettings, PoolCoordinator, WorkerContext, WorkerSettings, spawn_workers};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextPhase {
    Run(String),
    Done,
}

/// A failed or timed-out advisory phase does not block the phases after it.
fn passed_over(status: PhaseStatus, def: &PhaseDefinition) -> bool {
    !def.halts_on_failure && matches!(status, PhaseStatus::Failed | PhaseStatus::Timeout)
}

/// First phase in pipeline order that is neither completed nor skipped.
///
/// Completed phases must have non-decreasing completion times in pipeline
/// order; a violation means the checkpoint was edited or replayed out of
/// order. Pairs involving a reopened phase are exempt, since a convergence
/// retry or a demotion legitimately completes an earlier phase after a
/// later one.
pub fn next_phase(
    checkpoint: &Checkpoint,
    defs: &[PhaseDefinition],
) -> Result<NextPhase, SchedulerError> {
    let mut previous: Option<(&str, chrono::DateTime<chrono::Utc>, u32)> = None;
    for record in &checkpoint.phases {
        if record.status != PhaseStatus::Completed {
            continue;
        }
        let Some(completed_at) = record.completed_at else {
            continue;
        };
        if let Some((earlier, earlier_at, earlier_reopened)) = previous
            && completed_at < earlier_at
            && earlier_reopened == 0
            && record.reopened == 0
        {
            return Err(SchedulerError::TimestampRegression {
                earlier: earlier.to_string(),
                earlier_at: earlier_at.to_rfc3339(),
                later: record.name.clone(),
                later_at: completed_at.to_rfc3339(),
            });
        }
        previous = Some((&record.name, completed_at, record.reopened));
    }

    for record in &checkpoint.phases {
        let def = defs
            .iter()
            .find(|d| d.name == record.name)
            .ok_or_else(|| SchedulerError::MissingDefinition {
                phase: record.name.clone(),
            })?;
        if record.status.is_done() || passed_over(record.status, def) {
            continue;
        }
        return Ok(NextPhase::Run(record.name.clone()));
    }
    Ok(NextPhase::Done)
}

/// What the orchestrator does after a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Proceed,
    /// Advisory phase failed; log and continue.
    ProceedWithWarning,
    Halt,
}

/// Halting table. Cancellation always halts; other non-success outcomes halt
/// only phases marked `halts_on_failure`.
pub fn disposition(def: &PhaseDefinition, outcome: &PhaseOutcome) -> Disposition {
    match outcome.status {
        PhaseResultStatus::Success => Disposition::Proceed,
        PhaseResultStatus::Cancelled => Disposition::Halt,
        PhaseResultStatus::Failure | PhaseResultStatus::Timeout if def.halts_on_failure => {
            Disposition::Halt
        }
        PhaseResultStatus::Failure | PhaseResultStatus::Timeout => Disposition::ProceedWithWarning,
    }
}

/// Phase record status for a dispatch outcome.
pub fn record_status(outcome: &PhaseOutcome) -> PhaseStatus {
    match outcome.status {
        PhaseResultStatus::Success => PhaseStatus::Completed,
        PhaseResultStatus::Failure => PhaseStatus::Failed,
        PhaseResultStatus::Cancelled => PhaseStatus::Cancelled,
        PhaseResultStatus::Timeout => PhaseStatus::Timeout,
    }
}

/// Build the context for dispatching `def` from the current checkpoint.
pub fn build_context(
    checkpoint: &Checkpoint,
    def: &PhaseDefinition,
    run_dir: &Path,
    worker_group_id: Option<String>,
    cancel: CancellationToken,
) -> PhaseContext {
    let upstream = checkpoint
        .completed_artifacts()
        .into_iter()
        .filter(|(name, _)| *name != def.name)
        .map(|(phase, path)| UpstreamArtifact { phase, path })
        .collect();
    PhaseContext {
        run_id: checkpoint.id.clone(),
        phase: def.clone(),
        scope: checkpoint.scope.clone(),
        flags: checkpoint.flags.clone(),
        upstream,
        artifact_path: run_dir.join("artifacts").join(def.artifact_file_name()),
        run_dir: run_dir.to_path_buf(),
        round: checkpoint.convergence.round,
        worker_group_id,
        deadline: Instant::now() + budget::phase_outer_timeout(def),
        cancel,
    }
}

/// Runs phases through their strategies.
pub struct Dispatcher {
    coordinator: Arc<PoolCoordinator>,
    poll: PollSettings,
    workers: WorkerSettings,
    broker: Option<BrokerHandle>,
    shutdown_grace: Duration,
}

impl Dispatcher {
    pub fn new(poll: PollSettings, workers: WorkerSettings) -> Self {
        Self {
            coordinator: Arc::new(PoolCoordinator::new()),
            poll,
            workers,
            broker: None,
            shutdown_grace: Duration::from_secs(30),
        }
    }

    pub fn with_broker(mut self, broker: Option<BrokerHandle>) -> Self {
        self.broker = broker;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn coordinator(&self) -> &PoolCoordinator {
        &self.coordinator
    }

    /// Run one phase inside its outer budget.
    ///
    /// Handler problems come back as a non-success outcome. Only structural
    /// problems, such as a planner producing a dependency cycle, are errors.
    pub async fn dispatch(
        &self,
        strategy: &PhaseStrategy,
        ctx: &PhaseContext,
    ) -> Result<PhaseOutcome, PipelineError> {
        let outer = budget::phase_outer_timeout(&ctx.phase);
        // Everything spawned for this dispatch hangs off this token, so an
        // outer timeout stops it as well.
        let dispatch_cancel = ctx.cancel.child_token();
        let ctx = PhaseContext {
            cancel: dispatch_cancel.clone(),
            ..ctx.clone()
        };

        if let Err(e) = reset_artifact(&ctx.artifact_path) {
            return Ok(PhaseOutcome::failure(format!(
                "failed to clear artifact {}: {}",
                ctx.artifact_path.display(),
                e
            )));
        }

        let run = async {
            match strategy {
                PhaseStrategy::Direct(handler) => Ok(handler.run(&ctx).await),
                PhaseStrategy::Pool(handler) => self.run_pool(handler.as_ref(), &ctx).await,
            }
        };

        match tokio::time::timeout(outer, run).await {
            Ok(result) => result,
            Err(_) => {
                dispatch_cancel.cancel();
                if let Some(group_id) = &ctx.worker_group_id
                    && let Some(board) = self.coordinator.remove(group_id)
                {
                    board.cancel();
                }
                tracing::error!(
                    phase = %ctx.phase.name,
                    outer_secs = outer.as_secs_f64(),
                    "Phase exceeded its outer budget"
                );
                Ok(PhaseOutcome::timeout(format!(
                    "phase exceeded its outer budget of {:?}",
                    outer
                )))
            }
        }
    }

    async fn run_pool(
        &self,
        handler: &dyn PoolPhaseHandler,
        ctx: &PhaseContext,
    ) -> Result<PhaseOutcome, PipelineError> {
        let tasks = match handler.plan(ctx).await {
            Ok(tasks) => tasks,
            Err(_) if ctx.cancel.is_cancelled() => return Ok(PhaseOutcome::cancelled()),
            Err(e) => return Ok(PhaseOutcome::failure(format!("planning failed: {:#}", e))),
        };

        let group_id = ctx
            .worker_group_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", ctx.run_id, ctx.phase.name));
        let board = self.coordinator.create_group_with_id(&group_id, tasks)?;

        let template = WorkerContext {
            worker_id: String::new(),
            group_id: group_id.clone(),
            run_id: ctx.run_id.clone(),
            phase: ctx.phase.name.clone(),
            work_dir: ctx.run_dir.join("work").join(&group_id),
            broker: self.broker.clone(),
            cancel: ctx.cancel.clone(),
        };
        let pool = spawn_workers(board, handler.worker(), &self.workers, template);
        tracing::info!(
            phase = %ctx.phase.name,
            group_id = %group_id,
            workers = pool.len(),
            "Dispatched worker pool"
        );

        // Planning has already used part of the outer budget; the final sweep
        // and archive must still happen inside it.
        let mut settings = budget::poll_settings(&ctx.phase, &self.poll);
        settings.hard_timeout = budget::clamp_hard_timeout(settings.hard_timeout, ctx.remaining());
        let polled = self.coordinator.poll(&group_id, &settings, &ctx.cancel).await;
        pool.shutdown(self.shutdown_grace.min(ctx.remaining() / 2)).await;
        let result = polled?;

        match self.coordinator.archive(&group_id, &ctx.run_dir.join("groups")) {
            Ok(path) => tracing::debug!(group_id = %group_id, path = %path.display(), "Archived worker group"),
            Err(e) => tracing::warn!(group_id = %group_id, error = %e, "Failed to archive worker group"),
        }
        self.coordinator.remove(&group_id);

        Ok(handler.finish(ctx, &result).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{ArtifactRef, OwnerIdentity, ScopeDescriptor};
    use crate::errors::PoolError;
    use crate::handlers::PhaseHandler;
    use crate::pool::{TaskDescriptor, TaskOutput, Worker, WorkerTask};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn defs() -> Vec<PhaseDefinition> {
        vec![
            PhaseDefinition::new("plan", 1, Duration::from_secs(5)),
            PhaseDefinition::new("build", 2, Duration::from_secs(5)).with_worker_pool(),
            PhaseDefinition::new("report", 3, Duration::from_secs(5)).advisory(),
        ]
    }

    fn checkpoint() -> Checkpoint {
        Checkpoint::new(
            "run-1",
            ScopeDescriptor::new("scope", ""),
            BTreeMap::new(),
            &defs(),
            OwnerIdentity::current("cfg"),
        )
    }

    fn complete(cp: &mut Checkpoint, name: &str) {
        cp.update_phase(name, PhaseStatus::InProgress, None).unwrap();
        cp.update_phase(
            name,
            PhaseStatus::Completed,
            Some(ArtifactRef {
                path: format!("/tmp/{}.out", name).into(),
                hash: "h".into(),
            }),
        )
        .unwrap();
    }

    fn settings() -> (PollSettings, WorkerSettings) {
        (
            PollSettings {
                poll_interval: Duration::from_millis(10),
                ..PollSettings::default()
            },
            WorkerSettings {
                count: 2,
                claim_interval: Duration::from_millis(5),
            },
        )
    }

    #[test]
    fn test_next_phase_skips_done_phases() {
        let defs = defs();
        let mut cp = checkpoint();
        assert_eq!(next_phase(&cp, &defs).unwrap(), NextPhase::Run("plan".into()));

        complete(&mut cp, "plan");
        cp.update_phase("build", PhaseStatus::Skipped, None).unwrap();
        assert_eq!(next_phase(&cp, &defs).unwrap(), NextPhase::Run("report".into()));

        complete(&mut cp, "report");
        assert_eq!(next_phase(&cp, &defs).unwrap(), NextPhase::Done);
    }

    #[test]
    fn test_next_phase_reruns_interrupted_required_phase() {
        let defs = defs();
        let mut cp = checkpoint();
        cp.update_phase("plan", PhaseStatus::InProgress, None).unwrap();
        cp.update_phase("plan", PhaseStatus::Failed, None).unwrap();
        assert_eq!(next_phase(&cp, &defs).unwrap(), NextPhase::Run("plan".into()));
    }

    #[test]
    fn test_next_phase_passes_over_failed_advisory_phase() {
        let defs = defs();
        let mut cp = checkpoint();
        complete(&mut cp, "plan");
        complete(&mut cp, "build");
        cp.update_phase("report", PhaseStatus::InProgress, None).unwrap();
        cp.update_phase("report", PhaseStatus::Failed, None).unwrap();
        assert_eq!(next_phase(&cp, &defs).unwrap(), NextPhase::Done);
    }

    #[test]
    fn test_next_phase_rejects_timestamp_regression() {
        let defs = defs();
        let mut cp = checkpoint();
        complete(&mut cp, "plan");
        complete(&mut cp, "build");
        let later = cp.phase("build").unwrap().completed_at.unwrap();
        cp.phase_mut("plan").unwrap().completed_at = Some(later + chrono::Duration::seconds(60));

        assert!(matches!(
            next_phase(&cp, &defs),
            Err(SchedulerError::TimestampRegression { earlier, later, .. })
                if earlier == "plan" && later == "build"
        ));

        // A reopened phase may legitimately finish after a later one.
        cp.phase_mut("plan").unwrap().reopened = 1;
        assert!(next_phase(&cp, &defs).is_ok());
    }

    #[test]
    fn test_next_phase_requires_definitions() {
        let mut cp = checkpoint();
        cp.phases.push(crate::checkpoint::PhaseRecord::pending("ghost"));
        complete(&mut cp, "plan");
        complete(&mut cp, "build");
        complete(&mut cp, "report");
        assert!(matches!(
            next_phase(&cp, &defs()),
            Err(SchedulerError::MissingDefinition { phase }) if phase == "ghost"
        ));
    }

    #[test]
    fn test_halting_table() {
        let required = PhaseDefinition::new("plan", 1, Duration::from_secs(1));
        let advisory = PhaseDefinition::new("report", 2, Duration::from_secs(1)).advisory();

        assert_eq!(disposition(&required, &PhaseOutcome::success("/a")), Disposition::Proceed);
        assert_eq!(disposition(&required, &PhaseOutcome::failure("x")), Disposition::Halt);
        assert_eq!(disposition(&required, &PhaseOutcome::timeout("x")), Disposition::Halt);
        assert_eq!(
            disposition(&advisory, &PhaseOutcome::failure("x")),
            Disposition::ProceedWithWarning
        );
        assert_eq!(disposition(&advisory, &PhaseOutcome::cancelled()), Disposition::Halt);
    }

    #[test]
    fn test_build_context_collects_upstream_artifacts() {
        let dir = TempDir::new().unwrap();
        let mut cp = checkpoint();
        complete(&mut cp, "plan");
        let defs = defs();

        let ctx = build_context(&cp, &defs[1], dir.path(), Some("g".into()), CancellationToken::new());

        assert_eq!(ctx.upstream.len(), 1);
        assert_eq!(ctx.upstream[0].phase, "plan");
        assert_eq!(ctx.artifact_path, dir.path().join("artifacts").join("02-build.out"));
        assert!(ctx.remaining() > Duration::from_secs(5));
    }

    struct Sleepy;

    #[async_trait]
    impl PhaseHandler for Sleepy {
        async fn run(&self, ctx: &PhaseContext) -> PhaseOutcome {
            tokio::time::sleep(Duration::from_secs(60)).await;
            PhaseOutcome::success(&ctx.artifact_path)
        }
    }

    #[tokio::test]
    async fn test_dispatch_enforces_outer_budget() {
        let dir = TempDir::new().unwrap();
        let def = PhaseDefinition::new("plan", 1, Duration::from_millis(50))
            .with_timeouts(Duration::from_millis(50), Duration::from_millis(50), None);
        let mut cp = checkpoint();
        cp.phases = vec![crate::checkpoint::PhaseRecord::pending("plan")];
        let ctx = build_context(&cp, &def, dir.path(), None, CancellationToken::new());
        let (poll, workers) = settings();

        let outcome = Dispatcher::new(poll, workers)
            .dispatch(&PhaseStrategy::Direct(Arc::new(Sleepy)), &ctx)
            .await
            .unwrap();

        assert_eq!(outcome.status, PhaseResultStatus::Timeout);
    }

    struct Lazy;

    #[async_trait]
    impl PhaseHandler for Lazy {
        async fn run(&self, ctx: &PhaseContext) -> PhaseOutcome {
            PhaseOutcome::success(&ctx.artifact_path)
        }
    }

    #[tokio::test]
    async fn test_dispatch_clears_previous_artifact() {
        let dir = TempDir::new().unwrap();
        let cp = checkpoint();
        let ctx = build_context(&cp, &defs()[0], dir.path(), None, CancellationToken::new());
        std::fs::create_dir_all(ctx.artifact_path.parent().unwrap()).unwrap();
        std::fs::write(&ctx.artifact_path, "stale").unwrap();
        let (poll, workers) = settings();

        let outcome = Dispatcher::new(poll, workers)
            .dispatch(&PhaseStrategy::Direct(Arc::new(Lazy)), &ctx)
            .await
            .unwrap();

        // The handler claimed success without writing anything; nothing stale is left to hash.
        assert!(outcome.is_success());
        assert!(!ctx.artifact_path.exists());
    }

    struct Echo;

    #[async_trait]
    impl Worker for Echo {
        async fn execute(&self, _: &WorkerContext, task: &WorkerTask) -> anyhow::Result<TaskOutput> {
            Ok(TaskOutput {
                summary: Some(format!("did {}", task.id)),
                changeset: None,
            })
        }
    }

    struct Planned(Vec<TaskDescriptor>);

    #[async_trait]
    impl PoolPhaseHandler for Planned {
        async fn plan(&self, _: &PhaseContext) -> anyhow::Result<Vec<TaskDescriptor>> {
            Ok(self.0.clone())
        }
        fn worker(&self) -> Arc<dyn Worker> {
            Arc::new(Echo)
        }
    }

    #[tokio::test]
    async fn test_pool_dispatch_runs_tasks_and_archives_group() {
        let dir = TempDir::new().unwrap();
        let cp = checkpoint();
        let def = &defs()[1];
        let ctx = build_context(&cp, def, dir.path(), Some("run-1-build-1".into()), CancellationToken::new());
        let handler = Planned(vec![
            TaskDescriptor::new("a", ""),
            TaskDescriptor::new("b", "").blocked_by(&["a"]),
        ]);
        let (poll, workers) = settings();
        let dispatcher = Dispatcher::new(poll, workers);

        let outcome = dispatcher
            .dispatch(&PhaseStrategy::Pool(Arc::new(handler)), &ctx)
            .await
            .unwrap();

        assert!(outcome.is_success(), "{:?}", outcome.message);
        assert_eq!(outcome.pool.as_ref().unwrap().completed, 2);
        assert!(ctx.artifact_path.exists());
        assert!(dir.path().join("groups").join("run-1-build-1.json").exists());
        assert!(dispatcher.coordinator().board("run-1-build-1").is_err());
    }

    struct Hangs;

    #[async_trait]
    impl Worker for Hangs {
        async fn execute(&self, _: &WorkerContext, task: &WorkerTask) -> anyhow::Result<TaskOutput> {
            if task.id == "stuck" {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok(TaskOutput::default())
        }
    }

    struct SlowPlanner;

    #[async_trait]
    impl PoolPhaseHandler for SlowPlanner {
        async fn plan(&self, _: &PhaseContext) -> anyhow::Result<Vec<TaskDescriptor>> {
            tokio::time::sleep(Duration::from_millis(1200)).await;
            Ok(vec![TaskDescriptor::new("quick", ""), TaskDescriptor::new("stuck", "")])
        }
        fn worker(&self) -> Arc<dyn Worker> {
            Arc::new(Hangs)
        }
    }

    #[tokio::test]
    async fn test_slow_plan_still_returns_partial_pool_results() {
        let dir = TempDir::new().unwrap();
        // Outer budget 2s; planning eats 1.2s, leaving less than the 1s inner timeout.
        let def = PhaseDefinition::new("build", 2, Duration::from_secs(1))
            .with_worker_pool()
            .with_timeouts(Duration::from_secs(1), Duration::from_secs(1), None);
        let mut cp = checkpoint();
        cp.phases = vec![crate::checkpoint::PhaseRecord::pending("build")];
        let ctx = build_context(&cp, &def, dir.path(), Some("run-1-build-r0".into()), CancellationToken::new());
        let (poll, workers) = settings();

        let outcome = Dispatcher::new(poll, workers)
            .dispatch(&PhaseStrategy::Pool(Arc::new(SlowPlanner)), &ctx)
            .await
            .unwrap();

        assert_eq!(outcome.status, PhaseResultStatus::Timeout);
        let pool = outcome.pool.expect("partial pool summary");
        assert_eq!(pool.completed, 1);
        assert!(ctx.artifact_path.exists());
        assert!(dir.path().join("groups").join("run-1-build-r0.json").exists());
    }

    #[tokio::test]
    async fn test_pool_dispatch_rejects_cyclic_plan() {
        let dir = TempDir::new().unwrap();
        let cp = checkpoint();
        let ctx = build_context(&cp, &defs()[1], dir.path(), Some("g".into()), CancellationToken::new());
        let handler = Planned(vec![
            TaskDescriptor::new("a", "").blocked_by(&["b"]),
            TaskDescriptor::new("b", "").blocked_by(&["a"]),
        ]);
        let (poll, workers) = settings();

        let err = Dispatcher::new(poll, workers)
            .dispatch(&PhaseStrategy::Pool(Arc::new(handler)), &ctx)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Pool(PoolError::DependencyCycle { .. })));
        assert!(err.is_fatal());
    }
}
