//! The pipeline driver.
//!
//! One session of a run holds the scope lease, walks the phases in order via
//! `next_phase`, dispatches each one, and persists the checkpoint after every
//! transition. Budget and cancellation are checked between phases. After a
//! successful verification phase the convergence gate decides whether the
//! remediation pair runs again.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::cancel::{self, DEFAULT_MARKER_POLL};
use super::report::{FailureInfo, PipelineReport};
use crate::broker::BrokerHandle;
use crate::budget::{self, BudgetClock};
use crate::checkpoint::{
    ArtifactRef, Checkpoint, CheckpointStore, DemotedPhase, FsCheckpointStore, OwnerIdentity,
    PhaseStatus, PipelineStatus, ScopeDescriptor, generate_run_id, hash_artifact, verify_on_resume,
};
use crate::convergence::{ConvergenceGate, HaltReason, Verdict};
use crate::errors::PipelineError;
use crate::handlers::HandlerRegistry;
use crate::lease::{Lease, LeaseGuard, LivenessProbe, RetryPolicy};
use crate::phase::{PhaseDefinition, PhaseOutcome, PhaseResultStatus, validate_definitions};
use crate::pool::{PollSettings, WorkerSettings};
use crate::scheduler::{self, Disposition, Dispatcher, NextPhase};

/// Remediation/verification pair driven by the convergence gate.
#[derive(Debug, Clone)]
pub struct ConvergenceLoop {
    pub remediation: String,
    pub verification: String,
    pub gate: ConvergenceGate,
    pub stop_on_regression: bool,
}

pub struct PipelineBuilder {
    runs_dir: PathBuf,
    leases_dir: PathBuf,
    phases: Vec<PhaseDefinition>,
    registry: HandlerRegistry,
    store: Option<Arc<dyn CheckpointStore>>,
    probe: Option<Arc<dyn LivenessProbe>>,
    config_scope_id: String,
    total_budget: Duration,
    lease_ttl: Duration,
    retry: RetryPolicy,
    convergence: Option<ConvergenceLoop>,
    poll: PollSettings,
    workers: WorkerSettings,
    broker: Option<BrokerHandle>,
    shutdown_grace: Duration,
    marker_poll: Duration,
    cancel: CancellationToken,
}

impl PipelineBuilder {
    pub fn phases(mut self, phases: Vec<PhaseDefinition>) -> Self {
        self.phases = phases;
        self
    }

    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Defaults to a filesystem store under the runs directory.
    pub fn store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn liveness_probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn config_scope_id(mut self, id: &str) -> Self {
        self.config_scope_id = id.to_string();
        self
    }

    pub fn total_budget(mut self, total: Duration) -> Self {
        self.total_budget = total;
        self
    }

    pub fn lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn lease_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn convergence(mut self, convergence: Option<ConvergenceLoop>) -> Self {
        self.convergence = convergence;
        self
    }

    pub fn pool_settings(mut self, poll: PollSettings, workers: WorkerSettings) -> Self {
        self.poll = poll;
        self.workers = workers;
        self
    }

    pub fn broker(mut self, broker: Option<BrokerHandle>) -> Self {
        self.broker = broker;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn cancel_marker_poll(mut self, interval: Duration) -> Self {
        self.marker_poll = interval;
        self
    }

    /// External cancellation (e.g. Ctrl-C). The cancel marker is watched as well.
    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Validate the definitions, budgets and handler wiring.
    pub fn build(self) -> Result<Pipeline, PipelineError> {
        let mut phases = self.phases;
        validate_definitions(&mut phases)?;
        budget::validate_budgets(&phases)?;
        self.registry.validate(&phases)?;

        if let Some(conv) = &self.convergence {
            let order = |name: &str| phases.iter().find(|d| d.name == name).map(|d| d.order);
            match (order(&conv.remediation), order(&conv.verification)) {
                (Some(r), Some(v)) if r < v => {}
                (Some(_), Some(_)) => {
                    return Err(PipelineError::InvalidDefinition(format!(
                        "remediation phase '{}' must come before verification phase '{}'",
                        conv.remediation, conv.verification
                    )));
                }
                _ => {
                    return Err(PipelineError::InvalidDefinition(format!(
                        "convergence phases '{}' and '{}' must both be defined",
                        conv.remediation, conv.verification
                    )));
                }
            }
        }

        let store: Arc<dyn CheckpointStore> = match self.store {
            Some(store) => store,
            None => Arc::new(FsCheckpointStore::new(&self.runs_dir)),
        };
        let mut lease_guard = LeaseGuard::new(&self.leases_dir, self.lease_ttl, &self.config_scope_id)
            .with_checkpoint_store(Arc::clone(&store));
        if let Some(probe) = self.probe {
            lease_guard = lease_guard.with_probe(probe);
        }
        let dispatcher = Dispatcher::new(self.poll, self.workers)
            .with_broker(self.broker)
            .with_shutdown_grace(self.shutdown_grace);

        Ok(Pipeline {
            runs_dir: self.runs_dir,
            phases,
            registry: self.registry,
            store,
            lease_guard,
            dispatcher,
            config_scope_id: self.config_scope_id,
            total_budget: self.total_budget,
            retry: self.retry,
            convergence: self.convergence,
            marker_poll: self.marker_poll,
            cancel: self.cancel,
        })
    }
}

pub struct Pipeline {
    runs_dir: PathBuf,
    phases: Vec<PhaseDefinition>,
    registry: HandlerRegistry,
    store: Arc<dyn CheckpointStore>,
    lease_guard: LeaseGuard,
    dispatcher: Dispatcher,
    config_scope_id: String,
    total_budget: Duration,
    retry: RetryPolicy,
    convergence: Option<ConvergenceLoop>,
    marker_poll: Duration,
    cancel: CancellationToken,
}

/// Why the drive loop stopped.
enum Stop {
    Finished,
    Halted(FailureInfo),
}

impl Pipeline {
    pub fn builder(runs_dir: impl Into<PathBuf>, leases_dir: impl Into<PathBuf>) -> PipelineBuilder {
        PipelineBuilder {
            runs_dir: runs_dir.into(),
            leases_dir: leases_dir.into(),
            phases: Vec::new(),
            registry: HandlerRegistry::new(),
            store: None,
            probe: None,
            config_scope_id: String::new(),
            total_budget: Duration::from_secs(4 * 60 * 60),
            lease_ttl: crate::lease::DEFAULT_LEASE_TTL,
            retry: RetryPolicy::default(),
            convergence: None,
            poll: PollSettings::default(),
            workers: WorkerSettings::default(),
            broker: None,
            shutdown_grace: Duration::from_secs(30),
            marker_poll: DEFAULT_MARKER_POLL,
            cancel: CancellationToken::new(),
        }
    }

    pub fn phases(&self) -> &[PhaseDefinition] {
        &self.phases
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }

    /// Start a new run over `scope`.
    pub async fn start(
        &self,
        scope: ScopeDescriptor,
        flags: BTreeMap<String, bool>,
    ) -> Result<PipelineReport, PipelineError> {
        let run_id = generate_run_id();
        let mut lease = self
            .lease_guard
            .try_acquire_with_retry(&scope.id, &run_id, &self.retry)
            .await?;

        let mut checkpoint = self.store.create(
            &run_id,
            scope,
            flags,
            &self.phases,
            OwnerIdentity::current(&self.config_scope_id),
        )?;
        if let Some(conv) = &self.convergence {
            checkpoint.convergence.max_rounds = conv.gate.max_rounds;
            self.store.save(&checkpoint)?;
        }
        tracing::info!(run_id = %run_id, scope = %checkpoint.scope.id, "Started pipeline run");

        let report = self.drive(checkpoint, &mut lease, Vec::new()).await;
        release(lease);
        report
    }

    /// Resume `run_id`, or the most recently updated run.
    pub async fn resume(&self, run_id: Option<&str>) -> Result<PipelineReport, PipelineError> {
        let run_id = match run_id {
            Some(id) => id.to_string(),
            None => self.store.latest()?.ok_or(PipelineError::NothingToResume)?,
        };
        let mut checkpoint = self.store.load(&run_id)?;
        if checkpoint.is_finished() {
            tracing::info!(run_id = %run_id, "Run already completed; nothing to resume");
            return Ok(PipelineReport::from_checkpoint(&checkpoint, None, Vec::new()));
        }

        let mut lease = self
            .lease_guard
            .try_acquire_with_retry(&checkpoint.scope.id, &run_id, &self.retry)
            .await?;

        let run_dir = self.run_dir(&run_id);
        if let Err(e) = cancel::clear_marker(&run_dir) {
            tracing::warn!(run_id = %run_id, error = %e, "Failed to clear old cancel marker");
        }
        checkpoint.owner = OwnerIdentity::current(&self.config_scope_id);
        if checkpoint.status == PipelineStatus::Timeout {
            // Resuming a run stopped by its budget is the request for more time.
            tracing::info!(
                run_id = %run_id,
                spent_secs = checkpoint.budget_spent.as_secs(),
                "Run stopped on its pipeline budget; starting a fresh budget"
            );
            checkpoint.budget_spent = Duration::ZERO;
        }
        checkpoint.status = PipelineStatus::InProgress;
        let demoted = verify_on_resume(&mut checkpoint);
        self.save(&mut checkpoint, &mut lease)?;
        tracing::info!(
            run_id = %run_id,
            demoted = demoted.len(),
            round = checkpoint.convergence.round,
            "Resuming pipeline run"
        );

        let report = self.drive(checkpoint, &mut lease, demoted).await;
        release(lease);
        report
    }

    /// Renew the lease, then persist. A lost lease stops the session.
    fn save(&self, checkpoint: &mut Checkpoint, lease: &mut Lease) -> Result<(), PipelineError> {
        lease.renew()?;
        checkpoint.touch();
        self.store.save(checkpoint)?;
        Ok(())
    }

    fn definition(&self, name: &str) -> Result<&PhaseDefinition, PipelineError> {
        self.phases
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| PipelineError::NoHandler {
                phase: name.to_string(),
            })
    }

    async fn drive(
        &self,
        mut checkpoint: Checkpoint,
        lease: &mut Lease,
        demoted: Vec<DemotedPhase>,
    ) -> Result<PipelineReport, PipelineError> {
        let run_dir = self.run_dir(&checkpoint.id);
        let cancel = self.cancel.child_token();
        let watcher = cancel::watch_marker(&run_dir, cancel.clone(), self.marker_poll);

        let result = self.drive_loop(&mut checkpoint, lease, &run_dir, &cancel).await;
        watcher.abort();

        let failure = match result? {
            Stop::Finished => None,
            Stop::Halted(failure) => Some(failure),
        };
        let report = PipelineReport::from_checkpoint(&checkpoint, failure, demoted);
        match report.write(&run_dir) {
            Ok(path) => tracing::debug!(path = %path.display(), "Wrote run report"),
            Err(e) => tracing::warn!(error = %e, "Failed to write run report"),
        }
        Ok(report)
    }

    async fn drive_loop(
        &self,
        checkpoint: &mut Checkpoint,
        lease: &mut Lease,
        run_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Stop, PipelineError> {
        let run_id = checkpoint.id.clone();
        let clock = BudgetClock::resume(self.total_budget, checkpoint.budget_spent);

        loop {
            checkpoint.budget_spent = clock.elapsed();
            let next = scheduler::next_phase(checkpoint, &self.phases)?;

            if clock.is_exhausted() && next != NextPhase::Done {
                checkpoint.status = PipelineStatus::Timeout;
                self.save(checkpoint, lease)?;
                tracing::warn!(
                    run_id = %run_id,
                    elapsed_secs = clock.elapsed().as_secs(),
                    "Pipeline budget exhausted"
                );
                let phase = match &next {
                    NextPhase::Run(name) => Some(name.as_str()),
                    NextPhase::Done => None,
                };
                return Ok(Stop::Halted(FailureInfo::new(
                    &run_id,
                    phase,
                    format!("pipeline budget of {:?} exhausted", clock.total()),
                    true,
                )));
            }

            if cancel.is_cancelled() {
                checkpoint.status = PipelineStatus::Cancelled;
                self.save(checkpoint, lease)?;
                return Ok(Stop::Halted(FailureInfo::new(&run_id, None, "cancelled", true)));
            }

            let name = match next {
                NextPhase::Done => {
                    checkpoint.status = PipelineStatus::Completed;
                    self.save(checkpoint, lease)?;
                    tracing::info!(run_id = %run_id, "Pipeline completed");
                    return Ok(Stop::Finished);
                }
                NextPhase::Run(name) => name,
            };
            let def = self.definition(&name)?;

            if checkpoint.phase(&name).is_some_and(|p| p.status == PhaseStatus::Pending)
                && def.should_skip(&checkpoint.flags)
            {
                checkpoint.update_phase(&name, PhaseStatus::Skipped, None)?;
                self.save(checkpoint, lease)?;
                tracing::info!(run_id = %run_id, phase = %name, "Skipped phase by flag");
                continue;
            }

            let outcome = self.run_phase(checkpoint, lease, def, run_dir, cancel).await;
            checkpoint.budget_spent = clock.elapsed();
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) if matches!(e, PipelineError::Lease(_) | PipelineError::Checkpoint(_)) => {
                    return Err(e);
                }
                Err(e) => {
                    tracing::error!(run_id = %run_id, phase = %name, error = %e, "Phase dispatch failed");
                    checkpoint.update_phase(&name, PhaseStatus::Failed, None)?;
                    checkpoint.set_phase_error(&name, &e.to_string())?;
                    checkpoint.status = PipelineStatus::Failed;
                    self.save(checkpoint, lease)?;
                    return Ok(Stop::Halted(FailureInfo::new(
                        &run_id,
                        Some(&name),
                        e.to_string(),
                        !e.is_fatal(),
                    )));
                }
            };

            match scheduler::disposition(def, &outcome) {
                Disposition::Proceed => {}
                Disposition::ProceedWithWarning => {
                    tracing::warn!(
                        run_id = %run_id,
                        phase = %name,
                        status = ?outcome.status,
                        message = outcome.message.as_deref().unwrap_or(""),
                        "Advisory phase did not succeed; continuing"
                    );
                }
                Disposition::Halt => {
                    checkpoint.status = match outcome.status {
                        PhaseResultStatus::Cancelled => PipelineStatus::Cancelled,
                        _ => PipelineStatus::Failed,
                    };
                    self.save(checkpoint, lease)?;
                    let reason = outcome
                        .message
                        .clone()
                        .unwrap_or_else(|| format!("phase ended with status {:?}", outcome.status));
                    tracing::error!(run_id = %run_id, phase = %name, reason = %reason, "Pipeline halted");
                    return Ok(Stop::Halted(FailureInfo::new(&run_id, Some(&name), reason, true)));
                }
            }

            if outcome.is_success()
                && let Some(failure) = self.apply_convergence(checkpoint, &name, &outcome)?
            {
                checkpoint.status = PipelineStatus::Failed;
                self.save(checkpoint, lease)?;
                return Ok(Stop::Halted(failure));
            }
            self.save(checkpoint, lease)?;
        }
    }

    /// Dispatch one phase and record its result in the checkpoint.
    async fn run_phase(
        &self,
        checkpoint: &mut Checkpoint,
        lease: &mut Lease,
        def: &PhaseDefinition,
        run_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PhaseOutcome, PipelineError> {
        let name = def.name.as_str();
        let strategy = self
            .registry
            .get(name)
            .ok_or_else(|| PipelineError::NoHandler {
                phase: name.to_string(),
            })?;

        let group_id = def
            .has_worker_pool
            .then(|| format!("{}-{}-r{}", checkpoint.id, name, checkpoint.convergence.round));
        checkpoint.update_phase(name, PhaseStatus::InProgress, None)?;
        checkpoint.phase_mut(name)?.worker_group_id = group_id.clone();
        self.save(checkpoint, lease)?;
        tracing::info!(run_id = %checkpoint.id, phase = %name, group_id = ?group_id, "Dispatching phase");

        let ctx = scheduler::build_context(checkpoint, def, run_dir, group_id, cancel.clone());
        let mut outcome = self.dispatcher.dispatch(strategy, &ctx).await?;

        let mut artifact = None;
        if outcome.is_success() {
            match outcome.artifact_path.as_deref().map(|p| (p, hash_artifact(p))) {
                Some((path, Ok(hash))) => {
                    artifact = Some(ArtifactRef {
                        path: path.to_path_buf(),
                        hash,
                    });
                }
                Some((path, Err(e))) => {
                    outcome.status = PhaseResultStatus::Failure;
                    outcome.message = Some(format!("artifact {} is unreadable: {}", path.display(), e));
                }
                None => {
                    outcome.status = PhaseResultStatus::Failure;
                    outcome.message = Some("phase reported success without an artifact".to_string());
                }
            }
        }

        let status = scheduler::record_status(&outcome);
        checkpoint.update_phase(name, status, artifact)?;
        if status != PhaseStatus::Completed
            && let Some(message) = &outcome.message
        {
            checkpoint.set_phase_error(name, message)?;
        }
        tracing::info!(
            run_id = %checkpoint.id,
            phase = %name,
            status = %status,
            issues = ?outcome.issue_count,
            "Phase finished"
        );
        Ok(outcome)
    }

    /// Feed issue counts to the convergence gate. Returns a failure when a
    /// regression should stop the pipeline.
    fn apply_convergence(
        &self,
        checkpoint: &mut Checkpoint,
        phase: &str,
        outcome: &PhaseOutcome,
    ) -> Result<Option<FailureInfo>, PipelineError> {
        let Some(conv) = &self.convergence else {
            return Ok(None);
        };
        let Some(issues) = outcome.issue_count else {
            if phase == conv.verification {
                tracing::warn!(phase, "Verification phase reported no issue count; convergence skipped");
            }
            return Ok(None);
        };

        if phase != conv.verification {
            let before_remediation = self
                .phases
                .iter()
                .find(|d| d.name == conv.remediation)
                .zip(self.phases.iter().find(|d| d.name == phase))
                .is_some_and(|(rem, this)| this.order < rem.order);
            if before_remediation && checkpoint.convergence.round == 0 {
                checkpoint.convergence.baseline = Some(issues);
                tracing::debug!(phase, issues, "Recorded convergence baseline");
            }
            return Ok(None);
        }

        let Some(before) = checkpoint.convergence.baseline else {
            tracing::debug!(issues, "No baseline issue count; convergence skipped");
            return Ok(None);
        };

        let round = checkpoint.convergence.round;
        let verdict = checkpoint.convergence.record(&conv.gate, before, issues);
        tracing::info!(
            round,
            issues_before = before,
            issues_after = issues,
            verdict = %verdict,
            "Convergence gate evaluated"
        );

        match verdict {
            Verdict::Converged => Ok(None),
            Verdict::Retry => {
                checkpoint.reopen(&conv.remediation)?;
                checkpoint.reopen(&conv.verification)?;
                checkpoint.convergence.baseline = Some(issues);
                Ok(None)
            }
            Verdict::Halted(HaltReason::Regression) if conv.stop_on_regression => {
                // Re-verify against the same baseline after a manual fix.
                checkpoint.reopen(&conv.verification)?;
                Ok(Some(FailureInfo::new(
                    &checkpoint.id,
                    Some(phase),
                    format!("issue count did not improve ({} -> {})", before, issues),
                    true,
                )))
            }
            Verdict::Halted(reason) => {
                tracing::warn!(
                    round,
                    issues_before = before,
                    issues_after = issues,
                    reason = ?reason,
                    "Convergence halted; continuing with remaining phases"
                );
                Ok(None)
            }
        }
    }
}

fn release(lease: Lease) {
    if let Err(e) = lease.release() {
        tracing::warn!(error = %e, "Failed to release scope lease");
    }
}
