//! Phase definitions and the per-dispatch context handed to phase handlers.
//!
//! This module provides:
//! - `PhaseDefinition`, the static description of one pipeline stage
//! - `default_phases()`, the standard research → report pipeline
//! - `PhaseContext` / `PhaseOutcome`, the handler contract
//! - `validate_definitions()` for ordering and naming checks

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::ScopeDescriptor;
use crate::errors::PipelineError;
use crate::pool::PoolSummary;
use crate::util::duration_secs;

/// Static description of one pipeline phase. Not persisted in checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseDefinition {
    pub name: String,
    /// Position in the pipeline; phases run in ascending order.
    pub order: u32,
    #[serde(default)]
    pub has_worker_pool: bool,
    /// Real enforcement bound. For pool phases this is the poll hard timeout.
    #[serde(rename = "inner_timeout_secs", with = "duration_secs")]
    pub inner_timeout: Duration,
    #[serde(
        rename = "setup_budget_secs",
        with = "duration_secs",
        default = "default_setup_budget"
    )]
    pub setup_budget: Duration,
    #[serde(
        rename = "extra_budget_secs",
        with = "duration_secs::option",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub extra_budget: Option<Duration>,
    #[serde(default)]
    pub skippable: bool,
    #[serde(default = "default_true")]
    pub halts_on_failure: bool,
    /// Shell command run by the built-in command handler (direct phases).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Shell command printing the task list JSON (pool phases).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_command: Option<String>,
    /// Shell command run once per task inside its scratch directory (pool phases).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_command: Option<String>,
}

fn default_setup_budget() -> Duration {
    Duration::from_secs(60)
}

fn default_true() -> bool {
    true
}

impl PhaseDefinition {
    pub fn new(name: &str, order: u32, inner_timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            order,
            has_worker_pool: false,
            inner_timeout,
            setup_budget: default_setup_budget(),
            extra_budget: None,
            skippable: false,
            halts_on_failure: true,
            command: None,
            plan_command: None,
            task_command: None,
        }
    }

    pub fn with_worker_pool(mut self) -> Self {
        self.has_worker_pool = true;
        self
    }

    pub fn with_timeouts(
        mut self,
        inner: Duration,
        setup: Duration,
        extra: Option<Duration>,
    ) -> Self {
        self.inner_timeout = inner;
        self.setup_budget = setup;
        self.extra_budget = extra;
        self
    }

    /// Failures of an advisory phase are logged and the pipeline proceeds.
    pub fn advisory(mut self) -> Self {
        self.halts_on_failure = false;
        self
    }

    pub fn skippable(mut self) -> Self {
        self.skippable = true;
        self
    }

    pub fn with_command(mut self, command: &str) -> Self {
        self.command = Some(command.to_string());
        self
    }

    pub fn with_pool_commands(mut self, plan_command: &str, task_command: &str) -> Self {
        self.plan_command = Some(plan_command.to_string());
        self.task_command = Some(task_command.to_string());
        self
    }

    /// Checkpoint flag that skips this phase when set.
    pub fn skip_flag(&self) -> String {
        format!("skip_{}", self.name)
    }

    pub fn should_skip(&self, flags: &BTreeMap<String, bool>) -> bool {
        self.skippable && flags.get(&self.skip_flag()).copied().unwrap_or(false)
    }

    /// File name of the phase artifact, e.g. `03-implement.out`.
    pub fn artifact_file_name(&self) -> String {
        format!("{:02}-{}.out", self.order, self.name)
    }
}

/// The standard pipeline used when no `[[phases]]` are configured.
pub fn default_phases() -> Vec<PhaseDefinition> {
    let mins = |m: u64| Duration::from_secs(m * 60);
    vec![
        PhaseDefinition::new("research", 1, mins(30)),
        PhaseDefinition::new("plan", 2, mins(30)),
        PhaseDefinition::new("implement", 3, mins(60))
            .with_worker_pool()
            .with_timeouts(mins(60), mins(2), Some(mins(10))),
        PhaseDefinition::new("review", 4, mins(30)),
        PhaseDefinition::new("remediate", 5, mins(40))
            .with_worker_pool()
            .with_timeouts(mins(40), mins(2), Some(mins(5)))
            .advisory(),
        PhaseDefinition::new("verify", 6, mins(20)),
        PhaseDefinition::new("report", 7, mins(10))
            .advisory()
            .skippable(),
    ]
}

/// Sort definitions by order and reject duplicate names or positions.
pub fn validate_definitions(defs: &mut [PhaseDefinition]) -> Result<(), PipelineError> {
    if defs.is_empty() {
        return Err(PipelineError::InvalidDefinition(
            "pipeline has no phases".to_string(),
        ));
    }

    defs.sort_by_key(|d| d.order);

    let mut names = HashSet::new();
    let mut orders = HashSet::new();
    for def in defs.iter() {
        if def.name.trim().is_empty() {
            return Err(PipelineError::InvalidDefinition(format!(
                "phase at order {} has an empty name",
                def.order
            )));
        }
        if !names.insert(def.name.as_str()) {
            return Err(PipelineError::InvalidDefinition(format!(
                "duplicate phase name '{}'",
                def.name
            )));
        }
        if !orders.insert(def.order) {
            return Err(PipelineError::InvalidDefinition(format!(
                "duplicate phase order {} ('{}')",
                def.order, def.name
            )));
        }
    }
    Ok(())
}

/// Artifact produced by an already-completed upstream phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpstreamArtifact {
    pub phase: String,
    pub path: PathBuf,
}

/// Everything a handler needs to run one phase dispatch.
#[derive(Debug, Clone)]
pub struct PhaseContext {
    pub run_id: String,
    pub phase: PhaseDefinition,
    pub scope: ScopeDescriptor,
    pub flags: BTreeMap<String, bool>,
    pub upstream: Vec<UpstreamArtifact>,
    /// Well-known path this phase is expected to write its artifact to.
    pub artifact_path: PathBuf,
    /// The run directory (`.conductor/runs/<id>`).
    pub run_dir: PathBuf,
    /// Convergence round, 0 on the first pass.
    pub round: u32,
    pub worker_group_id: Option<String>,
    /// Outer deadline of this dispatch.
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

impl PhaseContext {
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn upstream_paths(&self) -> Vec<&Path> {
        self.upstream.iter().map(|u| u.path.as_path()).collect()
    }
}

/// Status a handler reports for one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseResultStatus {
    Success,
    Failure,
    Cancelled,
    Timeout,
}

/// Structured result of a phase dispatch. Handlers never raise to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseOutcome {
    pub status: PhaseResultStatus,
    pub artifact_path: Option<PathBuf>,
    /// Issue count reported by the phase, feeding the convergence gate.
    pub issue_count: Option<u32>,
    pub message: Option<String>,
    pub pool: Option<PoolSummary>,
}

impl PhaseOutcome {
    pub fn success(artifact_path: impl Into<PathBuf>) -> Self {
        Self {
            status: PhaseResultStatus::Success,
            artifact_path: Some(artifact_path.into()),
            issue_count: None,
            message: None,
            pool: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: PhaseResultStatus::Failure,
            artifact_path: None,
            issue_count: None,
            message: Some(message.into()),
            pool: None,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: PhaseResultStatus::Cancelled,
            artifact_path: None,
            issue_count: None,
            message: Some("cancelled".to_string()),
            pool: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            status: PhaseResultStatus::Timeout,
            artifact_path: None,
            issue_count: None,
            message: Some(message.into()),
            pool: None,
        }
    }

    pub fn with_issues(mut self, count: u32) -> Self {
        self.issue_count = Some(count);
        self
    }

    pub fn with_pool(mut self, summary: PoolSummary) -> Self {
        self.pool = Some(summary);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == PhaseResultStatus::Success
    }
}
