//! Typed error hierarchy for the conductor orchestrator.
//!
//! One enum per subsystem:
//! - `CheckpointError` — checkpoint persistence, migration and phase transitions
//! - `LeaseError` — scope ownership between orchestrator instances
//! - `PoolError` — worker group configuration and lifecycle
//! - `BrokerError` — shared-resource commits
//! - `SchedulerError` — phase ordering and checkpoint consistency
//! - `PipelineError` — top-level orchestration failures

use std::path::PathBuf;

use thiserror::Error;

use crate::checkpoint::PhaseStatus;

/// Errors from the checkpoint store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint for run {run_id} already exists")]
    AlreadyExists { run_id: String },

    #[error("Checkpoint for run {run_id} not found")]
    NotFound { run_id: String },

    #[error("Checkpoint at {path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("Checkpoint schema version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("Checkpoint schema version {found} is not a valid version")]
    InvalidVersion { found: String },

    #[error("Phase {phase} is not part of this checkpoint")]
    UnknownPhase { phase: String },

    #[error("Invalid transition for phase {phase}: {from} -> {to}")]
    InvalidTransition {
        phase: String,
        from: PhaseStatus,
        to: PhaseStatus,
    },

    #[error("Checkpoint I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize checkpoint: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Errors from the lock/lease guard.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// Another live orchestrator owns the scope. Wait, or cancel the other run.
    #[error(
        "Scope {scope_id} is already locked by process {owner_pid} (run {run_id}); wait for it or run 'conductor cancel {run_id}'"
    )]
    AlreadyLocked {
        scope_id: String,
        owner_pid: u32,
        run_id: String,
    },

    #[error("Lease file at {path} is unreadable: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("Lease I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LeaseError {
    /// Whether waiting and retrying could succeed.
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::AlreadyLocked { .. })
    }
}

/// Errors from the worker pool coordinator.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Duplicate task id: {id}")]
    DuplicateTask { id: String },

    #[error("Task {task} is blocked by unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },

    #[error("Cycle detected in task dependencies. Involved tasks: {tasks:?}")]
    DependencyCycle { tasks: Vec<String> },

    #[error("Worker group {group_id} not found")]
    GroupNotFound { group_id: String },

    #[error("Worker group {group_id} already exists")]
    GroupExists { group_id: String },

    #[error("Failed to archive worker group {group_id} at {path}: {message}")]
    Archive {
        group_id: String,
        path: PathBuf,
        message: String,
    },
}

/// Errors from the commit broker and shared resources.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("Shared resource I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Changeset path {path} escapes the shared resource root")]
    InvalidPath { path: PathBuf },

    #[error("{path} is not UTF-8 text and cannot be merged")]
    NotText { path: PathBuf },

    #[error("Commit ledger at {path} is unreadable: {message}")]
    Ledger { path: PathBuf, message: String },

    #[error("Commit broker is no longer running")]
    Closed,
}

/// Errors from the phase scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(
        "Phase {later} completed at {later_at} before earlier phase {earlier} ({earlier_at}); checkpoint is inconsistent"
    )]
    TimestampRegression {
        earlier: String,
        earlier_at: String,
        later: String,
        later_at: String,
    },

    #[error("Checkpoint phase {phase} has no definition in the configured pipeline")]
    MissingDefinition { phase: String },
}

/// Errors from the pipeline orchestrator.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(
        "Phase {phase} inner timeout ({inner_secs:.1}s) must be strictly less than its outer budget ({outer_secs:.1}s)"
    )]
    InvalidBudget {
        phase: String,
        inner_secs: f64,
        outer_secs: f64,
    },

    #[error("Invalid pipeline definition: {0}")]
    InvalidDefinition(String),

    #[error("No handler registered for phase {phase}")]
    NoHandler { phase: String },

    #[error("Handler for phase {phase} does not match its definition (worker pool: {expects_pool})")]
    StrategyMismatch { phase: String, expects_pool: bool },

    #[error("No checkpoint found to resume")]
    NothingToResume,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Fatal errors need manual intervention before a resume can succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Checkpoint(CheckpointError::Corrupt { .. })
                | Self::Checkpoint(CheckpointError::UnsupportedVersion { .. })
                | Self::Checkpoint(CheckpointError::InvalidVersion { .. })
                | Self::Pool(PoolError::DependencyCycle { .. })
                | Self::Pool(PoolError::UnknownDependency { .. })
                | Self::Pool(PoolError::DuplicateTask { .. })
                | Self::Scheduler(SchedulerError::TimestampRegression { .. })
                | Self::Lease(LeaseError::AlreadyLocked { .. })
        )
    }
}
