use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::convergence::ConvergenceState;
use crate::errors::CheckpointError;
use crate::phase::PhaseDefinition;
use crate::util::duration_secs;

pub const CURRENT_SCHEMA_VERSION: u32 = 3;

/// Status of a single phase record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Skipped,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Skipped => "skipped",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }

    /// Completed or skipped: the scheduler never picks these again.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    /// Non-success terminal states that a resume may re-dispatch.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled | Self::Timeout)
    }

    /// Forward-only transition table. Demotion of a completed phase is not a
    /// transition and goes through `Checkpoint::demote`.
    pub fn can_transition_to(&self, to: PhaseStatus) -> bool {
        use PhaseStatus::*;
        matches!(
            (self, to),
            (Pending, Skipped)
                | (Pending, InProgress)
                | (InProgress, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Cancelled)
                | (InProgress, Timeout)
                | (Failed, InProgress)
                | (Cancelled, InProgress)
                | (Timeout, InProgress)
        )
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall status of a pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    #[default]
    InProgress,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a pipeline run processes. The id is also the lease key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeDescriptor {
    pub id: String,
    #[serde(default)]
    pub description: String,
}

impl ScopeDescriptor {
    pub fn new(id: &str, description: &str) -> Self {
        Self {
            id: id.to_string(),
            description: description.to_string(),
        }
    }
}

/// Identity of the orchestrator process that owns a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerIdentity {
    /// 0 means unknown (e.g. migrated from an older schema).
    pub process_id: u32,
    #[serde(default)]
    pub config_scope_id: String,
}

impl OwnerIdentity {
    pub fn current(config_scope_id: &str) -> Self {
        Self {
            process_id: std::process::id(),
            config_scope_id: config_scope_id.to_string(),
        }
    }
}

/// Persisted progress of one phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub name: String,
    #[serde(default)]
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_hash: Option<String>,
    #[serde(default)]
    pub worker_group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Value of the checkpoint sequence counter at this phase's last transition.
    #[serde(default)]
    pub sequence: u64,
    /// How many times this phase was sent back to pending, by a convergence
    /// retry or a resume-time demotion.
    #[serde(default)]
    pub reopened: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PhaseRecord {
    pub fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }
}

/// Path and content hash of a finished phase artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub path: PathBuf,
    pub hash: String,
}

/// Durable record of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub schema_version: u32,
    pub scope: ScopeDescriptor,
    #[serde(default)]
    pub flags: BTreeMap<String, bool>,
    #[serde(default)]
    pub phase_sequence_counter: u64,
    #[serde(default)]
    pub status: PipelineStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Phase records in pipeline order.
    pub phases: Vec<PhaseRecord>,
    #[serde(default)]
    pub convergence: ConvergenceState,
    #[serde(default)]
    pub owner: OwnerIdentity,
    /// Pipeline budget consumed by the sessions that have driven this run.
    #[serde(default, rename = "budget_spent_secs", with = "duration_secs")]
    pub budget_spent: Duration,
    /// Fields written by newer versions are carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Generate a run id such as `run-20260101-120000-1a2b3c4d`.
pub fn generate_run_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("run-{}-{}", Utc::now().format("%Y%m%d-%H%M%S"), &uuid[..8])
}

impl Checkpoint {
    pub fn new(
        run_id: &str,
        scope: ScopeDescriptor,
        flags: BTreeMap<String, bool>,
        definitions: &[PhaseDefinition],
        owner: OwnerIdentity,
    ) -> Self {
        let now = Utc::now();
        let mut ordered: Vec<&PhaseDefinition> = definitions.iter().collect();
        ordered.sort_by_key(|d| d.order);

        Self {
            id: run_id.to_string(),
            schema_version: CURRENT_SCHEMA_VERSION,
            scope,
            flags,
            phase_sequence_counter: 0,
            status: PipelineStatus::InProgress,
            started_at: now,
            updated_at: now,
            phases: ordered
                .into_iter()
                .map(|d| PhaseRecord::pending(&d.name))
                .collect(),
            convergence: ConvergenceState::default(),
            owner,
            budget_spent: Duration::ZERO,
            extra: Map::new(),
        }
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseRecord> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn phase_mut(&mut self, name: &str) -> Result<&mut PhaseRecord, CheckpointError> {
        self.phases
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| CheckpointError::UnknownPhase {
                phase: name.to_string(),
            })
    }

    pub fn flag(&self, name: &str) -> bool {
        self.flags.get(name).copied().unwrap_or(false)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Move a phase to `to`, enforcing the transition table.
    ///
    /// Re-recording `completed` or `skipped` on a phase already in that state is
    /// a no-op, so replaying an update after a crash is harmless.
    pub fn update_phase(
        &mut self,
        name: &str,
        to: PhaseStatus,
        artifact: Option<ArtifactRef>,
    ) -> Result<(), CheckpointError> {
        let now = Utc::now();
        let record = self.phase_mut(name)?;
        let from = record.status;

        if from == to && to.is_done() {
            return Ok(());
        }
        if !from.can_transition_to(to) {
            return Err(CheckpointError::InvalidTransition {
                phase: name.to_string(),
                from,
                to,
            });
        }

        record.status = to;
        match to {
            PhaseStatus::InProgress => {
                record.started_at = Some(now);
                record.completed_at = None;
                record.error = None;
            }
            PhaseStatus::Completed => {
                record.completed_at = Some(now);
                record.error = None;
            }
            _ => {}
        }
        if let Some(artifact) = artifact {
            record.artifact_path = Some(artifact.path);
            record.artifact_hash = Some(artifact.hash);
        }

        self.phase_sequence_counter += 1;
        let sequence = self.phase_sequence_counter;
        if let Ok(record) = self.phase_mut(name) {
            record.sequence = sequence;
        }
        self.updated_at = now;
        Ok(())
    }

    pub fn set_phase_error(&mut self, name: &str, error: &str) -> Result<(), CheckpointError> {
        self.phase_mut(name)?.error = Some(error.to_string());
        Ok(())
    }

    /// Send a completed phase back to `pending` so it runs again.
    /// The artifact hash is dropped; the path is kept as the rewrite target.
    pub fn demote(&mut self, name: &str) -> Result<(), CheckpointError> {
        let record = self.phase_mut(name)?;
        if record.status != PhaseStatus::Completed {
            return Err(CheckpointError::InvalidTransition {
                phase: name.to_string(),
                from: record.status,
                to: PhaseStatus::Pending,
            });
        }
        record.status = PhaseStatus::Pending;
        record.artifact_hash = None;
        record.completed_at = None;
        record.reopened += 1;
        self.bump_sequence(name);
        Ok(())
    }

    /// Reopen a finished phase for a convergence retry.
    pub fn reopen(&mut self, name: &str) -> Result<(), CheckpointError> {
        let record = self.phase_mut(name)?;
        let from = record.status;
        if !(from.is_done() || from.is_interrupted()) {
            return Err(CheckpointError::InvalidTransition {
                phase: name.to_string(),
                from,
                to: PhaseStatus::Pending,
            });
        }
        record.status = PhaseStatus::Pending;
        record.artifact_hash = None;
        record.completed_at = None;
        record.error = None;
        record.reopened += 1;
        self.bump_sequence(name);
        Ok(())
    }

    fn bump_sequence(&mut self, name: &str) {
        self.phase_sequence_counter += 1;
        let sequence = self.phase_sequence_counter;
        if let Ok(record) = self.phase_mut(name) {
            record.sequence = sequence;
        }
        self.touch();
    }

    /// The phase currently marked in progress, if any.
    pub fn active_phase(&self) -> Option<&PhaseRecord> {
        self.phases
            .iter()
            .find(|p| p.status == PhaseStatus::InProgress)
    }

    /// `(phase, artifact path)` for every completed phase, in pipeline order.
    pub fn completed_artifacts(&self) -> Vec<(String, PathBuf)> {
        self.phases
            .iter()
            .filter(|p| p.status == PhaseStatus::Completed)
            .filter_map(|p| p.artifact_path.clone().map(|a| (p.name.clone(), a)))
            .collect()
    }

    pub fn is_finished(&self) -> bool {
        self.status == PipelineStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn checkpoint(names: &[&str]) -> Checkpoint {
        let defs: Vec<_> = names
            .iter()
            .enumerate()
            .map(|(i, n)| PhaseDefinition::new(n, i as u32 + 1, Duration::from_secs(10)))
            .collect();
        Checkpoint::new(
            "run-1",
            ScopeDescriptor::new("repo", "test"),
            BTreeMap::new(),
            &defs,
            OwnerIdentity::current("cfg"),
        )
    }

    fn artifact(path: &str) -> Option<ArtifactRef> {
        Some(ArtifactRef {
            path: PathBuf::from(path),
            hash: "abc".into(),
        })
    }

    #[test]
    fn test_new_checkpoint_has_pending_phases_in_order() {
        let cp = checkpoint(&["a", "b", "c"]);
        assert_eq!(cp.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(cp.status, PipelineStatus::InProgress);
        let names: Vec<_> = cp.phases.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(cp.phases.iter().all(|p| p.status == PhaseStatus::Pending));
    }

    #[test]
    fn test_forward_transitions_stamp_sequence_and_times() {
        let mut cp = checkpoint(&["a"]);
        cp.update_phase("a", PhaseStatus::InProgress, None).unwrap();
        assert!(cp.phase("a").unwrap().started_at.is_some());
        assert_eq!(cp.phase("a").unwrap().sequence, 1);

        cp.update_phase("a", PhaseStatus::Completed, artifact("/a.out"))
            .unwrap();
        let rec = cp.phase("a").unwrap();
        assert_eq!(rec.status, PhaseStatus::Completed);
        assert!(rec.completed_at.is_some());
        assert_eq!(rec.artifact_hash.as_deref(), Some("abc"));
        assert_eq!(cp.phase_sequence_counter, 2);
    }

    #[test]
    fn test_completed_cannot_be_reentered() {
        let mut cp = checkpoint(&["a"]);
        cp.update_phase("a", PhaseStatus::InProgress, None).unwrap();
        cp.update_phase("a", PhaseStatus::Completed, None).unwrap();

        let err = cp
            .update_phase("a", PhaseStatus::InProgress, None)
            .unwrap_err();
        assert!(matches!(err, CheckpointError::InvalidTransition { .. }));

        // Re-recording completion is a harmless no-op.
        let before = cp.phase_sequence_counter;
        cp.update_phase("a", PhaseStatus::Completed, None).unwrap();
        assert_eq!(cp.phase_sequence_counter, before);
    }

    #[test]
    fn test_pending_cannot_jump_to_completed() {
        let mut cp = checkpoint(&["a"]);
        assert!(cp.update_phase("a", PhaseStatus::Completed, None).is_err());
        assert!(cp.update_phase("missing", PhaseStatus::InProgress, None).is_err());
    }

    #[test]
    fn test_failed_phase_can_be_redispatched() {
        let mut cp = checkpoint(&["a"]);
        cp.update_phase("a", PhaseStatus::InProgress, None).unwrap();
        cp.update_phase("a", PhaseStatus::Failed, None).unwrap();
        cp.set_phase_error("a", "boom").unwrap();
        cp.update_phase("a", PhaseStatus::InProgress, None).unwrap();
        assert!(cp.phase("a").unwrap().error.is_none());
    }

    #[test]
    fn test_demote_only_from_completed() {
        let mut cp = checkpoint(&["a", "b"]);
        assert!(cp.demote("a").is_err());

        cp.update_phase("a", PhaseStatus::InProgress, None).unwrap();
        cp.update_phase("a", PhaseStatus::Completed, artifact("/a.out"))
            .unwrap();
        cp.demote("a").unwrap();

        let rec = cp.phase("a").unwrap();
        assert_eq!(rec.status, PhaseStatus::Pending);
        assert!(rec.artifact_hash.is_none());
        assert_eq!(rec.artifact_path.as_deref(), Some(std::path::Path::new("/a.out")));
    }

    #[test]
    fn test_reopen_counts_and_allows_failed() {
        let mut cp = checkpoint(&["fix", "check"]);
        cp.update_phase("fix", PhaseStatus::InProgress, None).unwrap();
        cp.update_phase("fix", PhaseStatus::Failed, None).unwrap();
        cp.reopen("fix").unwrap();
        assert_eq!(cp.phase("fix").unwrap().reopened, 1);
        assert_eq!(cp.phase("fix").unwrap().status, PhaseStatus::Pending);

        assert!(cp.reopen("check").is_err());
    }

    #[test]
    fn test_active_phase_and_completed_artifacts() {
        let mut cp = checkpoint(&["a", "b"]);
        cp.update_phase("a", PhaseStatus::InProgress, None).unwrap();
        cp.update_phase("a", PhaseStatus::Completed, artifact("/a.out"))
            .unwrap();
        cp.update_phase("b", PhaseStatus::InProgress, None).unwrap();

        assert_eq!(cp.active_phase().unwrap().name, "b");
        assert_eq!(
            cp.completed_artifacts(),
            vec![("a".to_string(), PathBuf::from("/a.out"))]
        );
    }

    #[test]
    fn test_unknown_fields_survive_roundtrip() {
        let mut value = serde_json::to_value(checkpoint(&["a"])).unwrap();
        value["future_field"] = serde_json::json!({"x": 1});
        value["phases"][0]["annotation"] = serde_json::json!("keep me");

        let cp: Checkpoint = serde_json::from_value(value).unwrap();
        let back = serde_json::to_value(&cp).unwrap();
        assert_eq!(back["future_field"]["x"], 1);
        assert_eq!(back["phases"][0]["annotation"], "keep me");
    }

    #[test]
    fn test_generate_run_id_shape() {
        let id = generate_run_id();
        assert!(id.starts_with("run-"));
        assert_ne!(id, generate_run_id());
    }
}
