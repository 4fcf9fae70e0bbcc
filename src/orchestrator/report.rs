//! End-of-session summary of a pipeline run.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::checkpoint::{Checkpoint, DemotedPhase, PhaseStatus, PipelineStatus};
use crate::convergence::ConvergenceState;
use crate::util::write_atomic;

pub const REPORT_FILE: &str = "report.json";

/// The exact command that resumes `run_id`.
pub fn resume_command(run_id: &str) -> String {
    format!("conductor run --resume {}", run_id)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseSummary {
    pub name: String,
    pub status: PhaseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub reopened: u32,
}

/// Why a session stopped short of completing the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureInfo {
    /// Phase that failed or was interrupted, if the stop happened inside one.
    pub phase: Option<String>,
    pub reason: String,
    pub resumable: bool,
    pub resume_command: String,
}

impl FailureInfo {
    pub fn new(run_id: &str, phase: Option<&str>, reason: impl Into<String>, resumable: bool) -> Self {
        Self {
            phase: phase.map(str::to_string),
            reason: reason.into(),
            resumable,
            resume_command: resume_command(run_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineReport {
    pub run_id: String,
    pub status: PipelineStatus,
    pub phases: Vec<PhaseSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,
    /// Phases sent back to pending because their artifacts changed.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub demoted: Vec<DemotedPhase>,
    pub convergence: ConvergenceState,
}

impl PipelineReport {
    pub fn from_checkpoint(
        checkpoint: &Checkpoint,
        failure: Option<FailureInfo>,
        demoted: Vec<DemotedPhase>,
    ) -> Self {
        Self {
            run_id: checkpoint.id.clone(),
            status: checkpoint.status,
            phases: checkpoint
                .phases
                .iter()
                .map(|p| PhaseSummary {
                    name: p.name.clone(),
                    status: p.status,
                    artifact_path: p.artifact_path.clone(),
                    error: p.error.clone(),
                    reopened: p.reopened,
                })
                .collect(),
            failure,
            demoted,
            convergence: checkpoint.convergence.clone(),
        }
    }

    /// Report for a run nobody is driving right now, as shown by `status`.
    /// The stopping phase is the most recently touched interrupted one.
    pub fn from_stored(checkpoint: &Checkpoint) -> Self {
        let failure = match checkpoint.status {
            PipelineStatus::Completed | PipelineStatus::InProgress => None,
            status => {
                let phase = checkpoint
                    .phases
                    .iter()
                    .filter(|p| p.status.is_interrupted())
                    .max_by_key(|p| p.sequence);
                let reason = phase
                    .and_then(|p| p.error.clone())
                    .unwrap_or_else(|| format!("run ended with status {}", status));
                Some(FailureInfo::new(
                    &checkpoint.id,
                    phase.map(|p| p.name.as_str()),
                    reason,
                    true,
                ))
            }
        };
        Self::from_checkpoint(checkpoint, failure, Vec::new())
    }

    pub fn is_success(&self) -> bool {
        self.status == PipelineStatus::Completed
    }

    /// Write `report.json` into the run directory.
    pub fn write(&self, run_dir: &Path) -> std::io::Result<PathBuf> {
        let path = run_dir.join(REPORT_FILE);
        let json = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
        write_atomic(&path, &json)?;
        Ok(path)
    }
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {}: {}", self.run_id, self.status)?;
        for phase in &self.phases {
            write!(f, "  {:<12} {}", phase.name, phase.status)?;
            if let Some(error) = &phase.error {
                write!(f, " ({})", error)?;
            }
            writeln!(f)?;
        }
        if let Some(failure) = &self.failure {
            match &failure.phase {
                Some(phase) => writeln!(f, "Stopped in phase {}: {}", phase, failure.reason)?,
                None => writeln!(f, "Stopped: {}", failure.reason)?,
            }
            if failure.resumable {
                writeln!(f, "Resume with: {}", failure.resume_command)?;
            } else {
                writeln!(f, "Not resumable without manual intervention")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{OwnerIdentity, ScopeDescriptor};
    use crate::phase::PhaseDefinition;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::tempdir;

    fn checkpoint() -> Checkpoint {
        Checkpoint::new(
            "run-7",
            ScopeDescriptor::new("scope", ""),
            BTreeMap::new(),
            &[
                PhaseDefinition::new("plan", 1, Duration::from_secs(1)),
                PhaseDefinition::new("build", 2, Duration::from_secs(1)),
            ],
            OwnerIdentity::current("cfg"),
        )
    }

    #[test]
    fn test_failure_names_phase_and_resume_command() {
        let mut cp = checkpoint();
        cp.status = PipelineStatus::Failed;
        let failure = FailureInfo::new("run-7", Some("build"), "command exited with 1", true);
        let report = PipelineReport::from_checkpoint(&cp, Some(failure), Vec::new());

        let text = report.to_string();
        assert!(text.contains("Stopped in phase build"));
        assert!(text.contains("conductor run --resume run-7"));
        assert!(!report.is_success());
    }

    #[test]
    fn test_write_report_json() {
        let dir = tempdir().unwrap();
        let report = PipelineReport::from_checkpoint(&checkpoint(), None, Vec::new());
        let path = report.write(dir.path()).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(json["run_id"], "run-7");
        assert_eq!(json["phases"][1]["name"], "build");
        assert!(json.get("failure").is_none());
    }

    #[test]
    fn test_from_stored_picks_latest_interrupted_phase() {
        let mut cp = checkpoint();
        cp.update_phase("plan", PhaseStatus::InProgress, None).unwrap();
        cp.update_phase("plan", PhaseStatus::Failed, None).unwrap();
        cp.update_phase("build", PhaseStatus::InProgress, None).unwrap();
        cp.update_phase("build", PhaseStatus::Timeout, None).unwrap();
        cp.set_phase_error("build", "exceeded 1s").unwrap();
        cp.status = PipelineStatus::Failed;

        let report = PipelineReport::from_stored(&cp);
        let failure = report.failure.unwrap();
        assert_eq!(failure.phase.as_deref(), Some("build"));
        assert_eq!(failure.reason, "exceeded 1s");

        cp.status = PipelineStatus::InProgress;
        assert!(PipelineReport::from_stored(&cp).failure.is_none());
    }
}
