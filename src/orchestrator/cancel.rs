//! Cross-process cancellation.
//!
//! `conductor cancel` drops a marker file into the run directory. The owning
//! orchestrator watches for it and trips its cancellation token. When no live
//! process owns the run, the checkpoint is marked cancelled directly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{CheckpointStore, PhaseStatus, PipelineStatus};
use crate::errors::PipelineError;
use crate::lease::LivenessProbe;

pub const CANCEL_MARKER: &str = "cancel";
pub const DEFAULT_MARKER_POLL: Duration = Duration::from_secs(1);

pub fn marker_path(run_dir: &Path) -> PathBuf {
    run_dir.join(CANCEL_MARKER)
}

pub fn write_marker(run_dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(run_dir)?;
    std::fs::write(marker_path(run_dir), chrono::Utc::now().to_rfc3339())
}

pub fn clear_marker(run_dir: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(marker_path(run_dir)) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Cancel `token` once the marker appears. Stops when the token is cancelled
/// for any other reason.
pub fn watch_marker(run_dir: &Path, token: CancellationToken, interval: Duration) -> JoinHandle<()> {
    let marker = marker_path(run_dir);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if marker.exists() {
                tracing::warn!(marker = %marker.display(), "Cancel requested");
                token.cancel();
                return;
            }
        }
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// A live orchestrator owns the run and will stop at its next check.
    Signalled { owner_pid: u32 },
    /// Nobody owned the run; the checkpoint was marked cancelled here.
    MarkedDirectly { phase: Option<String> },
    AlreadyFinished { status: PipelineStatus },
}

/// Request cancellation of `run_id`.
pub fn request_cancel(
    store: &dyn CheckpointStore,
    run_dir: &Path,
    run_id: &str,
    probe: &dyn LivenessProbe,
) -> Result<CancelOutcome, PipelineError> {
    let mut checkpoint = store.load(run_id)?;
    if checkpoint.status != PipelineStatus::InProgress {
        return Ok(CancelOutcome::AlreadyFinished {
            status: checkpoint.status,
        });
    }

    let owner_pid = checkpoint.owner.process_id;
    if owner_pid != 0 && owner_pid != std::process::id() && probe.is_alive(owner_pid) {
        write_marker(run_dir).map_err(|e| PipelineError::Other(e.into()))?;
        tracing::info!(run_id, owner_pid, "Wrote cancel marker for running orchestrator");
        return Ok(CancelOutcome::Signalled { owner_pid });
    }

    let phase = checkpoint.active_phase().map(|p| p.name.clone());
    if let Some(name) = &phase {
        checkpoint.update_phase(name, PhaseStatus::Cancelled, None)?;
        checkpoint.set_phase_error(name, "cancelled while no orchestrator was running")?;
    }
    checkpoint.status = PipelineStatus::Cancelled;
    checkpoint.touch();
    store.save(&checkpoint)?;
    tracing::info!(run_id, phase = ?phase, "Marked orphaned run cancelled");
    Ok(CancelOutcome::MarkedDirectly { phase })
}
