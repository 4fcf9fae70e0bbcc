//! Artifact hashing and resume-time verification.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::types::{Checkpoint, PhaseStatus};

/// Hex-encoded SHA-256 of a file, streamed.
pub fn hash_artifact(path: &Path) -> std::io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DemotionReason {
    MissingArtifact,
    NoRecordedHash,
    HashMismatch { expected: String, actual: String },
}

impl fmt::Display for DemotionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingArtifact => write!(f, "artifact is missing"),
            Self::NoRecordedHash => write!(f, "no artifact hash was recorded"),
            Self::HashMismatch { expected, actual } => write!(
                f,
                "artifact changed (expected {}, found {})",
                &expected[..expected.len().min(12)],
                &actual[..actual.len().min(12)]
            ),
        }
    }
}

/// A completed phase sent back to `pending` by `verify_on_resume`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DemotedPhase {
    pub name: String,
    pub reason: DemotionReason,
}

/// Re-hash every completed phase's artifact and demote the ones that no
/// longer match. Returns the demotions in pipeline order.
///
/// Running this twice with unchanged artifacts demotes nothing the second time.
pub fn verify_on_resume(checkpoint: &mut Checkpoint) -> Vec<DemotedPhase> {
    let mut pending = Vec::new();

    for record in checkpoint
        .phases
        .iter()
        .filter(|p| p.status == PhaseStatus::Completed)
    {
        let reason = match (&record.artifact_path, &record.artifact_hash) {
            (None, _) => Some(DemotionReason::MissingArtifact),
            (Some(path), expected) => match hash_artifact(path) {
                Err(_) => Some(DemotionReason::MissingArtifact),
                Ok(actual) => match expected {
                    None => Some(DemotionReason::NoRecordedHash),
                    Some(expected) if *expected != actual => Some(DemotionReason::HashMismatch {
                        expected: expected.clone(),
                        actual,
                    }),
                    Some(_) => None,
                },
            },
        };
        if let Some(reason) = reason {
            pending.push(DemotedPhase {
                name: record.name.clone(),
                reason,
            });
        }
    }

    let mut demoted = Vec::with_capacity(pending.len());
    for phase in pending {
        match checkpoint.demote(&phase.name) {
            Ok(()) => {
                tracing::warn!(phase = %phase.name, reason = %phase.reason, "Demoted phase on resume");
                demoted.push(phase);
            }
            Err(e) => tracing::error!(phase = %phase.name, error = %e, "Failed to demote phase"),
        }
    }
    demoted
}
