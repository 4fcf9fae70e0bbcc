use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;

use super::migrate::migrate;
use super::types::{Checkpoint, OwnerIdentity, ScopeDescriptor};
use crate::errors::CheckpointError;
use crate::phase::PhaseDefinition;
use crate::util::write_atomic;

pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Durable storage for checkpoints. The orchestrator is the single writer;
/// readers may load concurrently because every save is an atomic replace.
pub trait CheckpointStore: Send + Sync {
    /// Persist a brand-new checkpoint. Fails with `AlreadyExists`.
    fn insert(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// Load and migrate a checkpoint.
    fn load(&self, run_id: &str) -> Result<Checkpoint, CheckpointError>;

    /// Atomically replace a checkpoint.
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    fn exists(&self, run_id: &str) -> bool;

    /// All run ids, sorted.
    fn list(&self) -> Result<Vec<String>, CheckpointError>;

    fn create(
        &self,
        run_id: &str,
        scope: ScopeDescriptor,
        flags: BTreeMap<String, bool>,
        definitions: &[PhaseDefinition],
        owner: OwnerIdentity,
    ) -> Result<Checkpoint, CheckpointError> {
        if self.exists(run_id) {
            return Err(CheckpointError::AlreadyExists {
                run_id: run_id.to_string(),
            });
        }
        let checkpoint = Checkpoint::new(run_id, scope, flags, definitions, owner);
        self.insert(&checkpoint)?;
        Ok(checkpoint)
    }

    /// Most recently updated run. Unreadable checkpoints are skipped.
    fn latest(&self) -> Result<Option<String>, CheckpointError> {
        let mut best: Option<Checkpoint> = None;
        for run_id in self.list()? {
            match self.load(&run_id) {
                Ok(cp) => {
                    if best.as_ref().is_none_or(|b| cp.updated_at >= b.updated_at) {
                        best = Some(cp);
                    }
                }
                Err(e) => tracing::warn!(run_id = %run_id, error = %e, "Skipping unreadable checkpoint"),
            }
        }
        Ok(best.map(|cp| cp.id))
    }

    /// Every readable checkpoint, in run id order.
    fn load_all(&self) -> Result<Vec<Checkpoint>, CheckpointError> {
        let mut out = Vec::new();
        for run_id in self.list()? {
            match self.load(&run_id) {
                Ok(cp) => out.push(cp),
                Err(e) => tracing::warn!(run_id = %run_id, error = %e, "Skipping unreadable checkpoint"),
            }
        }
        Ok(out)
    }
}

fn decode(raw: Value, path: &Path) -> Result<Checkpoint, CheckpointError> {
    let migrated = migrate(raw).map_err(|e| match e {
        CheckpointError::Corrupt { message, .. } => CheckpointError::Corrupt {
            path: path.to_path_buf(),
            message,
        },
        other => other,
    })?;
    serde_json::from_value(migrated).map_err(|e| CheckpointError::Corrupt {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn is_valid_run_id(run_id: &str) -> bool {
    !run_id.is_empty()
        && !run_id.contains(['/', '\\'])
        && run_id != "."
        && run_id != ".."
}

/// Filesystem store: one `<runs_dir>/<run_id>/checkpoint.json` per run.
pub struct FsCheckpointStore {
    runs_dir: PathBuf,
}

impl FsCheckpointStore {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
        }
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }

    pub fn checkpoint_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join(CHECKPOINT_FILE)
    }

    fn write(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let path = self.checkpoint_path(&checkpoint.id);
        let json = serde_json::to_vec_pretty(checkpoint).map_err(CheckpointError::Serialize)?;
        write_atomic(&path, &json).map_err(|source| CheckpointError::Io { path, source })
    }
}

impl CheckpointStore for FsCheckpointStore {
    fn insert(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        if !is_valid_run_id(&checkpoint.id) || self.exists(&checkpoint.id) {
            return Err(CheckpointError::AlreadyExists {
                run_id: checkpoint.id.clone(),
            });
        }
        self.write(checkpoint)?;
        tracing::info!(run_id = %checkpoint.id, "Created checkpoint");
        Ok(())
    }

    fn load(&self, run_id: &str) -> Result<Checkpoint, CheckpointError> {
        if !is_valid_run_id(run_id) {
            return Err(CheckpointError::NotFound {
                run_id: run_id.to_string(),
            });
        }
        let path = self.checkpoint_path(run_id);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CheckpointError::NotFound {
                    run_id: run_id.to_string(),
                });
            }
            Err(source) => return Err(CheckpointError::Io { path, source }),
        };
        let raw: Value = serde_json::from_str(&content).map_err(|e| CheckpointError::Corrupt {
            path: path.clone(),
            message: e.to_string(),
        })?;
        decode(raw, &path)
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.write(checkpoint)?;
        tracing::debug!(
            run_id = %checkpoint.id,
            sequence = checkpoint.phase_sequence_counter,
            "Saved checkpoint"
        );
        Ok(())
    }

    fn exists(&self, run_id: &str) -> bool {
        is_valid_run_id(run_id) && self.checkpoint_path(run_id).exists()
    }

    fn list(&self) -> Result<Vec<String>, CheckpointError> {
        let entries = match fs::read_dir(&self.runs_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: self.runs_dir.clone(),
                    source,
                });
            }
        };

        let mut ids: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().join(CHECKPOINT_FILE).is_file())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// In-memory store, holding the serialized form so loads exercise migration.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    docs: Mutex<HashMap<String, Value>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a raw document as-is, e.g. an old-schema checkpoint.
    pub fn insert_raw(&self, run_id: &str, doc: Value) {
        self.docs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(run_id.to_string(), doc);
    }

    fn put(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let doc = serde_json::to_value(checkpoint).map_err(CheckpointError::Serialize)?;
        self.insert_raw(&checkpoint.id, doc);
        Ok(())
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn insert(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        if self.exists(&checkpoint.id) {
            return Err(CheckpointError::AlreadyExists {
                run_id: checkpoint.id.clone(),
            });
        }
        self.put(checkpoint)
    }

    fn load(&self, run_id: &str) -> Result<Checkpoint, CheckpointError> {
        let raw = self
            .docs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(run_id)
            .cloned()
            .ok_or_else(|| CheckpointError::NotFound {
                run_id: run_id.to_string(),
            })?;
        decode(raw, Path::new(run_id))
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.put(checkpoint)
    }

    fn exists(&self, run_id: &str) -> bool {
        self.docs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(run_id)
    }

    fn list(&self) -> Result<Vec<String>, CheckpointError> {
        let mut ids: Vec<String> = self
            .docs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        Ok(ids)
    }
}
