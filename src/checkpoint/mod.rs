//! Durable, versioned record of pipeline progress.
//!
//! - `types`: the checkpoint document, phase records and the transition table
//! - `store`: the injected `CheckpointStore` (filesystem by default, in-memory for tests)
//! - `migrate`: forward-only schema upgrades applied on every load
//! - `artifact`: artifact hashing and `verify_on_resume`

pub mod artifact;
pub mod migrate;
pub mod store;
pub mod types;

pub use artifact::{DemotedPhase, DemotionReason, hash_artifact, verify_on_resume};
pub use migrate::migrate;
pub use store::{CHECKPOINT_FILE, CheckpointStore, FsCheckpointStore, MemoryCheckpointStore};
pub use types::{
    ArtifactRef, CURRENT_SCHEMA_VERSION, Checkpoint, OwnerIdentity, PhaseRecord, PhaseStatus,
    PipelineStatus, ScopeDescriptor, generate_run_id,
};
