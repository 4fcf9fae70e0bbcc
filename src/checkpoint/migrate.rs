//! Forward-only schema migration for persisted checkpoints.
//!
//! Every step only adds fields with defaults; nothing is removed or renamed,
//! and running a step on a document that already has its fields changes nothing.

use std::path::PathBuf;

use serde_json::{Map, Value, json};

use super::types::CURRENT_SCHEMA_VERSION;
use crate::errors::CheckpointError;

type Step = fn(&mut Map<String, Value>);

/// `(from_version, step)`; applying the step yields `from_version + 1`.
const STEPS: &[(u32, Step)] = &[(1, v1_to_v2), (2, v2_to_v3)];

/// Schema version of a raw document. Documents written before versioning
/// existed carry no field and are version 1; anything that is not a version
/// this crate could have written is rejected.
pub fn schema_version(value: &Value) -> Result<u32, CheckpointError> {
    let Some(raw) = value.get("schema_version") else {
        return Ok(1);
    };
    raw.as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .filter(|v| *v >= 1)
        .ok_or_else(|| CheckpointError::InvalidVersion {
            found: raw.to_string(),
        })
}

/// Upgrade a raw checkpoint document to `CURRENT_SCHEMA_VERSION`.
pub fn migrate(mut value: Value) -> Result<Value, CheckpointError> {
    let mut version = schema_version(&value)?;
    if version > CURRENT_SCHEMA_VERSION {
        return Err(CheckpointError::UnsupportedVersion {
            found: version,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }

    let obj = value.as_object_mut().ok_or_else(|| CheckpointError::Corrupt {
        path: PathBuf::new(),
        message: "checkpoint is not a JSON object".to_string(),
    })?;

    for (from, step) in STEPS {
        if version == *from {
            step(obj);
            version = from + 1;
            obj.insert("schema_version".to_string(), json!(version));
            tracing::debug!(from, to = version, "Migrated checkpoint schema");
        }
    }

    obj.insert("schema_version".to_string(), json!(CURRENT_SCHEMA_VERSION));
    Ok(value)
}

fn v1_to_v2(obj: &mut Map<String, Value>) {
    obj.entry("flags").or_insert_with(|| json!({}));
    obj.entry("convergence").or_insert_with(|| {
        json!({
            "round": 0,
            "max_rounds": crate::convergence::DEFAULT_MAX_ROUNDS,
            "history": []
        })
    });
}

fn v2_to_v3(obj: &mut Map<String, Value>) {
    obj.entry("owner")
        .or_insert_with(|| json!({ "process_id": 0, "config_scope_id": "" }));

    let touched = obj
        .get("phases")
        .and_then(Value::as_array)
        .map(|phases| {
            phases
                .iter()
                .filter(|p| p.get("status").and_then(Value::as_str) != Some("pending"))
                .count()
        })
        .unwrap_or(0);
    obj.entry("phase_sequence_counter")
        .or_insert_with(|| json!(touched));

    if let Some(phases) = obj.get_mut("phases").and_then(Value::as_array_mut) {
        for phase in phases.iter_mut().filter_map(Value::as_object_mut) {
            phase.entry("worker_group_id").or_insert(Value::Null);
            phase.entry("sequence").or_insert_with(|| json!(0));
            phase.entry("reopened").or_insert_with(|| json!(0));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Checkpoint;

    fn v1_document() -> Value {
        json!({
            "id": "run-old",
            "scope": { "id": "repo" },
            "status": "in_progress",
            "started_at": "2025-01-01T00:00:00Z",
            "updated_at": "2025-01-01T00:10:00Z",
            "legacy_note": "written by an old build",
            "phases": [
                { "name": "research", "status": "completed",
                  "artifact_path": "/tmp/r.out", "artifact_hash": "aa",
                  "completed_at": "2025-01-01T00:05:00Z" },
                { "name": "plan", "status": "pending" }
            ]
        })
    }

    #[test]
    fn test_v1_migrates_to_current_and_parses() {
        let migrated = migrate(v1_document()).unwrap();
        assert_eq!(schema_version(&migrated).unwrap(), CURRENT_SCHEMA_VERSION);
        assert_eq!(migrated["phase_sequence_counter"], 1);
        assert_eq!(migrated["owner"]["process_id"], 0);
        assert_eq!(migrated["phases"][1]["reopened"], 0);

        let cp: Checkpoint = serde_json::from_value(migrated).unwrap();
        assert_eq!(cp.phases.len(), 2);
        assert_eq!(cp.extra["legacy_note"], "written by an old build");
    }

    #[test]
    fn test_migration_is_idempotent() {
        let once = migrate(v1_document()).unwrap();
        let twice = migrate(once.clone()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_migration_never_overwrites_existing_fields() {
        let mut doc = v1_document();
        doc["schema_version"] = json!(2);
        doc["flags"] = json!({ "skip_report": true });
        doc["owner"] = json!({ "process_id": 77, "config_scope_id": "cfg" });

        let migrated = migrate(doc).unwrap();
        assert_eq!(migrated["flags"]["skip_report"], true);
        assert_eq!(migrated["owner"]["process_id"], 77);
    }

    #[test]
    fn test_newer_version_is_rejected() {
        let mut doc = v1_document();
        doc["schema_version"] = json!(CURRENT_SCHEMA_VERSION + 1);
        assert!(matches!(
            migrate(doc),
            Err(CheckpointError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn test_out_of_range_versions_are_rejected() {
        for bad in [json!(0), json!(u64::from(u32::MAX) + 2), json!(-1), json!("3")] {
            let mut doc = v1_document();
            doc["schema_version"] = bad;
            assert!(
                matches!(migrate(doc), Err(CheckpointError::InvalidVersion { .. })),
                "version should be rejected"
            );
        }
    }

    #[test]
    fn test_non_object_is_corrupt() {
        assert!(matches!(
            migrate(json!([1, 2, 3])),
            Err(CheckpointError::Corrupt { .. })
        ));
    }
}
