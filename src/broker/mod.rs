//! Commit broker: the single writer of worker side effects.
//!
//! Workers never touch the shared resource. They send a `Changeset` through a
//! `BrokerHandle`; one blocking thread owns the resource and applies changesets
//! strictly one at a time. A ledger of committed task ids makes `apply`
//! at-most-once per task, across resumes.

pub mod changeset;
pub mod resource;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub use changeset::{Changeset, CommitResult, FileChange};
pub use resource::{GitWorkTree, MemoryResource, SharedResource};

use crate::errors::BrokerError;
use crate::util::write_atomic;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    pub files: Vec<PathBuf>,
    pub committed_at: DateTime<Utc>,
}

/// Task ids whose changesets have been committed (or were no-ops).
#[derive(Debug, Default)]
pub struct CommitLedger {
    path: Option<PathBuf>,
    entries: BTreeMap<String, LedgerEntry>,
}

impl CommitLedger {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the ledger at `path`, starting empty if it does not exist yet.
    pub fn load(path: &Path) -> Result<Self, BrokerError> {
        let entries = match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).map_err(|e| BrokerError::Ledger {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => {
                return Err(BrokerError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            entries,
        })
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.entries.contains_key(task_id)
    }

    pub fn get(&self, task_id: &str) -> Option<&LedgerEntry> {
        self.entries.get(task_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn record(&mut self, task_id: &str, entry: LedgerEntry) -> Result<(), BrokerError> {
        self.entries.insert(task_id.to_string(), entry);
        if let Some(path) = &self.path {
            let json = serde_json::to_vec_pretty(&self.entries).map_err(|e| BrokerError::Ledger {
                path: path.clone(),
                message: e.to_string(),
            })?;
            write_atomic(path, &json).map_err(|source| BrokerError::Io {
                path: path.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

/// One file write the changeset will make, with the content it replaces.
struct Planned {
    path: PathBuf,
    /// `None` removes the file.
    content: Option<String>,
    prior: Option<String>,
}

fn write_planned<R: SharedResource + ?Sized>(
    resource: &mut R,
    planned: &[Planned],
) -> Result<(), BrokerError> {
    for plan in planned {
        match &plan.content {
            Some(content) => resource.write(&plan.path, content)?,
            None => resource.remove(&plan.path)?,
        }
    }
    Ok(())
}

/// Put every planned path back to the content it had before the changeset.
fn roll_back<R: SharedResource + ?Sized>(resource: &mut R, planned: &[Planned], task_id: &str) {
    for plan in planned {
        let restored = match &plan.prior {
            Some(content) => resource.write(&plan.path, content),
            None => resource.remove(&plan.path),
        };
        if let Err(e) = restored {
            tracing::error!(
                task = %task_id,
                path = %plan.path.display(),
                error = %e,
                "Failed to roll back changeset file"
            );
        }
    }
}

/// Apply one changeset against the current resource state.
///
/// Per file: content already equal to the desired content is skipped; a file
/// unchanged since the base revision is overwritten; anything else gets one
/// three-way merge attempt. Any unresolved file turns the whole changeset
/// into `NeedsManualMerge` and nothing is written.
pub fn apply_changeset<R: SharedResource + ?Sized>(
    resource: &mut R,
    ledger: &mut CommitLedger,
    changeset: &Changeset,
) -> Result<CommitResult, BrokerError> {
    if ledger.contains(&changeset.task_id) {
        tracing::info!(task = %changeset.task_id, "Changeset already committed; skipping");
        return Ok(CommitResult::Duplicate);
    }
    changeset.validate_paths()?;

    let mut planned = Vec::new();
    let mut conflicts = Vec::new();

    for file in &changeset.files {
        // Binary content cannot be merged line by line; leave it to a human.
        let current = match resource.read(&file.path) {
            Err(BrokerError::NotText { .. }) => {
                conflicts.push(file.path.clone());
                continue;
            }
            read => read?,
        };
        if current == file.content {
            continue;
        }
        let base = match &changeset.base_revision {
            Some(rev) => match resource.read_at(rev, &file.path) {
                Err(BrokerError::NotText { .. }) => {
                    conflicts.push(file.path.clone());
                    continue;
                }
                read => read?,
            },
            None => current.clone(),
        };

        if current == base {
            planned.push(Planned {
                path: file.path.clone(),
                content: file.content.clone(),
                prior: current,
            });
            continue;
        }

        // Concurrent edit since the base: try one merge, text files only.
        let merged = match (&current, &file.content) {
            (Some(ours), Some(theirs)) => {
                resource.merge3(&file.path, base.as_deref().unwrap_or(""), ours, theirs)?
            }
            _ => None,
        };
        match merged {
            Some(content) => planned.push(Planned {
                path: file.path.clone(),
                content: Some(content),
                prior: current,
            }),
            None => conflicts.push(file.path.clone()),
        }
    }

    if !conflicts.is_empty() {
        tracing::warn!(
            task = %changeset.task_id,
            conflicts = ?conflicts,
            "Changeset conflicts with the shared resource; needs manual merge"
        );
        return Ok(CommitResult::NeedsManualMerge { conflicts });
    }

    if planned.is_empty() {
        ledger.record(
            &changeset.task_id,
            LedgerEntry {
                revision: None,
                files: Vec::new(),
                committed_at: Utc::now(),
            },
        )?;
        tracing::debug!(task = %changeset.task_id, "Empty changeset committed as no-op");
        return Ok(CommitResult::NoOp);
    }

    // A failed write or commit must not leave a half-applied changeset for
    // the next one to merge against.
    let files: Vec<PathBuf> = planned.iter().map(|p| p.path.clone()).collect();
    let message = format!("[conductor] {}: {}", changeset.task_id, changeset.description);
    let committed = match write_planned(resource, &planned) {
        Ok(()) => resource.commit(&message, &files),
        Err(e) => Err(e),
    };
    let revision = match committed {
        Ok(revision) => revision,
        Err(e) => {
            tracing::error!(task = %changeset.task_id, error = %e, "Changeset failed to apply; rolling back");
            roll_back(resource, &planned, &changeset.task_id);
            return Err(e);
        }
    };
    ledger.record(
        &changeset.task_id,
        LedgerEntry {
            revision: Some(revision.clone()),
            files: files.clone(),
            committed_at: Utc::now(),
        },
    )?;
    tracing::info!(task = %changeset.task_id, revision = %revision, files = files.len(), "Committed changeset");
    Ok(CommitResult::Applied { revision, files })
}

enum Request {
    Apply {
        changeset: Changeset,
        reply: oneshot::Sender<Result<CommitResult, BrokerError>>,
    },
    Revision {
        reply: oneshot::Sender<Result<Option<String>, BrokerError>>,
    },
}

/// Cloneable sender side of the broker.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    tx: mpsc::Sender<Request>,
}

impl BrokerHandle {
    pub async fn apply(&self, changeset: Changeset) -> Result<CommitResult, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Apply { changeset, reply })
            .await
            .map_err(|_| BrokerError::Closed)?;
        rx.await.map_err(|_| BrokerError::Closed)?
    }

    /// Current revision of the shared resource, used as a changeset base.
    pub async fn revision(&self) -> Result<Option<String>, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Revision { reply })
            .await
            .map_err(|_| BrokerError::Closed)?;
        rx.await.map_err(|_| BrokerError::Closed)?
    }
}

pub struct CommitBroker {
    handle: BrokerHandle,
    task: JoinHandle<()>,
}

impl CommitBroker {
    /// Move `resource` onto a dedicated blocking thread that serves requests
    /// until every handle is dropped.
    pub fn spawn<R: SharedResource>(mut resource: R, mut ledger: CommitLedger) -> Self {
        let (tx, mut rx) = mpsc::channel::<Request>(CHANNEL_CAPACITY);
        let task = tokio::task::spawn_blocking(move || {
            while let Some(request) = rx.blocking_recv() {
                match request {
                    Request::Apply { changeset, reply } => {
                        let result = apply_changeset(&mut resource, &mut ledger, &changeset);
                        if let Err(e) = &result {
                            tracing::error!(task = %changeset.task_id, error = %e, "Commit failed");
                        }
                        let _ = reply.send(result);
                    }
                    Request::Revision { reply } => {
                        let _ = reply.send(resource.revision());
                    }
                }
            }
            tracing::debug!(committed = ledger.len(), "Commit broker stopped");
        });
        Self {
            handle: BrokerHandle { tx },
            task,
        }
    }

    pub fn handle(&self) -> BrokerHandle {
        self.handle.clone()
    }

    /// Drop this broker's sender and wait for outstanding requests to drain.
    pub async fn shutdown(self) {
        drop(self.handle);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Commit broker thread panicked");
        }
    }
}
