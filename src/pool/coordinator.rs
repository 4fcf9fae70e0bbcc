//! Worker group lifecycle: create, poll, cancel, archive.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::board::{GroupState, TaskBoard};
use super::graph::TaskGraph;
use super::task::{TaskDescriptor, TaskStatus, WorkerTask};
use crate::errors::PoolError;
use crate::util::write_atomic;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_STALE_WARN: Duration = Duration::from_secs(600);
pub const DEFAULT_AUTO_RELEASE: Duration = Duration::from_secs(1200);
pub const DEFAULT_HARD_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq)]
pub struct PollSettings {
    pub poll_interval: Duration,
    pub stale_warn: Duration,
    pub auto_release: Duration,
    pub hard_timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            stale_warn: DEFAULT_STALE_WARN,
            auto_release: DEFAULT_AUTO_RELEASE,
            hard_timeout: DEFAULT_HARD_TIMEOUT,
        }
    }
}

/// What a poll loop observed when it returned.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollResult {
    pub group_id: String,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    /// Pending, in-progress or deleted when the loop returned.
    pub outstanding: Vec<String>,
    pub timed_out: bool,
    pub cancelled: bool,
    pub tasks: Vec<WorkerTask>,
}

impl PollResult {
    fn from_tasks(group_id: &str, tasks: Vec<WorkerTask>, timed_out: bool, cancelled: bool) -> Self {
        let ids = |pred: fn(&TaskStatus) -> bool| -> Vec<String> {
            tasks
                .iter()
                .filter(|t| pred(&t.status))
                .map(|t| t.id.clone())
                .collect()
        };
        Self {
            group_id: group_id.to_string(),
            completed: ids(|s| *s == TaskStatus::Completed),
            failed: ids(|s| *s == TaskStatus::Failed),
            outstanding: ids(|s| {
                matches!(
                    s,
                    TaskStatus::Pending | TaskStatus::InProgress | TaskStatus::Deleted
                )
            }),
            timed_out,
            cancelled,
            tasks,
        }
    }

    pub fn is_success(&self) -> bool {
        !self.timed_out && !self.cancelled && self.failed.is_empty() && self.outstanding.is_empty()
    }
}

/// Condensed poll result carried on a phase outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSummary {
    pub group_id: String,
    pub completed: usize,
    pub failed: usize,
    pub outstanding: usize,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl From<&PollResult> for PoolSummary {
    fn from(r: &PollResult) -> Self {
        Self {
            group_id: r.group_id.clone(),
            completed: r.completed.len(),
            failed: r.failed.len(),
            outstanding: r.outstanding.len(),
            timed_out: r.timed_out,
            cancelled: r.cancelled,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GroupArchive {
    pub group_id: String,
    pub state: GroupState,
    pub archived_at: DateTime<Utc>,
    pub tasks: Vec<WorkerTask>,
}

#[derive(Default)]
pub struct PoolCoordinator {
    groups: Mutex<HashMap<String, TaskBoard>>,
}

impl PoolCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn groups(&self) -> std::sync::MutexGuard<'_, HashMap<String, TaskBoard>> {
        self.groups.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Validate the task set and register a new group under a generated id.
    pub fn create_group(&self, tasks: Vec<TaskDescriptor>) -> Result<String, PoolError> {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        let group_id = format!("group-{}", &uuid[..8]);
        self.create_group_with_id(&group_id, tasks)?;
        Ok(group_id)
    }

    pub fn create_group_with_id(
        &self,
        group_id: &str,
        tasks: Vec<TaskDescriptor>,
    ) -> Result<TaskBoard, PoolError> {
        let graph = TaskGraph::build(tasks)?;
        let mut groups = self.groups();
        if groups.contains_key(group_id) {
            return Err(PoolError::GroupExists {
                group_id: group_id.to_string(),
            });
        }
        let board = TaskBoard::new(group_id, graph);
        groups.insert(group_id.to_string(), board.clone());
        tracing::info!(group_id, tasks = board.snapshot().len(), "Created worker group");
        Ok(board)
    }

    pub fn board(&self, group_id: &str) -> Result<TaskBoard, PoolError> {
        self.groups()
            .get(group_id)
            .cloned()
            .ok_or_else(|| PoolError::GroupNotFound {
                group_id: group_id.to_string(),
            })
    }

    /// Watch a group until it settles, is cancelled or hits its hard timeout.
    ///
    /// Each tick re-reads task statuses, warns once per claim about tasks in
    /// progress longer than `stale_warn`, and releases tasks older than
    /// `auto_release`. On hard timeout the group is closed and one final
    /// sweep is returned with `timed_out = true`.
    pub async fn poll(
        &self,
        group_id: &str,
        settings: &PollSettings,
        cancel: &CancellationToken,
    ) -> Result<PollResult, PoolError> {
        let board = self.board(group_id)?;
        let deadline = Instant::now() + settings.hard_timeout;
        let mut ticker = tokio::time::interval(settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut warned: HashSet<(String, u32)> = HashSet::new();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let deleted = board.cancel();
                    tracing::warn!(group_id, deleted, "Worker group cancelled");
                    return Ok(PollResult::from_tasks(group_id, board.snapshot(), false, true));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    board.close(GroupState::TimedOut);
                    let result = PollResult::from_tasks(group_id, board.snapshot(), true, false);
                    tracing::warn!(
                        group_id,
                        completed = result.completed.len(),
                        outstanding = result.outstanding.len(),
                        "Worker group hit its hard timeout; returning partial results"
                    );
                    return Ok(result);
                }
                _ = ticker.tick() => {}
            }

            if board.is_settled() {
                board.close(GroupState::Settled);
                let result = PollResult::from_tasks(group_id, board.snapshot(), false, false);
                tracing::info!(
                    group_id,
                    completed = result.completed.len(),
                    failed = result.failed.len(),
                    "Worker group settled"
                );
                return Ok(result);
            }

            let now = Utc::now();
            for stale in board.stale_tasks(settings.stale_warn, now) {
                if warned.insert((stale.id.clone(), stale.attempts)) {
                    tracing::warn!(
                        group_id,
                        task = %stale.id,
                        owner = %stale.owner,
                        age_secs = stale.age.as_secs(),
                        "Task has been in progress for a long time"
                    );
                }
            }
            for released in board.release_stale(settings.auto_release, now) {
                tracing::warn!(
                    group_id,
                    task = %released.id,
                    owner = %released.owner,
                    age_secs = released.age.as_secs(),
                    "Auto-released stale task for reclaim"
                );
            }

            let counts = board.counts();
            tracing::debug!(
                group_id,
                pending = counts.pending,
                in_progress = counts.in_progress,
                completed = counts.completed,
                failed = counts.failed,
                "Polled worker group"
            );
        }
    }

    pub fn cancel_group(&self, group_id: &str) -> Result<usize, PoolError> {
        Ok(self.board(group_id)?.cancel())
    }

    /// Write the group's final task states to `<dir>/<group_id>.json`.
    pub fn archive(&self, group_id: &str, dir: &Path) -> Result<PathBuf, PoolError> {
        let board = self.board(group_id)?;
        let path = dir.join(format!("{}.json", group_id));
        let archive = GroupArchive {
            group_id: group_id.to_string(),
            state: board.state(),
            archived_at: Utc::now(),
            tasks: board.snapshot(),
        };
        let archive_err = |message: String| PoolError::Archive {
            group_id: group_id.to_string(),
            path: path.clone(),
            message,
        };
        let json = serde_json::to_vec_pretty(&archive).map_err(|e| archive_err(e.to_string()))?;
        write_atomic(&path, &json).map_err(|e| archive_err(e.to_string()))?;
        Ok(path)
    }

    pub fn remove(&self, group_id: &str) -> Option<TaskBoard> {
        self.groups().remove(group_id)
    }
}
