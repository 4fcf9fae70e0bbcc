//! Shared task-status store for one worker group.
//!
//! Every mutation is a compare-and-set under a short critical section; the
//! lock is never held across an await point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::graph::TaskGraph;
use super::task::{TaskStatus, WorkerTask};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    Active,
    Settled,
    TimedOut,
    Cancelled,
}

/// A task that has been in progress longer than a threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleTask {
    pub id: String,
    pub owner: String,
    pub attempts: u32,
    pub age: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub deleted: usize,
}

struct BoardInner {
    group_id: String,
    state: GroupState,
    tasks: Vec<WorkerTask>,
    index: HashMap<String, usize>,
    dependents: HashMap<String, Vec<String>>,
}

impl BoardInner {
    fn deps_completed(&self, task: &WorkerTask) -> bool {
        task.blocked_by.iter().all(|dep| {
            self.index
                .get(dep)
                .is_some_and(|&i| self.tasks[i].status == TaskStatus::Completed)
        })
    }

    fn claimable(&self, i: usize) -> bool {
        let task = &self.tasks[i];
        self.state == GroupState::Active
            && task.status == TaskStatus::Pending
            && task.owner.is_empty()
            && self.deps_completed(task)
    }

    fn take(&mut self, i: usize, worker: &str, now: DateTime<Utc>) -> WorkerTask {
        let task = &mut self.tasks[i];
        task.owner = worker.to_string();
        task.status = TaskStatus::InProgress;
        task.last_claimed_at = Some(now);
        task.attempts += 1;
        task.clone()
    }

    fn owned_in_progress(&mut self, id: &str, worker: &str) -> Option<&mut WorkerTask> {
        let i = *self.index.get(id)?;
        let task = &mut self.tasks[i];
        (task.status == TaskStatus::InProgress && task.is_owned_by(worker)).then_some(task)
    }

    /// Fail every pending task that transitively depends on `id`.
    fn cascade_failure(&mut self, id: &str) {
        let mut stack = self.dependents.get(id).cloned().unwrap_or_default();
        while let Some(dep) = stack.pop() {
            let Some(&i) = self.index.get(&dep) else {
                continue;
            };
            if self.tasks[i].status != TaskStatus::Pending {
                continue;
            }
            self.tasks[i].status = TaskStatus::Failed;
            self.tasks[i].error = Some(format!("blocked by failed task {}", id));
            if let Some(next) = self.dependents.get(&dep) {
                stack.extend(next.iter().cloned());
            }
        }
    }
}

/// Cheaply cloneable handle to a group's tasks.
#[derive(Clone)]
pub struct TaskBoard {
    inner: Arc<Mutex<BoardInner>>,
}

impl TaskBoard {
    pub fn new(group_id: &str, graph: TaskGraph) -> Self {
        let dependents = graph
            .tasks()
            .iter()
            .map(|t| (t.id.clone(), graph.dependents(&t.id)))
            .collect();
        let tasks: Vec<WorkerTask> = graph.into_tasks().into_iter().map(WorkerTask::from).collect();
        let index = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();

        Self {
            inner: Arc::new(Mutex::new(BoardInner {
                group_id: group_id.to_string(),
                state: GroupState::Active,
                tasks,
                index,
                dependents,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BoardInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn group_id(&self) -> String {
        self.lock().group_id.clone()
    }

    pub fn state(&self) -> GroupState {
        self.lock().state
    }

    /// No new claims are handed out once the group leaves `Active`.
    pub fn close(&self, state: GroupState) {
        let mut inner = self.lock();
        if inner.state == GroupState::Active {
            inner.state = state;
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == GroupState::Active
    }

    /// Claim a specific task. Succeeds only if it is pending, unowned and
    /// every task it is blocked by has completed.
    pub fn try_claim(&self, task_id: &str, worker: &str) -> Option<WorkerTask> {
        let mut inner = self.lock();
        let i = *inner.index.get(task_id)?;
        inner
            .claimable(i)
            .then(|| inner.take(i, worker, Utc::now()))
    }

    /// Claim the first claimable task in planning order.
    pub fn claim_next(&self, worker: &str) -> Option<WorkerTask> {
        let mut inner = self.lock();
        let i = (0..inner.tasks.len()).find(|&i| inner.claimable(i))?;
        Some(inner.take(i, worker, Utc::now()))
    }

    /// Mark a task completed. Rejected unless `worker` still owns it.
    pub fn complete(
        &self,
        task_id: &str,
        worker: &str,
        summary: Option<String>,
        revision: Option<String>,
    ) -> bool {
        let mut inner = self.lock();
        let Some(task) = inner.owned_in_progress(task_id, worker) else {
            return false;
        };
        task.status = TaskStatus::Completed;
        task.summary = summary;
        task.revision = revision;
        task.error = None;
        true
    }

    /// Mark a task failed and fail its pending dependents, which can never run.
    pub fn fail(&self, task_id: &str, worker: &str, error: &str) -> bool {
        let mut inner = self.lock();
        let Some(task) = inner.owned_in_progress(task_id, worker) else {
            return false;
        };
        task.status = TaskStatus::Failed;
        task.error = Some(error.to_string());
        inner.cascade_failure(task_id);
        true
    }

    /// In-progress tasks claimed at least `threshold` ago.
    pub fn stale_tasks(&self, threshold: Duration, now: DateTime<Utc>) -> Vec<StaleTask> {
        self.lock()
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .filter_map(|t| {
                let age = (now - t.last_claimed_at?).to_std().unwrap_or_default();
                (age >= threshold).then(|| StaleTask {
                    id: t.id.clone(),
                    owner: t.owner.clone(),
                    attempts: t.attempts,
                    age,
                })
            })
            .collect()
    }

    /// Reset stale in-progress tasks to `pending` with no owner so another
    /// worker can reclaim them. Returns the released tasks.
    pub fn release_stale(&self, threshold: Duration, now: DateTime<Utc>) -> Vec<StaleTask> {
        let stale = self.stale_tasks(threshold, now);
        let mut inner = self.lock();
        let mut released = Vec::new();
        for s in stale {
            let Some(&i) = inner.index.get(&s.id) else {
                continue;
            };
            let task = &mut inner.tasks[i];
            // Re-check under the lock: the owner may have finished meanwhile.
            if task.status == TaskStatus::InProgress && task.owner == s.owner {
                task.status = TaskStatus::Pending;
                task.owner.clear();
                released.push(s);
            }
        }
        released
    }

    /// Delete every unfinished task. Completed and failed results are kept.
    pub fn cancel(&self) -> usize {
        let mut inner = self.lock();
        inner.state = GroupState::Cancelled;
        let mut deleted = 0;
        for task in inner.tasks.iter_mut() {
            if matches!(task.status, TaskStatus::Pending | TaskStatus::InProgress) {
                task.status = TaskStatus::Deleted;
                task.owner.clear();
                deleted += 1;
            }
        }
        deleted
    }

    pub fn is_settled(&self) -> bool {
        self.lock().tasks.iter().all(|t| t.status.is_terminal())
    }

    pub fn task(&self, task_id: &str) -> Option<WorkerTask> {
        let inner = self.lock();
        inner.index.get(task_id).map(|&i| inner.tasks[i].clone())
    }

    pub fn snapshot(&self) -> Vec<WorkerTask> {
        self.lock().tasks.clone()
    }

    pub fn counts(&self) -> TaskCounts {
        let mut counts = TaskCounts::default();
        for task in self.lock().tasks.iter() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Deleted => counts.deleted += 1,
            }
        }
        counts
    }
}
