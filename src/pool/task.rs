use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Task as handed to the coordinator by a planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub blocked_by: Vec<String>,
}

impl TaskDescriptor {
    pub fn new(id: &str, description: &str) -> Self {
        Self {
            id: id.to_string(),
            description: description.to_string(),
            blocked_by: Vec::new(),
        }
    }

    pub fn blocked_by(mut self, deps: &[&str]) -> Self {
        self.blocked_by = deps.iter().map(|d| d.to_string()).collect();
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    /// Removed by a group cancellation before it finished.
    Deleted,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Deleted)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// Live task state inside a worker group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTask {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    /// Worker identity; empty when unowned.
    pub owner: String,
    pub blocked_by: Vec<String>,
    pub last_claimed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<TaskDescriptor> for WorkerTask {
    fn from(d: TaskDescriptor) -> Self {
        Self {
            id: d.id,
            description: d.description,
            status: TaskStatus::Pending,
            owner: String::new(),
            blocked_by: d.blocked_by,
            last_claimed_at: None,
            attempts: 0,
            summary: None,
            revision: None,
            error: None,
        }
    }
}

impl WorkerTask {
    pub fn is_owned_by(&self, worker: &str) -> bool {
        !self.owner.is_empty() && self.owner == worker
    }
}
