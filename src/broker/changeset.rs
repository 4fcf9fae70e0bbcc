use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::BrokerError;

/// One file in a changeset. `content: None` deletes the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: PathBuf,
    pub content: Option<String>,
}

/// Isolated side effects produced by one worker task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changeset {
    pub task_id: String,
    pub description: String,
    /// Revision the worker read before producing the change; the merge base.
    /// Without one, files are written as given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_revision: Option<String>,
    pub files: Vec<FileChange>,
}

impl Changeset {
    pub fn new(task_id: &str, description: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            description: description.to_string(),
            base_revision: None,
            files: Vec::new(),
        }
    }

    pub fn with_base(mut self, revision: Option<String>) -> Self {
        self.base_revision = revision;
        self
    }

    pub fn write(mut self, path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        self.files.push(FileChange {
            path: path.into(),
            content: Some(content.into()),
        });
        self
    }

    pub fn delete(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.push(FileChange {
            path: path.into(),
            content: None,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Every path must be relative, free of `..`, and outside `.git`.
    pub fn validate_paths(&self) -> Result<(), BrokerError> {
        for file in &self.files {
            validate_path(&file.path)?;
        }
        Ok(())
    }
}

fn validate_path(path: &Path) -> Result<(), BrokerError> {
    let invalid = || BrokerError::InvalidPath {
        path: path.to_path_buf(),
    };
    if path.as_os_str().is_empty() {
        return Err(invalid());
    }
    for component in path.components() {
        match component {
            Component::Normal(c) if c == ".git" => return Err(invalid()),
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(invalid()),
        }
    }
    Ok(())
}

/// Outcome of handing a changeset to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CommitResult {
    Applied { revision: String, files: Vec<PathBuf> },
    /// Empty changeset, or every file already had the desired content.
    NoOp,
    /// The task was already committed; nothing was applied again.
    Duplicate,
    /// At least one file could not be merged; nothing from this changeset was applied.
    NeedsManualMerge { conflicts: Vec<PathBuf> },
}
