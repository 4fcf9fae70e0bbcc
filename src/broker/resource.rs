//! Shared resources the commit broker writes to.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use git2::{IndexEntry, IndexTime, Repository, Signature};

use crate::errors::BrokerError;

/// A mutable resource shared by all workers of a run. Only the commit broker
/// calls the mutating methods.
pub trait SharedResource: Send + 'static {
    /// Current revision, `None` before the first commit.
    fn revision(&self) -> Result<Option<String>, BrokerError>;

    /// Current content of `path`, `None` if absent.
    fn read(&self, path: &Path) -> Result<Option<String>, BrokerError>;

    /// Content of `path` at `revision`, `None` if absent there.
    fn read_at(&self, revision: &str, path: &Path) -> Result<Option<String>, BrokerError>;

    fn write(&mut self, path: &Path, content: &str) -> Result<(), BrokerError>;

    fn remove(&mut self, path: &Path) -> Result<(), BrokerError>;

    /// Three-way merge of one file. `None` when the merge has conflicts.
    fn merge3(
        &self,
        path: &Path,
        base: &str,
        ours: &str,
        theirs: &str,
    ) -> Result<Option<String>, BrokerError>;

    /// Record `paths` as one revision and return it.
    fn commit(&mut self, message: &str, paths: &[PathBuf]) -> Result<String, BrokerError>;
}

/// A git working tree. Commits land on HEAD.
pub struct GitWorkTree {
    repo: Repository,
    root: PathBuf,
}

impl GitWorkTree {
    pub fn open(root: &Path) -> Result<Self, BrokerError> {
        let repo = Repository::open(root)?;
        let root = repo
            .workdir()
            .map(Path::to_path_buf)
            .ok_or_else(|| BrokerError::InvalidPath {
                path: root.to_path_buf(),
            })?;
        Ok(Self { repo, root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the HEAD commit if it exists (returns None for unborn branches)
    fn head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
    }

    fn blob_entry(&self, path: &Path, content: &str) -> Result<IndexEntry, BrokerError> {
        let id = self.repo.blob(content.as_bytes())?;
        Ok(IndexEntry {
            ctime: IndexTime::new(0, 0),
            mtime: IndexTime::new(0, 0),
            dev: 0,
            ino: 0,
            mode: 0o100644,
            uid: 0,
            gid: 0,
            file_size: content.len() as u32,
            id,
            flags: 0,
            flags_extended: 0,
            path: path.to_string_lossy().as_bytes().to_vec(),
        })
    }

    fn io_err(&self, path: &Path, source: std::io::Error) -> BrokerError {
        BrokerError::Io {
            path: self.root.join(path),
            source,
        }
    }
}

impl SharedResource for GitWorkTree {
    fn revision(&self) -> Result<Option<String>, BrokerError> {
        Ok(self.head_commit().map(|c| c.id().to_string()))
    }

    fn read(&self, path: &Path) -> Result<Option<String>, BrokerError> {
        match fs::read(self.root.join(path)) {
            Ok(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| BrokerError::NotText {
                    path: path.to_path_buf(),
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_err(path, e)),
        }
    }

    fn read_at(&self, revision: &str, path: &Path) -> Result<Option<String>, BrokerError> {
        let commit = self.repo.revparse_single(revision)?.peel_to_commit()?;
        let tree = commit.tree()?;
        let entry = match tree.get_path(path) {
            Ok(entry) => entry,
            Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let blob = self.repo.find_blob(entry.id())?;
        match std::str::from_utf8(blob.content()) {
            Ok(text) => Ok(Some(text.to_string())),
            Err(_) => Err(BrokerError::NotText {
                path: path.to_path_buf(),
            }),
        }
    }

    fn write(&mut self, path: &Path, content: &str) -> Result<(), BrokerError> {
        let full = self.root.join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_err(path, e))?;
        }
        fs::write(&full, content).map_err(|e| self.io_err(path, e))
    }

    fn remove(&mut self, path: &Path) -> Result<(), BrokerError> {
        match fs::remove_file(self.root.join(path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_err(path, e)),
        }
    }

    fn merge3(
        &self,
        path: &Path,
        base: &str,
        ours: &str,
        theirs: &str,
    ) -> Result<Option<String>, BrokerError> {
        let ancestor = self.blob_entry(path, base)?;
        let ours = self.blob_entry(path, ours)?;
        let theirs = self.blob_entry(path, theirs)?;
        let result = self
            .repo
            .merge_file_from_index(&ancestor, &ours, &theirs, None)?;
        if !result.is_automergeable() {
            return Ok(None);
        }
        Ok(std::str::from_utf8(result.content()).ok().map(str::to_string))
    }

    fn commit(&mut self, message: &str, paths: &[PathBuf]) -> Result<String, BrokerError> {
        let mut index = self.repo.index()?;
        for path in paths {
            if self.root.join(path).exists() {
                index.add_path(path)?;
            } else {
                index.remove_path(path)?;
            }
        }
        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;
        let sig = Signature::now("conductor", "conductor@localhost")?;

        let parents: Vec<git2::Commit<'_>> = self.head_commit().into_iter().collect();
        let parent_refs: Vec<&git2::Commit<'_>> = parents.iter().collect();
        let oid = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)?;
        // Persist the staged index only once the commit exists.
        index.write()?;
        Ok(oid.to_string())
    }
}

/// In-memory resource with a linear revision history. Merges succeed when the
/// two sides changed disjoint lines of equal-length files.
#[derive(Debug, Default)]
pub struct MemoryResource {
    files: BTreeMap<PathBuf, String>,
    history: Vec<BTreeMap<PathBuf, String>>,
}

impl MemoryResource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: &str, content: &str) -> Self {
        self.files.insert(PathBuf::from(path), content.to_string());
        self
    }

    pub fn commits(&self) -> usize {
        self.history.len()
    }

    fn parse_revision(&self, revision: &str) -> Result<usize, BrokerError> {
        revision
            .strip_prefix("mem-")
            .and_then(|n| n.parse::<usize>().ok())
            .filter(|n| *n >= 1 && *n <= self.history.len())
            .ok_or_else(|| BrokerError::InvalidPath {
                path: PathBuf::from(revision),
            })
    }
}

impl SharedResource for MemoryResource {
    fn revision(&self) -> Result<Option<String>, BrokerError> {
        Ok((!self.history.is_empty()).then(|| format!("mem-{}", self.history.len())))
    }

    fn read(&self, path: &Path) -> Result<Option<String>, BrokerError> {
        Ok(self.files.get(path).cloned())
    }

    fn read_at(&self, revision: &str, path: &Path) -> Result<Option<String>, BrokerError> {
        let n = self.parse_revision(revision)?;
        Ok(self.history[n - 1].get(path).cloned())
    }

    fn write(&mut self, path: &Path, content: &str) -> Result<(), BrokerError> {
        self.files.insert(path.to_path_buf(), content.to_string());
        Ok(())
    }

    fn remove(&mut self, path: &Path) -> Result<(), BrokerError> {
        self.files.remove(path);
        Ok(())
    }

    fn merge3(
        &self,
        _path: &Path,
        base: &str,
        ours: &str,
        theirs: &str,
    ) -> Result<Option<String>, BrokerError> {
        let (b, o, t): (Vec<_>, Vec<_>, Vec<_>) = (
            base.lines().collect(),
            ours.lines().collect(),
            theirs.lines().collect(),
        );
        if b.len() != o.len() || b.len() != t.len() {
            return Ok(None);
        }
        let mut merged = Vec::with_capacity(b.len());
        for i in 0..b.len() {
            let line = match (o[i] == b[i], t[i] == b[i]) {
                (true, _) => t[i],
                (false, true) => o[i],
                (false, false) if o[i] == t[i] => o[i],
                (false, false) => return Ok(None),
            };
            merged.push(line);
        }
        let mut out = merged.join("\n");
        if theirs.ends_with('\n') {
            out.push('\n');
        }
        Ok(Some(out))
    }

    fn commit(&mut self, _message: &str, _paths: &[PathBuf]) -> Result<String, BrokerError> {
        self.history.push(self.files.clone());
        Ok(format!("mem-{}", self.history.len()))
    }
}
