//! Scope leases: at most one live orchestrator per scope.
//!
//! A lease is a JSON file under `.conductor/leases/`, published exclusively
//! (temp file + hard link, which fails if the target exists). An existing
//! lease blocks acquisition while its owner process is alive and the lease is
//! within its TTL; otherwise it is reclaimed. In-progress checkpoints for the
//! same scope owned by another live process block acquisition as well.
//!
//! Every read-decide-write on a lease file (acquire, reclaim, renew, release)
//! runs under an exclusive `fs2` lock on a `<lease>.lock` sidecar, so a
//! reclaimer can never delete a lease another process published after it
//! looked.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{CheckpointStore, PipelineStatus};
use crate::errors::LeaseError;
use crate::util::{short_hash, write_atomic};

pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(4 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub owner_process_id: u32,
    #[serde(default)]
    pub config_scope_id: String,
    pub scope_id: String,
    pub run_id: String,
    pub acquired_at: DateTime<Utc>,
    pub renewed_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl LeaseRecord {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.renewed_at).to_std().unwrap_or_default()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.age(now) > self.ttl()
    }

    fn same_holder(&self, other: &LeaseRecord) -> bool {
        self.owner_process_id == other.owner_process_id
            && self.run_id == other.run_id
            && self.acquired_at == other.acquired_at
    }
}

/// Decides whether a recorded owner process is still running.
pub trait LivenessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// `kill(pid, 0)`: alive if the signal could be delivered or was refused for
/// permission reasons.
pub struct ProcessProbe;

impl LivenessProbe for ProcessProbe {
    fn is_alive(&self, pid: u32) -> bool {
        process_alive(pid)
    }
}

#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    // pid 0 would address our own process group.
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    if pid == std::process::id() {
        return true;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(pid: u32) -> bool {
    pid != 0
}

/// Backoff schedule for `try_acquire_with_retry`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

pub struct LeaseGuard {
    leases_dir: PathBuf,
    ttl: Duration,
    config_scope_id: String,
    probe: Arc<dyn LivenessProbe>,
    store: Option<Arc<dyn CheckpointStore>>,
}

impl LeaseGuard {
    pub fn new(leases_dir: impl Into<PathBuf>, ttl: Duration, config_scope_id: &str) -> Self {
        Self {
            leases_dir: leases_dir.into(),
            ttl,
            config_scope_id: config_scope_id.to_string(),
            probe: Arc::new(ProcessProbe),
            store: None,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Also refuse scopes with an in-progress checkpoint owned by another live process.
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn lease_path(&self, scope_id: &str) -> PathBuf {
        let readable: String = scope_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .take(48)
            .collect();
        self.leases_dir
            .join(format!("{}-{}.json", readable, short_hash(scope_id)))
    }

    /// Current lease for a scope, if any.
    pub fn read(&self, scope_id: &str) -> Result<Option<LeaseRecord>, LeaseError> {
        read_record(&self.lease_path(scope_id))
    }

    /// A lease is stale when its owner is gone or it outlived its TTL.
    pub fn is_stale(&self, record: &LeaseRecord, now: DateTime<Utc>) -> bool {
        !self.probe.is_alive(record.owner_process_id) || record.is_expired(now)
    }

    pub fn try_acquire(&self, scope_id: &str, run_id: &str) -> Result<Lease, LeaseError> {
        self.check_checkpoints(scope_id, run_id)?;

        let path = self.lease_path(scope_id);
        fs::create_dir_all(&self.leases_dir).map_err(|source| LeaseError::Io {
            path: self.leases_dir.clone(),
            source,
        })?;

        let mut last_holder = None;
        for _ in 0..3 {
            let _scope_lock = ScopeLock::acquire(&path)?;
            let now = Utc::now();
            let record = LeaseRecord {
                owner_process_id: std::process::id(),
                config_scope_id: self.config_scope_id.clone(),
                scope_id: scope_id.to_string(),
                run_id: run_id.to_string(),
                acquired_at: now,
                renewed_at: now,
                ttl_secs: self.ttl.as_secs(),
            };
            if publish_exclusive(&path, &record)? {
                tracing::info!(scope = %scope_id, run_id = %run_id, "Acquired scope lease");
                return Ok(Lease {
                    path,
                    record,
                    released: false,
                });
            }

            let Some(existing) = read_record(&path)? else {
                continue;
            };
            if !self.is_stale(&existing, now) {
                return Err(LeaseError::AlreadyLocked {
                    scope_id: scope_id.to_string(),
                    owner_pid: existing.owner_process_id,
                    run_id: existing.run_id,
                });
            }
            self.reclaim_locked(&path, &existing)?;
            last_holder = Some(existing);
        }

        let holder = last_holder.or(read_record(&path)?);
        Err(LeaseError::AlreadyLocked {
            scope_id: scope_id.to_string(),
            owner_pid: holder.as_ref().map(|h| h.owner_process_id).unwrap_or(0),
            run_id: holder.map(|h| h.run_id).unwrap_or_default(),
        })
    }

    /// Retry `try_acquire` on contention with exponential backoff.
    pub async fn try_acquire_with_retry(
        &self,
        scope_id: &str,
        run_id: &str,
        policy: &RetryPolicy,
    ) -> Result<Lease, LeaseError> {
        let attempts = policy.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.try_acquire(scope_id, run_id) {
                Err(e) if e.is_contention() && attempt < attempts => {
                    let delay = policy.backoff(attempt);
                    tracing::info!(
                        scope = %scope_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Scope is locked; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Delete a stale lease, but only if the file still holds that exact lease.
    pub fn reclaim(&self, stale: &LeaseRecord) -> Result<bool, LeaseError> {
        let path = self.lease_path(&stale.scope_id);
        let _scope_lock = ScopeLock::acquire(&path)?;
        self.reclaim_locked(&path, stale)
    }

    /// `reclaim` for a caller already holding the scope lock.
    fn reclaim_locked(&self, path: &Path, stale: &LeaseRecord) -> Result<bool, LeaseError> {
        match read_record(path)? {
            Some(current) if current.same_holder(stale) => {
                remove_if_present(path)?;
                tracing::warn!(
                    scope = %stale.scope_id,
                    owner_pid = stale.owner_process_id,
                    run_id = %stale.run_id,
                    "Reclaimed stale scope lease"
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn check_checkpoints(&self, scope_id: &str, run_id: &str) -> Result<(), LeaseError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let checkpoints = match store.load_all() {
            Ok(cps) => cps,
            Err(e) => {
                tracing::warn!(error = %e, "Could not scan checkpoints for scope owners");
                return Ok(());
            }
        };
        let own_pid = std::process::id();
        for cp in checkpoints {
            let pid = cp.owner.process_id;
            if cp.id != run_id
                && cp.scope.id == scope_id
                && cp.status == PipelineStatus::InProgress
                && pid != 0
                && pid != own_pid
                && self.probe.is_alive(pid)
            {
                return Err(LeaseError::AlreadyLocked {
                    scope_id: scope_id.to_string(),
                    owner_pid: pid,
                    run_id: cp.id,
                });
            }
        }
        Ok(())
    }
}

/// Exclusive lock on a lease's sidecar file, released on drop.
///
/// `flock` locks belong to the open file, so a holder must not take the same
/// scope lock again.
struct ScopeLock {
    file: fs::File,
}

impl ScopeLock {
    fn acquire(lease_path: &Path) -> Result<Self, LeaseError> {
        let path = lease_path.with_extension("lock");
        let io_err = |source: std::io::Error| LeaseError::Io {
            path: path.clone(),
            source,
        };
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(io_err)?;
        file.lock_exclusive().map_err(io_err)?;
        Ok(Self { file })
    }
}

impl Drop for ScopeLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn read_record(path: &Path) -> Result<Option<LeaseRecord>, LeaseError> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(LeaseError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| LeaseError::Corrupt {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Publish `record` at `path` only if no file exists there. Readers never see
/// a partially written lease.
fn publish_exclusive(path: &Path, record: &LeaseRecord) -> Result<bool, LeaseError> {
    let io_err = |source: std::io::Error| LeaseError::Io {
        path: path.to_path_buf(),
        source,
    };
    let json = serde_json::to_vec_pretty(record).map_err(|e| LeaseError::Corrupt {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let tmp = path.with_extension(format!(
        "{}.{}.tmp",
        std::process::id(),
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    ));
    write_atomic(&tmp, &json).map_err(io_err)?;
    let linked = fs::hard_link(&tmp, path);
    let _ = fs::remove_file(&tmp);
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(io_err(e)),
    }
}

fn remove_if_present(path: &Path) -> Result<(), LeaseError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(LeaseError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// A held scope lease. Released on drop.
#[derive(Debug)]
pub struct Lease {
    path: PathBuf,
    record: LeaseRecord,
    released: bool,
}

impl Lease {
    pub fn record(&self) -> &LeaseRecord {
        &self.record
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Refresh `renewed_at`. Fails if the lease was reclaimed by someone else.
    pub fn renew(&mut self) -> Result<(), LeaseError> {
        let _scope_lock = ScopeLock::acquire(&self.path)?;
        match read_record(&self.path)? {
            Some(current) if current.same_holder(&self.record) => {}
            current => {
                let holder = current.unwrap_or_else(|| self.record.clone());
                return Err(LeaseError::AlreadyLocked {
                    scope_id: self.record.scope_id.clone(),
                    owner_pid: holder.owner_process_id,
                    run_id: holder.run_id,
                });
            }
        }
        self.record.renewed_at = Utc::now();
        let json = serde_json::to_vec_pretty(&self.record).map_err(|e| LeaseError::Corrupt {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        write_atomic(&self.path, &json).map_err(|source| LeaseError::Io {
            path: self.path.clone(),
            source,
        })
    }

    pub fn release(mut self) -> Result<(), LeaseError> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<(), LeaseError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let _scope_lock = ScopeLock::acquire(&self.path)?;
        match read_record(&self.path) {
            Ok(Some(current)) if current.same_holder(&self.record) => {
                remove_if_present(&self.path)?;
                tracing::debug!(scope = %self.record.scope_id, "Released scope lease");
            }
            _ => {}
        }
        Ok(())
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            tracing::warn!(error = %e, "Failed to release scope lease");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{Checkpoint, MemoryCheckpointStore, OwnerIdentity, ScopeDescriptor};
    use std::collections::{BTreeMap, HashSet};
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Treats only the listed pids as alive.
    #[derive(Default)]
    struct FakeProbe {
        alive: Mutex<HashSet<u32>>,
    }

    impl FakeProbe {
        fn with(pids: &[u32]) -> Arc<Self> {
            Arc::new(Self {
                alive: Mutex::new(pids.iter().copied().collect()),
            })
        }
    }

    impl LivenessProbe for FakeProbe {
        fn is_alive(&self, pid: u32) -> bool {
            self.alive.lock().unwrap().contains(&pid)
        }
    }

    fn guard(dir: &Path) -> LeaseGuard {
        LeaseGuard::new(dir.join("leases"), Duration::from_secs(60), "cfg")
            .with_probe(FakeProbe::with(&[std::process::id()]))
    }

    fn plant(guard: &LeaseGuard, scope: &str, pid: u32, renewed_secs_ago: i64) {
        let at = Utc::now() - chrono::Duration::seconds(renewed_secs_ago);
        let record = LeaseRecord {
            owner_process_id: pid,
            config_scope_id: "cfg".into(),
            scope_id: scope.into(),
            run_id: "run-other".into(),
            acquired_at: at,
            renewed_at: at,
            ttl_secs: 60,
        };
        let path = guard.lease_path(scope);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, serde_json::to_string(&record).unwrap()).unwrap();
    }

    #[test]
    fn test_acquire_then_second_acquire_is_locked() {
        let dir = tempdir().unwrap();
        let guard = guard(dir.path());
        let lease = guard.try_acquire("repo", "run-1").unwrap();
        assert_eq!(lease.record().scope_id, "repo");

        let err = guard.try_acquire("repo", "run-2").unwrap_err();
        match err {
            LeaseError::AlreadyLocked { owner_pid, run_id, .. } => {
                assert_eq!(owner_pid, std::process::id());
                assert_eq!(run_id, "run-1");
            }
            other => panic!("Expected AlreadyLocked, got {:?}", other),
        }

        // Different scope is independent.
        assert!(guard.try_acquire("other", "run-3").is_ok());
    }

    #[test]
    fn test_concurrent_acquires_never_both_succeed() {
        let dir = tempdir().unwrap();
        let guard = Arc::new(guard(dir.path()));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let guard = Arc::clone(&guard);
                std::thread::spawn(move || guard.try_acquire("repo", &format!("run-{}", i)))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| e.is_contention()));
    }

    #[test]
    fn test_concurrent_reclaims_of_stale_lease_leave_one_owner() {
        let dir = tempdir().unwrap();
        let guard = Arc::new(guard(dir.path()));
        plant(&guard, "repo", 999_999, 0);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let guard = Arc::clone(&guard);
                std::thread::spawn(move || guard.try_acquire("repo", &format!("run-{}", i)))
            })
            .collect();
        // Held leases are kept alive until every thread has finished.
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1);
        let on_disk = guard.read("repo").unwrap().unwrap();
        assert_eq!(on_disk.run_id, winners[0].record().run_id);
    }

    #[test]
    fn test_acquire_waits_for_scope_lock_holder() {
        let dir = tempdir().unwrap();
        let guard = Arc::new(guard(dir.path()));
        plant(&guard, "repo", 999_999, 0);
        let path = guard.lease_path("repo");

        // Another process is mid-reclaim: it holds the scope lock.
        let held = ScopeLock::acquire(&path).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        let waiter = {
            let guard = Arc::clone(&guard);
            std::thread::spawn(move || tx.send(guard.try_acquire("repo", "run-late")).unwrap())
        };
        std::thread::sleep(Duration::from_millis(150));
        assert!(rx.try_recv().is_err());

        // It replaces the stale lease with its own before letting go.
        fs::remove_file(&path).unwrap();
        let now = Utc::now();
        let fresh = LeaseRecord {
            owner_process_id: std::process::id(),
            config_scope_id: "cfg".into(),
            scope_id: "repo".into(),
            run_id: "run-first".into(),
            acquired_at: now,
            renewed_at: now,
            ttl_secs: 60,
        };
        assert!(publish_exclusive(&path, &fresh).unwrap());
        drop(held);

        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
        match result {
            Err(LeaseError::AlreadyLocked { run_id, .. }) => assert_eq!(run_id, "run-first"),
            other => panic!("Expected AlreadyLocked, got {:?}", other.map(|l| l.record().clone())),
        }
        assert_eq!(guard.read("repo").unwrap().unwrap().run_id, "run-first");
    }

    #[test]
    fn test_release_and_drop_free_the_scope() {
        let dir = tempdir().unwrap();
        let guard = guard(dir.path());
        let lease = guard.try_acquire("repo", "run-1").unwrap();
        lease.release().unwrap();
        assert!(guard.read("repo").unwrap().is_none());

        {
            let _lease = guard.try_acquire("repo", "run-2").unwrap();
            assert!(guard.read("repo").unwrap().is_some());
        }
        assert!(guard.read("repo").unwrap().is_none());
    }

    #[test]
    fn test_dead_owner_lease_is_reclaimed() {
        let dir = tempdir().unwrap();
        let guard = guard(dir.path());
        plant(&guard, "repo", 999_999, 0);

        let lease = guard.try_acquire("repo", "run-1").unwrap();
        assert_eq!(lease.record().run_id, "run-1");
    }

    #[test]
    fn test_expired_lease_of_live_owner_is_reclaimed() {
        let dir = tempdir().unwrap();
        let guard = LeaseGuard::new(dir.path().join("leases"), Duration::from_secs(60), "cfg")
            .with_probe(FakeProbe::with(&[4242]));
        plant(&guard, "repo", 4242, 3600);
        assert!(guard.try_acquire("repo", "run-1").is_ok());
    }

    #[test]
    fn test_fresh_lease_of_live_owner_blocks() {
        let dir = tempdir().unwrap();
        let guard = LeaseGuard::new(dir.path().join("leases"), Duration::from_secs(60), "cfg")
            .with_probe(FakeProbe::with(&[4242]));
        plant(&guard, "repo", 4242, 5);
        let err = guard.try_acquire("repo", "run-1").unwrap_err();
        assert!(matches!(err, LeaseError::AlreadyLocked { owner_pid: 4242, .. }));
    }

    #[test]
    fn test_reclaim_leaves_a_newer_lease_alone() {
        let dir = tempdir().unwrap();
        let guard = guard(dir.path());
        plant(&guard, "repo", 999_999, 0);
        let stale = guard.read("repo").unwrap().unwrap();

        fs::remove_file(guard.lease_path("repo")).unwrap();
        let _fresh = guard.try_acquire("repo", "run-new").unwrap();
        assert!(!guard.reclaim(&stale).unwrap());
        assert_eq!(guard.read("repo").unwrap().unwrap().run_id, "run-new");
    }

    #[test]
    fn test_in_progress_checkpoint_of_live_owner_blocks() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryCheckpointStore::new());
        let mut cp = Checkpoint::new(
            "run-other",
            ScopeDescriptor::new("repo", ""),
            BTreeMap::new(),
            &[],
            OwnerIdentity {
                process_id: 4242,
                config_scope_id: "cfg".into(),
            },
        );
        store.insert(&cp).unwrap();

        let probe = FakeProbe::with(&[4242]);
        let guard = LeaseGuard::new(dir.path().join("leases"), Duration::from_secs(60), "cfg")
            .with_probe(probe.clone())
            .with_checkpoint_store(store.clone());
        assert!(matches!(
            guard.try_acquire("repo", "run-new"),
            Err(LeaseError::AlreadyLocked { owner_pid: 4242, .. })
        ));
        // Resuming that same run is not blocked by its own checkpoint.
        assert!(guard.try_acquire("repo", "run-other").is_ok());

        probe.alive.lock().unwrap().clear();
        cp.status = PipelineStatus::InProgress;
        store.save(&cp).unwrap();
        let guard = LeaseGuard::new(dir.path().join("leases2"), Duration::from_secs(60), "cfg")
            .with_probe(probe)
            .with_checkpoint_store(store);
        assert!(guard.try_acquire("repo", "run-new").is_ok());
    }

    #[test]
    fn test_renew_refreshes_and_detects_takeover() {
        let dir = tempdir().unwrap();
        let guard = guard(dir.path());
        let mut lease = guard.try_acquire("repo", "run-1").unwrap();
        let first = lease.record().renewed_at;
        std::thread::sleep(Duration::from_millis(5));
        lease.renew().unwrap();
        assert!(lease.record().renewed_at > first);
        assert_eq!(guard.read("repo").unwrap().unwrap().renewed_at, lease.record().renewed_at);

        fs::remove_file(lease.path()).unwrap();
        plant(&guard, "repo", 4242, 0);
        assert!(lease.renew().is_err());
        drop(lease);
        // Dropping a lease that was taken over leaves the new holder's file in place.
        assert_eq!(guard.read("repo").unwrap().unwrap().owner_process_id, 4242);
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(300),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(300));
        assert_eq!(policy.backoff(9), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_retry_succeeds_once_holder_releases() {
        let dir = tempdir().unwrap();
        let guard = Arc::new(guard(dir.path()));
        let held = guard.try_acquire("repo", "run-1").unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(held);
        });

        let policy = RetryPolicy {
            attempts: 10,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
        };
        let lease = guard
            .try_acquire_with_retry("repo", "run-2", &policy)
            .await
            .unwrap();
        assert_eq!(lease.record().run_id, "run-2");
    }

    #[tokio::test]
    async fn test_retry_gives_up_with_typed_error() {
        let dir = tempdir().unwrap();
        let guard = guard(dir.path());
        let _held = guard.try_acquire("repo", "run-1").unwrap();
        let policy = RetryPolicy {
            attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        };
        let err = guard
            .try_acquire_with_retry("repo", "run-2", &policy)
            .await
            .unwrap_err();
        assert!(err.is_contention());
    }
}
