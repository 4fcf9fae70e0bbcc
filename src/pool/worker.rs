//! Worker loops that claim tasks from a board and run them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::board::TaskBoard;
use super::task::WorkerTask;
use crate::broker::{BrokerHandle, Changeset, CommitResult};

pub const DEFAULT_CLAIM_INTERVAL: Duration = Duration::from_millis(500);

/// Result of executing one task. Side effects travel as a changeset and are
/// applied by the commit broker, never by the worker itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOutput {
    pub summary: Option<String>,
    pub changeset: Option<Changeset>,
}

/// Everything a worker sees besides the task itself.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub worker_id: String,
    pub group_id: String,
    pub run_id: String,
    pub phase: String,
    /// Root for per-task scratch directories.
    pub work_dir: PathBuf,
    pub broker: Option<BrokerHandle>,
    pub cancel: CancellationToken,
}

/// Pluggable task execution. Implementations must tolerate re-running a task
/// that was auto-released after a partial attempt.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn execute(&self, ctx: &WorkerContext, task: &WorkerTask) -> anyhow::Result<TaskOutput>;
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub count: usize,
    pub claim_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            count: 4,
            claim_interval: DEFAULT_CLAIM_INTERVAL,
        }
    }
}

/// Running worker loops for one group.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop claiming, give in-flight tasks `grace` to finish, then abort.
    pub async fn shutdown(self, grace: Duration) {
        self.cancel.cancel();
        let aborts: Vec<_> = self.handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(grace, join_all(self.handles)).await.is_err() {
            tracing::warn!(workers = aborts.len(), "Workers did not stop in time; aborting");
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

/// Spawn `settings.count` worker loops over `board`.
///
/// `template` supplies the group, run and broker wiring; each loop gets its
/// own `worker_id` and a child cancellation token.
pub fn spawn_workers(
    board: TaskBoard,
    worker: Arc<dyn Worker>,
    settings: &WorkerSettings,
    template: WorkerContext,
) -> WorkerPool {
    let cancel = template.cancel.child_token();
    let handles = (0..settings.count.max(1))
        .map(|n| {
            let ctx = WorkerContext {
                worker_id: format!("{}-w{}", template.group_id, n + 1),
                cancel: cancel.clone(),
                ..template.clone()
            };
            let board = board.clone();
            let worker = Arc::clone(&worker);
            let claim_interval = settings.claim_interval;
            tokio::spawn(async move { worker_loop(board, worker, ctx, claim_interval).await })
        })
        .collect();
    WorkerPool { handles, cancel }
}

async fn worker_loop(
    board: TaskBoard,
    worker: Arc<dyn Worker>,
    ctx: WorkerContext,
    claim_interval: Duration,
) {
    tracing::debug!(worker = %ctx.worker_id, "Worker started");
    loop {
        if ctx.cancel.is_cancelled() || !board.is_open() {
            break;
        }
        match board.claim_next(&ctx.worker_id) {
            Some(task) => run_task(&board, worker.as_ref(), &ctx, task).await,
            None => {
                if board.is_settled() {
                    break;
                }
                tokio::select! {
                    _ = ctx.cancel.cancelled() => break,
                    _ = tokio::time::sleep(claim_interval) => {}
                }
            }
        }
    }
    tracing::debug!(worker = %ctx.worker_id, "Worker stopped");
}

async fn run_task(board: &TaskBoard, worker: &dyn Worker, ctx: &WorkerContext, task: WorkerTask) {
    tracing::info!(worker = %ctx.worker_id, task = %task.id, attempt = task.attempts, "Running task");

    let result = tokio::select! {
        r = worker.execute(ctx, &task) => r,
        _ = ctx.cancel.cancelled() => {
            tracing::info!(worker = %ctx.worker_id, task = %task.id, "Abandoning task on cancel");
            return;
        }
    };

    let output = match result {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!(task = %task.id, error = %e, "Task failed");
            board.fail(&task.id, &ctx.worker_id, &format!("{:#}", e));
            return;
        }
    };

    let revision = match output.changeset {
        None => None,
        Some(mut changeset) => {
            // Ledger key; task ids repeat across groups of the same run.
            changeset.task_id = format!("{}/{}", ctx.group_id, task.id);
            match commit(ctx, changeset).await {
                Ok(revision) => revision,
                Err(reason) => {
                    tracing::warn!(task = %task.id, reason = %reason, "Task changeset was not committed");
                    board.fail(&task.id, &ctx.worker_id, &reason);
                    return;
                }
            }
        }
    };

    if !board.complete(&task.id, &ctx.worker_id, output.summary, revision) {
        tracing::warn!(
            worker = %ctx.worker_id,
            task = %task.id,
            "Task finished after losing ownership; result discarded"
        );
    }
}

/// Hand a changeset to the broker. `Ok(revision)` for anything that leaves the
/// shared resource consistent with the task; `Err(reason)` otherwise.
async fn commit(ctx: &WorkerContext, changeset: Changeset) -> Result<Option<String>, String> {
    if changeset.is_empty() {
        return Ok(None);
    }
    let Some(broker) = &ctx.broker else {
        return Err("task produced a changeset but no shared resource is configured".to_string());
    };
    match broker.apply(changeset).await {
        Ok(CommitResult::Applied { revision, .. }) => Ok(Some(revision)),
        Ok(CommitResult::NoOp) | Ok(CommitResult::Duplicate) => Ok(None),
        Ok(CommitResult::NeedsManualMerge { conflicts }) => Err(format!(
            "needs manual merge: {}",
            conflicts
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{PollSettings, PoolCoordinator, TaskDescriptor, TaskStatus};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Records start/finish order and fails tasks whose id starts with "bad".
    #[derive(Default)]
    struct RecordingWorker {
        events: Mutex<Vec<String>>,
        statuses_seen: Mutex<HashMap<String, Vec<(String, TaskStatus)>>>,
        board: Mutex<Option<TaskBoard>>,
    }

    #[async_trait]
    impl Worker for RecordingWorker {
        async fn execute(&self, _ctx: &WorkerContext, task: &WorkerTask) -> anyhow::Result<TaskOutput> {
            if let Some(board) = self.board.lock().unwrap().as_ref() {
                let seen = task
                    .blocked_by
                    .iter()
                    .map(|d| (d.clone(), board.task(d).unwrap().status))
                    .collect();
                self.statuses_seen
                    .lock()
                    .unwrap()
                    .insert(task.id.clone(), seen);
            }
            self.events.lock().unwrap().push(format!("start:{}", task.id));
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.events.lock().unwrap().push(format!("end:{}", task.id));
            if task.id.starts_with("bad") {
                anyhow::bail!("simulated failure");
            }
            Ok(TaskOutput {
                summary: Some(format!("did {}", task.id)),
                changeset: None,
            })
        }
    }

    fn template(group_id: &str, cancel: CancellationToken) -> WorkerContext {
        WorkerContext {
            worker_id: String::new(),
            group_id: group_id.to_string(),
            run_id: "run-1".into(),
            phase: "implement".into(),
            work_dir: std::env::temp_dir(),
            broker: None,
            cancel,
        }
    }

    fn fast_poll() -> PollSettings {
        PollSettings {
            poll_interval: Duration::from_millis(10),
            hard_timeout: Duration::from_secs(10),
            ..PollSettings::default()
        }
    }

    fn fast_workers(count: usize) -> WorkerSettings {
        WorkerSettings {
            count,
            claim_interval: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_workers_respect_dependency_order() {
        let coordinator = PoolCoordinator::new();
        let board = coordinator
            .create_group_with_id(
                "g1",
                vec![
                    TaskDescriptor::new("a", ""),
                    TaskDescriptor::new("b", "").blocked_by(&["a"]),
                    TaskDescriptor::new("c", ""),
                    TaskDescriptor::new("d", "").blocked_by(&["b", "c"]),
                ],
            )
            .unwrap();
        let worker = Arc::new(RecordingWorker::default());
        *worker.board.lock().unwrap() = Some(board.clone());

        let cancel = CancellationToken::new();
        let pool = spawn_workers(board.clone(), worker.clone(), &fast_workers(3), template("g1", cancel.clone()));
        let result = coordinator.poll("g1", &fast_poll(), &cancel).await.unwrap();
        pool.shutdown(Duration::from_secs(1)).await;

        assert!(result.is_success());
        let seen = worker.statuses_seen.lock().unwrap();
        for (task, deps) in seen.iter() {
            for (dep, status) in deps {
                assert_eq!(*status, TaskStatus::Completed, "{} started before {}", task, dep);
            }
        }
        let events = worker.events.lock().unwrap();
        let pos = |e: &str| events.iter().position(|x| x == e).unwrap();
        assert!(pos("end:a") < pos("start:b"));
        assert!(pos("end:b") < pos("start:d"));
        assert!(pos("end:c") < pos("start:d"));
    }

    #[tokio::test]
    async fn test_failed_task_fails_dependents_and_group_settles() {
        let coordinator = PoolCoordinator::new();
        let board = coordinator
            .create_group_with_id(
                "g1",
                vec![
                    TaskDescriptor::new("bad", ""),
                    TaskDescriptor::new("after", "").blocked_by(&["bad"]),
                    TaskDescriptor::new("ok", ""),
                ],
            )
            .unwrap();
        let worker = Arc::new(RecordingWorker::default());
        let cancel = CancellationToken::new();
        let pool = spawn_workers(board.clone(), worker, &fast_workers(2), template("g1", cancel.clone()));
        let result = coordinator.poll("g1", &fast_poll(), &cancel).await.unwrap();
        pool.shutdown(Duration::from_secs(1)).await;

        assert!(!result.timed_out);
        assert_eq!(result.completed, vec!["ok"]);
        assert_eq!(result.failed.len(), 2);
        assert!(board.task("bad").unwrap().error.unwrap().contains("simulated failure"));
    }

    #[tokio::test]
    async fn test_changeset_without_broker_fails_task() {
        struct ChangingWorker;

        #[async_trait]
        impl Worker for ChangingWorker {
            async fn execute(&self, _ctx: &WorkerContext, task: &WorkerTask) -> anyhow::Result<TaskOutput> {
                Ok(TaskOutput {
                    summary: None,
                    changeset: Some(Changeset::new(&task.id, "edit").write("a.txt", "x")),
                })
            }
        }

        let coordinator = PoolCoordinator::new();
        let board = coordinator
            .create_group_with_id("g1", vec![TaskDescriptor::new("t", "")])
            .unwrap();
        let cancel = CancellationToken::new();
        let pool = spawn_workers(board.clone(), Arc::new(ChangingWorker), &fast_workers(1), template("g1", cancel.clone()));
        let result = coordinator.poll("g1", &fast_poll(), &cancel).await.unwrap();
        pool.shutdown(Duration::from_secs(1)).await;

        assert_eq!(result.failed, vec!["t"]);
        assert!(board.task("t").unwrap().error.unwrap().contains("no shared resource"));
    }

    #[tokio::test]
    async fn test_shutdown_aborts_stuck_workers() {
        struct StuckWorker;

        #[async_trait]
        impl Worker for StuckWorker {
            async fn execute(&self, _ctx: &WorkerContext, _task: &WorkerTask) -> anyhow::Result<TaskOutput> {
                // Ignores cancellation on purpose.
                std::future::pending::<()>().await;
                Ok(TaskOutput::default())
            }
        }

        let coordinator = PoolCoordinator::new();
        let board = coordinator
            .create_group_with_id("g1", vec![TaskDescriptor::new("t", "")])
            .unwrap();
        let pool = spawn_workers(board.clone(), Arc::new(StuckWorker), &fast_workers(1), template("g1", CancellationToken::new()));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        pool.shutdown(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        // Cancelling the loop abandons the task; the board keeps it in progress
        // until the coordinator cancels or sweeps the group.
        assert_eq!(board.task("t").unwrap().status, TaskStatus::InProgress);
    }
}
