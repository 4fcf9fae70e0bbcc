//! Handlers that run shell commands configured on the phase definitions.
//!
//! Every command runs through `sh -c` with the dispatch described in
//! `CONDUCTOR_*` environment variables. A command may write its artifact to
//! `$CONDUCTOR_ARTIFACT`; if it does not, its stdout becomes the artifact.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::Instant;
use walkdir::WalkDir;

use super::{PhaseHandler, PoolPhaseHandler, reset_artifact};
use crate::broker::Changeset;
use crate::phase::{PhaseContext, PhaseOutcome};
use crate::pool::{TaskDescriptor, TaskOutput, Worker, WorkerContext, WorkerTask};
use crate::util::{extract_json_object, write_atomic};

static ISSUES_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<issues>\s*(\d+)\s*</issues>").unwrap());

/// Longest stderr/stdout excerpt carried into outcome messages.
const EXCERPT_CHARS: usize = 400;

/// Last `<issues>N</issues>` marker in `text`.
pub fn parse_issue_count(text: &str) -> Option<u32> {
    ISSUES_REGEX
        .captures_iter(text)
        .last()
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn excerpt(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    let skip = text.chars().count().saturating_sub(EXCERPT_CHARS);
    text.chars().skip(skip).collect()
}

fn phase_command(command: &str, ctx: &PhaseContext, cwd: &Path) -> Command {
    let upstream = ctx
        .upstream_paths()
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":");
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .env("CONDUCTOR_RUN_ID", &ctx.run_id)
        .env("CONDUCTOR_PHASE", &ctx.phase.name)
        .env("CONDUCTOR_SCOPE", &ctx.scope.id)
        .env("CONDUCTOR_ARTIFACT", &ctx.artifact_path)
        .env("CONDUCTOR_UPSTREAM", upstream)
        .env("CONDUCTOR_ROUND", ctx.round.to_string())
        .env("CONDUCTOR_RUN_DIR", &ctx.run_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .current_dir(cwd)
        .kill_on_drop(true);
    cmd
}

enum Finished {
    Exited(Output),
    Cancelled,
    TimedOut,
}

/// Run `cmd` until it exits, the context is cancelled, or `deadline` passes.
/// The child is killed when it is abandoned.
async fn run_until(mut cmd: Command, ctx: &PhaseContext, deadline: Instant) -> Result<Finished> {
    let child = cmd.spawn().context("Failed to spawn phase command")?;
    tokio::select! {
        _ = ctx.cancel.cancelled() => Ok(Finished::Cancelled),
        _ = tokio::time::sleep_until(deadline) => Ok(Finished::TimedOut),
        output = child.wait_with_output() => {
            Ok(Finished::Exited(output.context("Failed to wait for phase command")?))
        }
    }
}

/// Earlier of the phase's own inner timeout and the dispatch deadline.
fn inner_deadline(ctx: &PhaseContext) -> Instant {
    (Instant::now() + ctx.phase.inner_timeout).min(ctx.deadline)
}

/// Direct phase backed by one shell command.
pub struct CommandPhaseHandler {
    command: String,
    project_dir: PathBuf,
}

impl CommandPhaseHandler {
    pub fn new(command: &str, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.to_string(),
            project_dir: project_dir.into(),
        }
    }
}

#[async_trait]
impl PhaseHandler for CommandPhaseHandler {
    async fn run(&self, ctx: &PhaseContext) -> PhaseOutcome {
        tracing::info!(phase = %ctx.phase.name, command = %self.command, "Running phase command");
        if let Err(e) = reset_artifact(&ctx.artifact_path) {
            return PhaseOutcome::failure(format!(
                "failed to clear artifact {}: {}",
                ctx.artifact_path.display(),
                e
            ));
        }
        let cmd = phase_command(&self.command, ctx, &self.project_dir);
        let output = match run_until(cmd, ctx, inner_deadline(ctx)).await {
            Ok(Finished::Exited(output)) => output,
            Ok(Finished::Cancelled) => return PhaseOutcome::cancelled(),
            Ok(Finished::TimedOut) => {
                return PhaseOutcome::timeout(format!(
                    "command exceeded its {:?} budget",
                    ctx.phase.inner_timeout
                ));
            }
            Err(e) => return PhaseOutcome::failure(format!("{:#}", e)),
        };

        if !output.status.success() {
            return PhaseOutcome::failure(format!(
                "command exited with {}: {}",
                output.status,
                excerpt(&output.stderr)
            ));
        }

        // The artifact was cleared above, so an existing file came from this command.
        if !ctx.artifact_path.exists()
            && let Err(e) = write_atomic(&ctx.artifact_path, &output.stdout)
        {
            return PhaseOutcome::failure(format!(
                "failed to write artifact {}: {}",
                ctx.artifact_path.display(),
                e
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let issues = parse_issue_count(&stdout).or_else(|| {
            std::fs::read_to_string(&ctx.artifact_path)
                .ok()
                .and_then(|s| parse_issue_count(&s))
        });
        let outcome = PhaseOutcome::success(&ctx.artifact_path);
        match issues {
            Some(n) => outcome.with_issues(n),
            None => outcome,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PlanOutput {
    tasks: Vec<TaskDescriptor>,
}

/// Parse planner output: a JSON object `{"tasks": [...]}`, possibly surrounded by other text.
pub fn parse_plan(text: &str) -> Result<Vec<TaskDescriptor>> {
    let json = extract_json_object(text).context("planner output contains no JSON object")?;
    let plan: PlanOutput = serde_json::from_str(&json).context("invalid planner output")?;
    Ok(plan.tasks)
}

/// Pool phase whose tasks come from `plan_command` and run through `task_command`.
pub struct CommandPoolHandler {
    plan_command: String,
    project_dir: PathBuf,
    worker: Arc<CommandWorker>,
}

impl CommandPoolHandler {
    pub fn new(plan_command: &str, task_command: &str, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            plan_command: plan_command.to_string(),
            project_dir: project_dir.into(),
            worker: Arc::new(CommandWorker::new(task_command)),
        }
    }
}

#[async_trait]
impl PoolPhaseHandler for CommandPoolHandler {
    async fn plan(&self, ctx: &PhaseContext) -> Result<Vec<TaskDescriptor>> {
        let cmd = phase_command(&self.plan_command, ctx, &self.project_dir);
        match run_until(cmd, ctx, inner_deadline(ctx)).await? {
            Finished::Exited(output) if output.status.success() => {
                let tasks = parse_plan(&String::from_utf8_lossy(&output.stdout))?;
                tracing::info!(phase = %ctx.phase.name, tasks = tasks.len(), "Planned worker tasks");
                Ok(tasks)
            }
            Finished::Exited(output) => bail!(
                "plan command exited with {}: {}",
                output.status,
                excerpt(&output.stderr)
            ),
            Finished::Cancelled => bail!("planning cancelled"),
            Finished::TimedOut => bail!("planning exceeded the phase budget"),
        }
    }

    fn worker(&self) -> Arc<dyn Worker> {
        self.worker.clone()
    }
}

/// Runs one task through a shell command in a private scratch directory.
///
/// Everything the command leaves in the scratch directory becomes the task's
/// changeset, relative to the scratch root.
pub struct CommandWorker {
    command: String,
}

impl CommandWorker {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
        }
    }
}

fn collect_changeset(scratch: &Path, task: &WorkerTask, base: Option<String>) -> Result<Changeset> {
    let mut changeset = Changeset::new(&task.id, &task.description).with_base(base);
    for entry in WalkDir::new(scratch).sort_by_file_name() {
        let entry = entry.context("Failed to walk scratch directory")?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(scratch)
            .context("scratch entry outside scratch directory")?
            .to_path_buf();
        let content = std::fs::read_to_string(entry.path())
            .with_context(|| format!("Task output {} is not UTF-8 text", rel.display()))?;
        changeset = changeset.write(rel, content);
    }
    Ok(changeset)
}

#[async_trait]
impl Worker for CommandWorker {
    async fn execute(&self, ctx: &WorkerContext, task: &WorkerTask) -> Result<TaskOutput> {
        let scratch = ctx.work_dir.join(&task.id);
        // A released task may run again; start from a clean directory.
        if scratch.exists() {
            std::fs::remove_dir_all(&scratch)
                .with_context(|| format!("Failed to clear {}", scratch.display()))?;
        }
        std::fs::create_dir_all(&scratch)
            .with_context(|| format!("Failed to create {}", scratch.display()))?;

        let base = match &ctx.broker {
            Some(broker) => broker.revision().await?,
            None => None,
        };

        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("CONDUCTOR_RUN_ID", &ctx.run_id)
            .env("CONDUCTOR_PHASE", &ctx.phase)
            .env("CONDUCTOR_GROUP_ID", &ctx.group_id)
            .env("CONDUCTOR_WORKER_ID", &ctx.worker_id)
            .env("CONDUCTOR_TASK_ID", &task.id)
            .env("CONDUCTOR_TASK_DESCRIPTION", &task.description)
            .env("CONDUCTOR_OUTPUT_DIR", &scratch)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&scratch)
            .kill_on_drop(true)
            .output()
            .await
            .context("Failed to run task command")?;

        if !output.status.success() {
            bail!(
                "task command exited with {}: {}",
                output.status,
                excerpt(&output.stderr)
            );
        }

        let changeset = collect_changeset(&scratch, task, base)?;
        let summary = excerpt(&output.stdout);
        Ok(TaskOutput {
            summary: (!summary.is_empty()).then_some(summary),
            changeset: (!changeset.is_empty()).then_some(changeset),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::ScopeDescriptor;
    use crate::phase::{PhaseDefinition, PhaseResultStatus};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn context(dir: &Path, inner: Duration) -> PhaseContext {
        PhaseContext {
            run_id: "run-test".to_string(),
            phase: PhaseDefinition::new("review", 1, inner),
            scope: ScopeDescriptor::new("scope-a", "test scope"),
            flags: BTreeMap::new(),
            upstream: Vec::new(),
            artifact_path: dir.join("artifacts").join("01-review.out"),
            run_dir: dir.to_path_buf(),
            round: 0,
            worker_group_id: None,
            deadline: Instant::now() + Duration::from_secs(30),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_parse_issue_count_takes_last_marker() {
        assert_eq!(parse_issue_count("no marker"), None);
        assert_eq!(parse_issue_count("<issues>3</issues>"), Some(3));
        assert_eq!(
            parse_issue_count("<issues>5</issues>\nfixed\n<issues> 2 </issues>"),
            Some(2)
        );
    }

    #[test]
    fn test_parse_plan_tolerates_surrounding_text() {
        let tasks = parse_plan(
            r#"planning...
{"tasks": [{"id": "a"}, {"id": "b", "description": "second", "blocked_by": ["a"]}]}
done"#,
        )
        .unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].blocked_by, vec!["a".to_string()]);
        assert!(parse_plan("nothing here").is_err());
    }

    #[tokio::test]
    async fn test_stdout_becomes_artifact() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path(), Duration::from_secs(10));
        let handler = CommandPhaseHandler::new(
            "echo \"phase $CONDUCTOR_PHASE\"; echo '<issues>4</issues>'",
            dir.path(),
        );

        let outcome = handler.run(&ctx).await;

        assert_eq!(outcome.status, PhaseResultStatus::Success);
        assert_eq!(outcome.issue_count, Some(4));
        let artifact = std::fs::read_to_string(&ctx.artifact_path).unwrap();
        assert!(artifact.contains("phase review"));
    }

    #[tokio::test]
    async fn test_command_written_artifact_is_kept() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path(), Duration::from_secs(10));
        std::fs::create_dir_all(ctx.artifact_path.parent().unwrap()).unwrap();
        let handler = CommandPhaseHandler::new(
            "echo written > \"$CONDUCTOR_ARTIFACT\"; echo ignored",
            dir.path(),
        );

        let outcome = handler.run(&ctx).await;

        assert!(outcome.is_success());
        assert_eq!(
            std::fs::read_to_string(&ctx.artifact_path).unwrap().trim(),
            "written"
        );
    }

    #[tokio::test]
    async fn test_rerun_replaces_previous_artifact() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path(), Duration::from_secs(10));
        std::fs::create_dir_all(ctx.artifact_path.parent().unwrap()).unwrap();
        std::fs::write(&ctx.artifact_path, "output from round 0\n<issues>5</issues>\n").unwrap();

        let outcome = CommandPhaseHandler::new("echo fresh", dir.path()).run(&ctx).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.issue_count, None);
        assert_eq!(std::fs::read_to_string(&ctx.artifact_path).unwrap(), "fresh\n");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path(), Duration::from_secs(10));
        let handler = CommandPhaseHandler::new("echo broken >&2; exit 3", dir.path());

        let outcome = handler.run(&ctx).await;

        assert_eq!(outcome.status, PhaseResultStatus::Failure);
        assert!(outcome.message.unwrap().contains("broken"));
        assert!(!ctx.artifact_path.exists());
    }

    #[tokio::test]
    async fn test_inner_timeout_kills_command() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path(), Duration::from_millis(100));
        let handler = CommandPhaseHandler::new("sleep 5", dir.path());

        let started = std::time::Instant::now();
        let outcome = handler.run(&ctx).await;

        assert_eq!(outcome.status, PhaseResultStatus::Timeout);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_cancel_stops_command() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path(), Duration::from_secs(10));
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let outcome = CommandPhaseHandler::new("sleep 5", dir.path()).run(&ctx).await;

        assert_eq!(outcome.status, PhaseResultStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_worker_collects_scratch_files() {
        let dir = TempDir::new().unwrap();
        let ctx = WorkerContext {
            worker_id: "g-w1".to_string(),
            group_id: "g".to_string(),
            run_id: "run-test".to_string(),
            phase: "implement".to_string(),
            work_dir: dir.path().to_path_buf(),
            broker: None,
            cancel: CancellationToken::new(),
        };
        let task = WorkerTask::from(TaskDescriptor::new("t1", "write two files"));
        let worker = CommandWorker::new(
            "mkdir -p src && echo \"$CONDUCTOR_TASK_ID\" > src/t.txt && echo done > notes.md && echo ok",
        );

        let output = worker.execute(&ctx, &task).await.unwrap();

        assert_eq!(output.summary.as_deref(), Some("ok"));
        let changeset = output.changeset.unwrap();
        assert_eq!(changeset.task_id, "t1");
        let paths: Vec<_> = changeset.files.iter().map(|f| f.path.clone()).collect();
        assert_eq!(paths, vec![PathBuf::from("notes.md"), PathBuf::from("src/t.txt")]);
        assert_eq!(changeset.files[1].content.as_deref(), Some("t1\n"));
    }

    #[tokio::test]
    async fn test_worker_failure_is_an_error() {
        let dir = TempDir::new().unwrap();
        let ctx = WorkerContext {
            worker_id: "g-w1".to_string(),
            group_id: "g".to_string(),
            run_id: "run-test".to_string(),
            phase: "implement".to_string(),
            work_dir: dir.path().to_path_buf(),
            broker: None,
            cancel: CancellationToken::new(),
        };
        let task = WorkerTask::from(TaskDescriptor::new("t1", ""));
        let err = CommandWorker::new("exit 1").execute(&ctx, &task).await.unwrap_err();
        assert!(err.to_string().contains("exited"));
    }
}
