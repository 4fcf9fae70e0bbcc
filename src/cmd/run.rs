//! Pipeline execution — `conductor run`.

use anyhow::{Context, Result, bail};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use conductor::broker::{CommitBroker, CommitLedger, GitWorkTree};
use conductor::checkpoint::ScopeDescriptor;
use conductor::conductor_config::{CliOverrides, ConvergenceSection};
use conductor::config::Config;
use conductor::handlers::{CommandPhaseHandler, CommandPoolHandler, HandlerRegistry};
use conductor::orchestrator::{ConvergenceLoop, Pipeline};
use conductor::phase::PhaseDefinition;
use tokio_util::sync::CancellationToken;

use super::super::{Cli, RunArgs};
use super::status::print_report;

/// Ledger of committed task changesets, shared by every run of the project.
pub const COMMIT_LEDGER_FILE: &str = "commit-ledger.json";

pub async fn cmd_run(cli: &Cli, project_dir: PathBuf, args: &RunArgs) -> Result<()> {
    let overrides = CliOverrides {
        total_budget: args.budget_secs.map(Duration::from_secs),
        workers: args.workers,
    };
    let config = Config::new(project_dir, cli.verbose, &overrides)?;
    if !config.is_initialized() {
        bail!("Project not initialized. Run 'conductor init' first.");
    }
    config.ensure_directories()?;
    for warning in config.conductor_config().validate() {
        tracing::warn!(warning = %warning, "Configuration warning");
    }

    let flags = parse_flags(&args.flags)?;
    let settings = config.settings();
    let phases = settings.phase_definitions();
    let registry = build_registry(&phases, &config.project_dir)?;
    let convergence = convergence_loop(&settings.convergence, &phases);

    let broker = match config.conductor_config().shared_worktree() {
        Some(root) => {
            let resource = GitWorkTree::open(&root)
                .with_context(|| format!("Failed to open shared worktree {}", root.display()))?;
            let ledger = CommitLedger::load(&config.conductor_dir.join(COMMIT_LEDGER_FILE))?;
            Some(CommitBroker::spawn(resource, ledger))
        }
        None => None,
    };

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!(
                    "{}",
                    console::style("Interrupted; cancelling the running phase...").yellow()
                );
                cancel.cancel();
            }
        })
    };

    let pipeline = Pipeline::builder(config.runs_dir.clone(), config.leases_dir.clone())
        .phases(phases)
        .registry(registry)
        .config_scope_id(&config.config_scope_id())
        .total_budget(settings.pipeline.total_budget)
        .lease_ttl(settings.pipeline.lease_ttl)
        .convergence(convergence)
        .pool_settings(settings.pool.poll_settings(), settings.pool.worker_settings())
        .broker(broker.as_ref().map(|b| b.handle()))
        .shutdown_grace(settings.pipeline.shutdown_grace)
        .cancel_token(cancel)
        .build()?;

    let result = match &args.resume {
        Some(run_id) => {
            let run_id = (!run_id.is_empty()).then_some(run_id.as_str());
            pipeline.resume(run_id).await
        }
        None => {
            let scope_id = match &args.scope {
                Some(scope) => scope.clone(),
                None => default_scope(&config.project_dir),
            };
            let scope = ScopeDescriptor::new(&scope_id, &args.description);
            pipeline.start(scope, flags).await
        }
    };

    ctrl_c.abort();
    if let Some(broker) = broker {
        broker.shutdown().await;
    }

    let report = result?;
    print_report(&report);
    if !report.is_success() {
        bail!("Run {} ended with status {}", report.run_id, report.status);
    }
    Ok(())
}

fn default_scope(project_dir: &Path) -> String {
    project_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "default".to_string())
}

/// Wire the built-in command handlers from the configured phase commands.
fn build_registry(phases: &[PhaseDefinition], project_dir: &Path) -> Result<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    for def in phases {
        if def.has_worker_pool {
            let (Some(plan), Some(task)) = (&def.plan_command, &def.task_command) else {
                bail!(
                    "Pool phase '{}' needs plan_command and task_command in conductor.toml",
                    def.name
                );
            };
            registry.register_pool(
                &def.name,
                Arc::new(CommandPoolHandler::new(plan, task, project_dir)),
            );
        } else {
            let Some(command) = &def.command else {
                bail!("Phase '{}' needs a command in conductor.toml", def.name);
            };
            registry.register_direct(
                &def.name,
                Arc::new(CommandPhaseHandler::new(command, project_dir)),
            );
        }
    }
    Ok(registry)
}

/// The configured fix/verify loop, if enabled and both phases exist.
fn convergence_loop(
    section: &ConvergenceSection,
    phases: &[PhaseDefinition],
) -> Option<ConvergenceLoop> {
    let (remediation, verification) = section.pair()?;
    let defined = |name: &str| phases.iter().any(|d| d.name == name);
    if !(defined(remediation) && defined(verification)) {
        return None;
    }
    Some(ConvergenceLoop {
        remediation: remediation.to_string(),
        verification: verification.to_string(),
        gate: section.gate(),
        stop_on_regression: section.stop_on_regression,
    })
}

/// Parse `--flag key=value` pairs. A bare key means `true`.
fn parse_flags(raw: &[String]) -> Result<BTreeMap<String, bool>> {
    let mut flags = BTreeMap::new();
    for entry in raw {
        let (key, value) = entry.split_once('=').unwrap_or((entry.as_str(), "true"));
        let key = key.trim();
        if key.is_empty() {
            bail!("Invalid flag '{}': expected key=value", entry);
        }
        let value = match value.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => true,
            "false" | "0" | "no" | "off" => false,
            other => bail!(
                "Invalid value '{}' for flag '{}': expected true or false",
                other,
                key
            ),
        };
        flags.insert(key.to_string(), value);
    }
    Ok(flags)
}
