//! Run inspection — `conductor status`, `conductor list`, `conductor phases`.

use anyhow::Result;
use console::{StyledObject, style};
use std::path::Path;

use conductor::budget::phase_outer_timeout;
use conductor::checkpoint::{CheckpointStore, FsCheckpointStore, PhaseStatus, PipelineStatus};
use conductor::conductor_config::CliOverrides;
use conductor::config::Config;
use conductor::lease::process_alive;
use conductor::orchestrator::PipelineReport;

fn load_config(project_dir: &Path) -> Result<Option<Config>> {
    let config = Config::new(project_dir.to_path_buf(), false, &CliOverrides::default())?;
    if !config.is_initialized() {
        println!();
        println!("Project not initialized. Run 'conductor init' first.");
        println!();
        return Ok(None);
    }
    Ok(Some(config))
}

pub fn styled_pipeline_status(status: PipelineStatus) -> StyledObject<&'static str> {
    color_pipeline(style(status.as_str()), status)
}

fn color_pipeline<D>(text: StyledObject<D>, status: PipelineStatus) -> StyledObject<D> {
    match status {
        PipelineStatus::Completed => text.green(),
        PipelineStatus::InProgress => text.yellow(),
        PipelineStatus::Failed | PipelineStatus::Timeout => text.red(),
        PipelineStatus::Cancelled => text.dim(),
    }
}

pub fn styled_phase_status(status: PhaseStatus) -> StyledObject<&'static str> {
    let text = style(status.as_str());
    match status {
        PhaseStatus::Completed => text.green(),
        PhaseStatus::InProgress => text.yellow(),
        PhaseStatus::Failed | PhaseStatus::Timeout => text.red(),
        PhaseStatus::Pending | PhaseStatus::Skipped | PhaseStatus::Cancelled => text.dim(),
    }
}

/// Print the end-of-run summary, including how to resume a stopped run.
pub fn print_report(report: &PipelineReport) {
    println!();
    println!(
        "Run {}: {}",
        style(&report.run_id).bold(),
        styled_pipeline_status(report.status)
    );
    for phase in &report.phases {
        print!("  {:<12} {}", phase.name, styled_phase_status(phase.status));
        if phase.reopened > 0 {
            print!(" {}", style(format!("(re-run x{})", phase.reopened)).dim());
        }
        if let Some(error) = &phase.error {
            print!(" {}", style(error).dim());
        }
        println!();
    }

    if !report.demoted.is_empty() {
        println!();
        println!("Re-run because their artifacts changed:");
        for demoted in &report.demoted {
            println!("  {} ({})", demoted.name, demoted.reason);
        }
    }

    if !report.convergence.history.is_empty() {
        println!();
        println!("Convergence:");
        for round in &report.convergence.history {
            println!(
                "  round {}: {} -> {} issues, {}",
                round.round, round.issues_before, round.issues_after, round.verdict
            );
        }
    }

    if let Some(failure) = &report.failure {
        println!();
        match &failure.phase {
            Some(phase) => println!(
                "{} in phase {}: {}",
                style("Stopped").red().bold(),
                phase,
                failure.reason
            ),
            None => println!("{}: {}", style("Stopped").red().bold(), failure.reason),
        }
        if failure.resumable {
            println!("Resume with: {}", style(&failure.resume_command).cyan());
        } else {
            println!("Not resumable without manual intervention");
        }
    }
    println!();
}

pub fn cmd_status(project_dir: &Path, run_id: Option<&str>) -> Result<()> {
    let Some(config) = load_config(project_dir)? else {
        return Ok(());
    };
    let store = FsCheckpointStore::new(&config.runs_dir);
    let run_id = match run_id {
        Some(id) => id.to_string(),
        None => match store.latest()? {
            Some(id) => id,
            None => {
                println!();
                println!("No runs yet. Start one with 'conductor run'.");
                println!();
                return Ok(());
            }
        },
    };
    let checkpoint = store.load(&run_id)?;

    println!();
    println!("Conductor Run Status");
    println!("====================");
    println!();
    println!("Run:      {}", checkpoint.id);
    println!("Scope:    {}", checkpoint.scope.id);
    if !checkpoint.scope.description.is_empty() {
        println!("          {}", style(&checkpoint.scope.description).dim());
    }
    println!("Started:  {}", checkpoint.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("Updated:  {}", checkpoint.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if checkpoint.status == PipelineStatus::InProgress {
        let pid = checkpoint.owner.process_id;
        let owner = if pid != 0 && process_alive(pid) {
            format!("process {} (running)", pid)
        } else {
            format!(
                "process {} ({})",
                pid,
                style("exited; resume or cancel the run").yellow()
            )
        };
        println!("Owner:    {}", owner);
    }
    if checkpoint.convergence.round > 0 {
        println!(
            "Round:    {} of {}",
            checkpoint.convergence.round, checkpoint.convergence.max_rounds
        );
    }

    print_report(&PipelineReport::from_stored(&checkpoint));
    Ok(())
}

pub fn cmd_list(project_dir: &Path) -> Result<()> {
    let Some(config) = load_config(project_dir)? else {
        return Ok(());
    };
    let store = FsCheckpointStore::new(&config.runs_dir);
    let checkpoints = store.load_all()?;
    if checkpoints.is_empty() {
        println!();
        println!("No runs yet. Start one with 'conductor run'.");
        println!();
        return Ok(());
    }

    println!();
    println!(
        "{:<34} {:<12} {:<20} {:<12} Updated",
        "Run", "Status", "Scope", "Phase"
    );
    println!(
        "{:<34} {:<12} {:<20} {:<12} -------",
        "-".repeat(34),
        "------",
        "-----",
        "-----"
    );
    for cp in &checkpoints {
        let phase = cp
            .active_phase()
            .or_else(|| cp.phases.iter().find(|p| !p.status.is_done()))
            .map(|p| p.name.as_str())
            .unwrap_or("-");
        println!(
            "{:<34} {:<12} {:<20} {:<12} {}",
            cp.id,
            // Pad before styling; escape codes would throw off the width.
            color_pipeline(style(format!("{:<12}", cp.status.as_str())), cp.status),
            cp.scope.id,
            phase,
            cp.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!();
    println!("{} run(s)", checkpoints.len());
    println!();
    Ok(())
}

pub fn cmd_phases(project_dir: &Path) -> Result<()> {
    let Some(config) = load_config(project_dir)? else {
        return Ok(());
    };
    let mut phases = config.settings().phase_definitions();
    phases.sort_by_key(|d| d.order);

    println!();
    println!("Phases from: {}", config.config_file.display());
    println!();
    println!(
        "{:<6} {:<12} {:<7} {:>9} {:>9}  {:<9} Flags",
        "Order", "Name", "Kind", "Inner(s)", "Outer(s)", "Failure"
    );
    for def in &phases {
        let kind = if def.has_worker_pool { "pool" } else { "direct" };
        let failure = if def.halts_on_failure { "halts" } else { "advisory" };
        let flags = if def.skippable {
            def.skip_flag()
        } else {
            String::new()
        };
        println!(
            "{:<6} {:<12} {:<7} {:>9} {:>9}  {:<9} {}",
            def.order,
            def.name,
            kind,
            def.inner_timeout.as_secs(),
            phase_outer_timeout(def).as_secs(),
            failure,
            flags
        );
    }
    println!();

    let convergence = &config.settings().convergence;
    if let Some((remediation, verification)) = convergence.pair() {
        println!(
            "Convergence: {} -> {} (up to {} retries, accept <= {} issues{})",
            remediation,
            verification,
            convergence.max_rounds,
            convergence.acceptance_threshold,
            if convergence.stop_on_regression {
                ", stop on regression"
            } else {
                ""
            }
        );
        println!();
    }
    Ok(())
}
