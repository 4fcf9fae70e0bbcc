//! Run cancellation — `conductor cancel`.

use anyhow::{Result, bail};
use console::style;
use std::path::Path;

use conductor::checkpoint::{CheckpointStore, FsCheckpointStore};
use conductor::conductor_config::CliOverrides;
use conductor::config::Config;
use conductor::lease::ProcessProbe;
use conductor::orchestrator::{CancelOutcome, request_cancel, resume_command};

pub fn cmd_cancel(project_dir: &Path, run_id: Option<&str>) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), false, &CliOverrides::default())?;
    if !config.is_initialized() {
        bail!("Project not initialized. Run 'conductor init' first.");
    }
    let store = FsCheckpointStore::new(&config.runs_dir);
    let run_id = match run_id {
        Some(id) => id.to_string(),
        None => match store.latest()? {
            Some(id) => id,
            None => bail!("No runs to cancel."),
        },
    };

    let outcome = request_cancel(&store, &config.run_dir(&run_id), &run_id, &ProcessProbe)?;
    println!();
    match outcome {
        CancelOutcome::Signalled { owner_pid } => {
            println!(
                "Cancel requested for run {}; process {} will stop its current phase.",
                style(&run_id).bold(),
                owner_pid
            );
        }
        CancelOutcome::MarkedDirectly { phase } => {
            match phase {
                Some(phase) => println!(
                    "Run {} had no running orchestrator; marked cancelled in phase {}.",
                    style(&run_id).bold(),
                    phase
                ),
                None => println!(
                    "Run {} had no running orchestrator; marked cancelled.",
                    style(&run_id).bold()
                ),
            }
            println!("Resume with: {}", style(resume_command(&run_id)).cyan());
        }
        CancelOutcome::AlreadyFinished { status } => {
            println!(
                "Run {} is not running (status: {}); nothing to cancel.",
                style(&run_id).bold(),
                status
            );
        }
    }
    println!();
    Ok(())
}
