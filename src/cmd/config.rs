//! Configuration view and validation commands — `conductor config`.

use anyhow::Result;
use std::path::Path;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    use conductor::conductor_config::{CONFIG_FILE, ConductorConfig, ConductorToml};
    use conductor::init::{CONDUCTOR_DIR, starter_config};

    let conductor_dir = project_dir.join(CONDUCTOR_DIR);
    let config_path = conductor_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Conductor Configuration");
            println!("=======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No conductor.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();

            // Effective values: file, then CONDUCTOR_* environment overrides.
            let config = ConductorConfig::new(project_dir.to_path_buf())?;
            let toml = &config.toml;

            println!("[pipeline]");
            println!("  total_budget_secs = {}", toml.pipeline.total_budget.as_secs());
            println!("  lease_ttl_secs = {}", toml.pipeline.lease_ttl.as_secs());
            println!("  shutdown_grace_secs = {}", toml.pipeline.shutdown_grace.as_secs());
            if let Some(worktree) = &toml.pipeline.shared_worktree {
                println!("  shared_worktree = \"{}\"", worktree.display());
            }
            println!();

            println!("[pool]");
            println!("  workers = {}", toml.pool.workers);
            println!("  poll_interval_secs = {}", toml.pool.poll_interval.as_secs());
            println!("  stale_warn_secs = {}", toml.pool.stale_warn.as_secs());
            println!("  auto_release_secs = {}", toml.pool.auto_release.as_secs());
            println!();

            println!("[convergence]");
            println!("  enabled = {}", toml.convergence.enabled);
            println!("  remediation = \"{}\"", toml.convergence.remediation);
            println!("  verification = \"{}\"", toml.convergence.verification);
            println!("  max_rounds = {}", toml.convergence.max_rounds);
            println!("  acceptance_threshold = {}", toml.convergence.acceptance_threshold);
            println!("  stop_on_regression = {}", toml.convergence.stop_on_regression);
            println!();

            let phases = toml.phase_definitions();
            if toml.phases.is_empty() {
                println!("{} phase(s) (standard pipeline, no commands configured)", phases.len());
            } else {
                println!("{} phase(s); see 'conductor phases'", phases.len());
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No conductor.toml found. Run 'conductor config init' to create one.");
                println!();
                return Ok(());
            }

            let toml = ConductorToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("conductor.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if !conductor_dir.exists() {
                std::fs::create_dir_all(&conductor_dir)?;
            }

            starter_config().save(&config_path)?;

            println!("Created conductor.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [pipeline] total_budget_secs, lease_ttl_secs, shared_worktree");
            println!("  - [pool] workers and polling cadence");
            println!("  - [convergence] the remediation/verification loop");
            println!("  - [[phases]] order, timeouts and the commands each phase runs");
            println!();
        }
    }

    Ok(())
}
