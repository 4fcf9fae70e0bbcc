use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::conductor_config::{CliOverrides, ConductorConfig, ConductorToml};
use crate::util::short_hash;

/// Runtime configuration for conductor.
///
/// Resolves the `.conductor/` state layout and carries the layered
/// `ConductorConfig` the orchestrator reads its settings from.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub conductor_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub leases_dir: PathBuf,
    pub log_dir: PathBuf,
    pub config_file: PathBuf,
    pub verbose: bool,
    settings: ConductorConfig,
}

impl Config {
    pub fn new(project_dir: PathBuf, verbose: bool, cli: &CliOverrides) -> Result<Self> {
        let settings = ConductorConfig::with_cli_args(project_dir, cli)?;
        let conductor_dir = settings.conductor_dir.clone();
        Ok(Self {
            project_dir: settings.project_dir.clone(),
            runs_dir: conductor_dir.join("runs"),
            leases_dir: conductor_dir.join("leases"),
            log_dir: conductor_dir.join("logs"),
            config_file: settings.config_file(),
            conductor_dir,
            verbose,
            settings,
        })
    }

    pub fn settings(&self) -> &ConductorToml {
        &self.settings.toml
    }

    pub fn conductor_config(&self) -> &ConductorConfig {
        &self.settings
    }

    pub fn is_initialized(&self) -> bool {
        self.conductor_dir.exists()
    }

    /// Identifies this configuration in lease and checkpoint owner records,
    /// so two projects never contend for each other's scopes.
    pub fn config_scope_id(&self) -> String {
        short_hash(&self.conductor_dir.to_string_lossy())
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.runs_dir).context("Failed to create runs directory")?;
        std::fs::create_dir_all(&self.leases_dir).context("Failed to create leases directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        Ok(())
    }
}
