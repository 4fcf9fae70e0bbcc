//! Project configuration read from `.conductor/conductor.toml`.
//!
//! Every field has a default, so a missing file or an empty one yields the
//! standard pipeline. Settings are layered file → environment → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [pipeline]
//! total_budget_secs = 14400
//! lease_ttl_secs = 14400
//! shutdown_grace_secs = 30
//! shared_worktree = "."
//!
//! [pool]
//! workers = 4
//! poll_interval_secs = 30
//! stale_warn_secs = 600
//! auto_release_secs = 1200
//! claim_interval_secs = 0.5
//!
//! [convergence]
//! enabled = true
//! remediation = "remediate"
//! verification = "verify"
//! max_rounds = 2
//! acceptance_threshold = 0
//! stop_on_regression = false
//!
//! [[phases]]
//! name = "build"
//! order = 1
//! inner_timeout_secs = 600
//! command = "make"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::budget;
use crate::convergence::{ConvergenceGate, DEFAULT_MAX_ROUNDS};
use crate::lease::DEFAULT_LEASE_TTL;
use crate::phase::{PhaseDefinition, default_phases, validate_definitions};
use crate::pool::coordinator::{DEFAULT_AUTO_RELEASE, DEFAULT_POLL_INTERVAL, DEFAULT_STALE_WARN};
use crate::pool::worker::DEFAULT_CLAIM_INTERVAL;
use crate::pool::{PollSettings, WorkerSettings};
use crate::util::duration_secs;

pub const CONFIG_FILE: &str = "conductor.toml";
pub const ENV_TOTAL_BUDGET: &str = "CONDUCTOR_TOTAL_BUDGET_SECS";
pub const ENV_POOL_WORKERS: &str = "CONDUCTOR_POOL_WORKERS";

/// Pipeline-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Wall-clock budget for one orchestrator session.
    #[serde(rename = "total_budget_secs", with = "duration_secs", default = "default_total_budget")]
    pub total_budget: Duration,
    #[serde(rename = "lease_ttl_secs", with = "duration_secs", default = "default_lease_ttl")]
    pub lease_ttl: Duration,
    /// How long workers get to finish in-flight tasks once their group closes.
    #[serde(rename = "shutdown_grace_secs", with = "duration_secs", default = "default_shutdown_grace")]
    pub shutdown_grace: Duration,
    /// Git worktree that pool changesets are committed to, relative to the project.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_worktree: Option<PathBuf>,
}

fn default_total_budget() -> Duration {
    Duration::from_secs(4 * 60 * 60)
}

fn default_lease_ttl() -> Duration {
    DEFAULT_LEASE_TTL
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(30)
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            total_budget: default_total_budget(),
            lease_ttl: default_lease_ttl(),
            shutdown_grace: default_shutdown_grace(),
            shared_worktree: None,
        }
    }
}

/// Worker pool cadence and size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSection {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(rename = "poll_interval_secs", with = "duration_secs", default = "default_poll_interval")]
    pub poll_interval: Duration,
    #[serde(rename = "stale_warn_secs", with = "duration_secs", default = "default_stale_warn")]
    pub stale_warn: Duration,
    #[serde(rename = "auto_release_secs", with = "duration_secs", default = "default_auto_release")]
    pub auto_release: Duration,
    #[serde(rename = "claim_interval_secs", with = "duration_secs", default = "default_claim_interval")]
    pub claim_interval: Duration,
}

fn default_workers() -> usize {
    4
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

fn default_stale_warn() -> Duration {
    DEFAULT_STALE_WARN
}

fn default_auto_release() -> Duration {
    DEFAULT_AUTO_RELEASE
}

fn default_claim_interval() -> Duration {
    DEFAULT_CLAIM_INTERVAL
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_interval: default_poll_interval(),
            stale_warn: default_stale_warn(),
            auto_release: default_auto_release(),
            claim_interval: default_claim_interval(),
        }
    }
}

impl PoolSection {
    /// Hard timeout is per phase; see `budget::poll_settings`.
    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            poll_interval: self.poll_interval,
            stale_warn: self.stale_warn,
            auto_release: self.auto_release,
            ..PollSettings::default()
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            count: self.workers,
            claim_interval: self.claim_interval,
        }
    }
}

/// The fix-then-verify loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Phase that applies fixes.
    #[serde(default = "default_remediation")]
    pub remediation: String,
    /// Phase whose issue count is compared against the baseline.
    #[serde(default = "default_verification")]
    pub verification: String,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    #[serde(default)]
    pub acceptance_threshold: u32,
    /// Halt the pipeline (resumably) when a round fails to reduce the issue count.
    #[serde(default)]
    pub stop_on_regression: bool,
}

fn default_true() -> bool {
    true
}

fn default_remediation() -> String {
    "remediate".to_string()
}

fn default_verification() -> String {
    "verify".to_string()
}

fn default_max_rounds() -> u32 {
    DEFAULT_MAX_ROUNDS
}

impl Default for ConvergenceSection {
    fn default() -> Self {
        Self {
            enabled: true,
            remediation: default_remediation(),
            verification: default_verification(),
            max_rounds: default_max_rounds(),
            acceptance_threshold: 0,
            stop_on_regression: false,
        }
    }
}

impl ConvergenceSection {
    pub fn gate(&self) -> ConvergenceGate {
        ConvergenceGate::new(self.max_rounds, self.acceptance_threshold)
    }

    /// `(remediation, verification)` when the loop is enabled.
    pub fn pair(&self) -> Option<(&str, &str)> {
        self.enabled
            .then_some((self.remediation.as_str(), self.verification.as_str()))
    }
}

/// Top-level `conductor.toml` document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConductorToml {
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub convergence: ConvergenceSection,
    /// Phase definitions. Empty means the standard pipeline.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phases: Vec<PhaseDefinition>,
}

impl ConductorToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse conductor.toml")
    }

    /// Load `.conductor/conductor.toml`, or the defaults if it does not exist.
    pub fn load_or_default(conductor_dir: &Path) -> Result<Self> {
        let config_path = conductor_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize conductor.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `CONDUCTOR_*` environment overrides on top of the file values.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var(ENV_TOTAL_BUDGET) {
            let secs: f64 = value
                .trim()
                .parse()
                .with_context(|| format!("{} must be a number of seconds, got '{}'", ENV_TOTAL_BUDGET, value))?;
            anyhow::ensure!(
                secs.is_finite() && secs > 0.0,
                "{} must be positive, got '{}'",
                ENV_TOTAL_BUDGET,
                value
            );
            self.pipeline.total_budget = Duration::from_secs_f64(secs);
        }
        if let Ok(value) = std::env::var(ENV_POOL_WORKERS) {
            self.pool.workers = value
                .trim()
                .parse()
                .with_context(|| format!("{} must be a worker count, got '{}'", ENV_POOL_WORKERS, value))?;
        }
        Ok(())
    }

    /// Configured phases, or the standard pipeline when none are configured.
    pub fn phase_definitions(&self) -> Vec<PhaseDefinition> {
        if self.phases.is_empty() {
            default_phases()
        } else {
            self.phases.clone()
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        let mut defs = self.phase_definitions();
        if let Err(e) = validate_definitions(&mut defs) {
            warnings.push(e.to_string());
        }
        if let Err(e) = budget::validate_budgets(&defs) {
            warnings.push(e.to_string());
        }

        if let Some((remediation, verification)) = self.convergence.pair() {
            let order = |name: &str| defs.iter().find(|d| d.name == name).map(|d| d.order);
            for (role, phase) in [("remediation", remediation), ("verification", verification)] {
                if order(phase).is_none() {
                    warnings.push(format!(
                        "Convergence {} phase '{}' is not a defined phase",
                        role, phase
                    ));
                }
            }
            if let (Some(r), Some(v)) = (order(remediation), order(verification))
                && r >= v
            {
                warnings.push(format!(
                    "Convergence remediation phase '{}' must come before verification phase '{}'",
                    remediation, verification
                ));
            }
        }

        if self.pool.workers == 0 {
            warnings.push("pool.workers is 0; one worker will be used".to_string());
        }
        if self.pool.auto_release <= self.pool.stale_warn {
            warnings.push(format!(
                "pool.auto_release_secs ({}) should exceed pool.stale_warn_secs ({})",
                self.pool.auto_release.as_secs(),
                self.pool.stale_warn.as_secs()
            ));
        }

        for def in &defs {
            if def.has_worker_pool && (def.plan_command.is_none() || def.task_command.is_none()) {
                warnings.push(format!(
                    "Pool phase '{}' needs both plan_command and task_command to run from the CLI",
                    def.name
                ));
            } else if !def.has_worker_pool && def.command.is_none() {
                warnings.push(format!(
                    "Phase '{}' has no command to run from the CLI",
                    def.name
                ));
            }
        }

        warnings
    }
}

/// Settings supplied on the command line; they win over file and environment.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub total_budget: Option<Duration>,
    pub workers: Option<usize>,
}

/// Project configuration with every layer applied.
#[derive(Debug, Clone)]
pub struct ConductorConfig {
    pub project_dir: PathBuf,
    pub conductor_dir: PathBuf,
    pub toml: ConductorToml,
}

impl ConductorConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        Self::with_cli_args(project_dir, &CliOverrides::default())
    }

    pub fn with_cli_args(project_dir: PathBuf, cli: &CliOverrides) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let conductor_dir = project_dir.join(".conductor");
        let mut toml = ConductorToml::load_or_default(&conductor_dir)?;
        toml.apply_env()?;
        if let Some(total) = cli.total_budget {
            toml.pipeline.total_budget = total;
        }
        if let Some(workers) = cli.workers {
            toml.pool.workers = workers;
        }
        Ok(Self {
            project_dir,
            conductor_dir,
            toml,
        })
    }

    pub fn config_file(&self) -> PathBuf {
        self.conductor_dir.join(CONFIG_FILE)
    }

    /// Shared worktree resolved against the project directory.
    pub fn shared_worktree(&self) -> Option<PathBuf> {
        self.toml
            .pipeline
            .shared_worktree
            .as_ref()
            .map(|p| self.project_dir.join(p))
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
