use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Checkpointed multi-phase pipeline orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new conductor project
    Init,
    /// Start a new run, or resume an interrupted one
    Run(RunArgs),
    /// Show the state of a run (defaults to the most recent)
    Status { run_id: Option<String> },
    /// List all runs
    List,
    /// Show the configured phases
    Phases,
    /// Cancel a run (defaults to the most recent)
    Cancel { run_id: Option<String> },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Args, Clone, Debug, Default)]
pub struct RunArgs {
    /// Scope the run operates on (defaults to the project directory name)
    #[arg(long)]
    pub scope: Option<String>,

    /// Free-form description stored with the scope
    #[arg(long, default_value = "")]
    pub description: String,

    /// Run flag as key=value, e.g. --flag skip_review=true
    #[arg(long = "flag", value_name = "KEY=VALUE")]
    pub flags: Vec<String>,

    /// Resume a run instead of starting one; without an id, the most recent run
    #[arg(long, num_args = 0..=1, default_missing_value = "")]
    pub resume: Option<String>,

    /// Total pipeline budget in seconds. Overrides conductor.toml.
    #[arg(long)]
    pub budget_secs: Option<u64>,

    /// Worker count for pool phases. Overrides conductor.toml.
    #[arg(long)]
    pub workers: Option<usize>,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default conductor.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let log_dir = project_dir.join(conductor::init::CONDUCTOR_DIR).join("logs");
    let log_dir = conductor::init::is_initialized(&project_dir).then_some(log_dir);
    let _log_guard = conductor::logging::init(log_dir.as_deref(), cli.verbose);

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::Run(args) => cmd::cmd_run(&cli, project_dir, args).await?,
        Commands::Status { run_id } => cmd::cmd_status(&project_dir, run_id.as_deref())?,
        Commands::List => cmd::cmd_list(&project_dir)?,
        Commands::Phases => cmd::cmd_phases(&project_dir)?,
        Commands::Cancel { run_id } => cmd::cmd_cancel(&project_dir, run_id.as_deref())?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
