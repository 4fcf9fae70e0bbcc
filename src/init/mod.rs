//! Initialization of conductor projects.
//!
//! `conductor init` creates the `.conductor/` state directory:
//!
//! ```text
//! .conductor/
//! ├── conductor.toml   # Project configuration (starter pipeline)
//! ├── runs/            # One directory per run: checkpoint, artifacts, groups
//! ├── leases/          # Scope leases held by running orchestrators
//! └── logs/            # Daily log files
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::conductor_config::{CONFIG_FILE, ConductorToml};
use crate::phase::default_phases;

/// The name of the conductor state directory.
pub const CONDUCTOR_DIR: &str = ".conductor";

/// Result of initializing a conductor project.
#[derive(Debug)]
pub struct InitResult {
    pub conductor_dir: PathBuf,
    /// False if the directory already existed.
    pub created: bool,
    /// Whether a starter `conductor.toml` was written.
    pub config_written: bool,
}

/// Create (or complete) the `.conductor/` layout in `project_dir`.
///
/// An existing `conductor.toml` is never overwritten.
pub fn init_project(project_dir: &Path) -> Result<InitResult> {
    let conductor_dir = project_dir.join(CONDUCTOR_DIR);
    let created = !conductor_dir.exists();

    for sub in ["runs", "leases", "logs"] {
        let path = conductor_dir.join(sub);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create directory: {}", path.display()))?;
    }

    let config_path = conductor_dir.join(CONFIG_FILE);
    let config_written = !config_path.exists();
    if config_written {
        starter_config().save(&config_path)?;
    }

    Ok(InitResult {
        conductor_dir,
        created,
        config_written,
    })
}

/// The standard pipeline with placeholder commands, ready to be edited.
pub fn starter_config() -> ConductorToml {
    let phases = default_phases()
        .into_iter()
        .map(|def| {
            if def.has_worker_pool {
                def.with_pool_commands(r#"echo '{"tasks": []}'"#, "true")
            } else {
                let command = match def.name.as_str() {
                    "review" | "verify" => format!(
                        "echo \"{} $CONDUCTOR_SCOPE\"; echo '<issues>0</issues>'",
                        def.name
                    ),
                    _ => format!("echo \"{} $CONDUCTOR_SCOPE\"", def.name),
                };
                def.with_command(&command)
            }
        })
        .collect();
    ConductorToml {
        phases,
        ..ConductorToml::default()
    }
}

pub fn is_initialized(project_dir: &Path) -> bool {
    project_dir.join(CONDUCTOR_DIR).exists()
}
