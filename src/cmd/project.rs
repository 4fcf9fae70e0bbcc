//! Project initialization — `conductor init`.

use anyhow::Result;
use std::path::Path;

pub fn cmd_init(project_dir: &Path) -> Result<()> {
    use conductor::init::init_project;

    let result = init_project(project_dir)?;

    if result.created {
        println!(
            "Initialized conductor project at {}",
            result.conductor_dir.display()
        );
        println!();
        println!("Created directory structure:");
        println!("  .conductor/");
        println!("  ├── conductor.toml   # Pipeline configuration (edit the phase commands)");
        println!("  ├── runs/            # Checkpoints, artifacts and reports per run");
        println!("  ├── leases/          # Scope leases of running orchestrators");
        println!("  └── logs/            # Daily JSON logs");
        println!();
        println!("Next steps:");
        println!("  1. Edit .conductor/conductor.toml to set the phase commands");
        println!("  2. Run `conductor config validate`");
        println!("  3. Run `conductor run` to start a pipeline");
    } else if result.config_written {
        println!(
            "Completed conductor initialization at {}",
            result.conductor_dir.display()
        );
    } else {
        println!(
            "Conductor project already initialized at {}",
            result.conductor_dir.display()
        );
        println!("Directory structure verified.");
    }

    Ok(())
}
