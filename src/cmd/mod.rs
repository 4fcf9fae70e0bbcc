//! CLI command implementations.
//!
//! | Module     | Commands handled              |
//! |------------|-------------------------------|
//! | `project`  | `Init`                        |
//! | `run`      | `Run`                         |
//! | `status`   | `Status`, `List`, `Phases`    |
//! | `cancel`   | `Cancel`                      |
//! | `config`   | `Config`                      |

pub mod cancel;
pub mod config;
pub mod project;
pub mod run;
pub mod status;

pub use cancel::cmd_cancel;
pub use config::cmd_config;
pub use project::cmd_init;
pub use run::cmd_run;
pub use status::{cmd_list, cmd_phases, cmd_status};
