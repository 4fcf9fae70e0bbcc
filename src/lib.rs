pub mod broker;
pub mod budget;
pub mod checkpoint;
pub mod conductor_config;
pub mod config;
pub mod convergence;
pub mod errors;
pub mod handlers;
pub mod init;
pub mod lease;
pub mod logging;
pub mod orchestrator;
pub mod phase;
pub mod pool;
pub mod scheduler;
pub mod util;
