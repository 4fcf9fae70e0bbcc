//! Worker pool coordination for fan-out phases.
//!
//! ```text
//! TaskDescriptor[] ──TaskGraph::build──> TaskBoard <──claim/complete── worker loops
//!                                            │                             │
//!                                   PoolCoordinator::poll           BrokerHandle::apply
//! ```
//!
//! Tasks are claimed by compare-and-set on their owner and only once every
//! task they are blocked by has completed. The coordinator's poll loop warns
//! about and releases stale claims, and returns partial results on its hard
//! timeout.

pub mod board;
pub mod coordinator;
pub mod graph;
pub mod task;
pub mod worker;

pub use board::{GroupState, StaleTask, TaskBoard, TaskCounts};
pub use coordinator::{GroupArchive, PollResult, PollSettings, PoolCoordinator, PoolSummary};
pub use graph::TaskGraph;
pub use task::{TaskDescriptor, TaskStatus, WorkerTask};
pub use worker::{TaskOutput, Worker, WorkerContext, WorkerPool, WorkerSettings, spawn_workers};
