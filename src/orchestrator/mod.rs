//! Run lifecycle: start, resume, cancel and the end-of-run report.

pub mod cancel;
pub mod pipeline;
pub mod report;

pub use cancel::{CancelOutcome, request_cancel};
pub use pipeline::{ConvergenceLoop, Pipeline, PipelineBuilder};
pub use report::{FailureInfo, PhaseSummary, PipelineReport, resume_command};
