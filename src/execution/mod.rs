//! Execution lifecycle: records, per-job context and the job executor.

pub mod context;
pub mod executor;
pub mod outcome;
pub mod registry;
pub mod state;

pub use context::{ContextServices, ExecutionContext, LogLevel};
pub use executor::{ExecutorDeps, ExecutorSettings, JobExecutor};
pub use outcome::RunOutcome;
pub use registry::{ActiveSummary, CancelReason, ExecutionRegistry};
pub use state::{ExecutionRecord, ExecutionStatus, StatusTransition};
