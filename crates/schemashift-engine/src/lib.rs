#![forbid(unsafe_code)]

pub mod audit;
pub mod backup;
pub mod collaborators;
pub mod context;
pub mod gates;
pub mod orchestrator;
pub mod rollback;
pub mod state;
pub mod strategy;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;

pub use collaborators::Collaborators;
pub use context::{CancelToken, ExecutionContext};
pub use orchestrator::MigrationOrchestrator;
pub use rollback::executor::RollbackExecutor;
pub use rollback::planner::RollbackPlanner;
