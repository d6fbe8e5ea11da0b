pub mod data_loss;
pub mod executor;
pub mod planner;

pub use executor::RollbackExecutor;
pub use planner::RollbackPlanner;
