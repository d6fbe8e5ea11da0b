pub mod approval;
pub mod scores;
pub mod window;

pub use approval::{ApprovalGate, GateDecision, MigrationApprovalInput};
pub use scores::{enforce_minimum, require_healthy};
pub use window::{evaluate_window, WindowDecision};
