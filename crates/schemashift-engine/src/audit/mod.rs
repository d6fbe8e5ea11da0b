pub mod log;
pub mod trail;

pub use log::FileAuditSink;
pub use trail::{AuditTrailRecorder, RunLog};
