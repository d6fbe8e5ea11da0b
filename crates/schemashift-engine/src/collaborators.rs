use std::sync::Arc;

use schemashift_core::traits::{
    ApprovalWorkflow, BackupStore, Clock, ComplianceManager, DomainMigrator, EnvironmentValidator,
    SchemaVersionRepository, SecurityValidator, TableInspector,
};

/// External collaborators, built once by the composition root and shared by
/// every pipeline component.
#[derive(Clone)]
pub struct Collaborators {
    pub migrator: Arc<dyn DomainMigrator>,
    pub versions: Arc<dyn SchemaVersionRepository>,
    pub validator: Arc<dyn EnvironmentValidator>,
    pub security: Arc<dyn SecurityValidator>,
    pub compliance: Arc<dyn ComplianceManager>,
    pub approvals: Arc<dyn ApprovalWorkflow>,
    pub backups: Arc<dyn BackupStore>,
    pub tables: Arc<dyn TableInspector>,
    pub clock: Arc<dyn Clock>,
}
