use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::AuditEntry;
use crate::backup::{ConfigArtifact, ContentObject, DomainBackupResult, TableBackupStats};
use crate::errors::{AuditError, CollaboratorError};
use crate::rollback::RollbackPlan;
use crate::types::{duration_secs, BackupKind, DestructiveOp, Environment, RiskLevel};

pub type CallResult<T> = Result<T, CollaboratorError>;

/// Environment health as reported by the validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub overall_healthy: bool,
    #[serde(default)]
    pub dependencies: BTreeMap<String, bool>,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// Scored assessment from a security or compliance collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreReport {
    pub passed: bool,
    pub score: f64,
    #[serde(default)]
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuityReport {
    pub passed: bool,
    /// 0 = no business impact, 100 = outage.
    pub impact_score: f64,
    #[serde(default)]
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalSubject {
    Migration,
    Rollback,
    BackupConfirmation,
}

/// Structured request handed to the approval workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub subject: ApprovalSubject,
    pub environment: Environment,
    pub summary: String,
    pub risk_level: RiskLevel,
    #[serde(with = "duration_secs")]
    pub expected_duration: Duration,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
    /// Versions a rollback would return to if the change goes wrong.
    #[serde(default)]
    pub fallback_versions: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_plan: Option<RollbackPlan>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub approved: bool,
    pub approver: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

/// Accounting for a content or configuration backup, before it has a location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub kind: BackupKind,
    pub item_count: u64,
    pub byte_size: u64,
    pub integrity_hash: String,
}

/// Per-domain migration engine. Each call is an opaque unit of work.
pub trait DomainMigrator: Send + Sync {
    /// Migrations not yet applied to `domain`.
    fn pending_count(&self, domain: &str, env: Environment) -> CallResult<u32>;

    /// Apply all pending forward migrations for `domain`.
    fn execute_domain_migrations(&self, domain: &str, env: Environment) -> CallResult<()>;

    /// Move `domain` to `version` using its migration files (rollback direction).
    fn apply_target_version(&self, domain: &str, env: Environment, version: u64)
        -> CallResult<()>;
}

/// Typed lookups against the schema-version store.
pub trait SchemaVersionRepository: Send + Sync {
    fn current_version(&self, domain: &str, env: Environment) -> CallResult<u64>;

    fn latest_version(&self, domain: &str, env: Environment) -> CallResult<u64>;

    /// Destructive operations performed when moving `domain` from `from` down to `to`.
    fn destructive_operations(
        &self,
        domain: &str,
        env: Environment,
        from: u64,
        to: u64,
    ) -> CallResult<Vec<DestructiveOp>>;
}

pub trait EnvironmentValidator: Send + Sync {
    fn validate_environment(&self, env: Environment) -> CallResult<HealthReport>;
}

pub trait SecurityValidator: Send + Sync {
    fn assess_security(&self, env: Environment) -> CallResult<ScoreReport>;
}

pub trait ComplianceManager: Send + Sync {
    fn assess_compliance(&self, env: Environment) -> CallResult<ScoreReport>;

    fn assess_business_continuity(&self, env: Environment) -> CallResult<ContinuityReport>;
}

/// External approval workflow. May block until a human decides.
pub trait ApprovalWorkflow: Send + Sync {
    fn request_approval(&self, request: &ApprovalRequest) -> CallResult<ApprovalResponse>;
}

/// Storage collaborator. Returns opaque location references.
pub trait BackupStore: Send + Sync {
    fn database_size(&self, env: Environment) -> CallResult<u64>;

    fn store_full_backup(&self, env: Environment, byte_size: u64) -> CallResult<String>;

    fn store_domain_manifest(
        &self,
        env: Environment,
        result: &DomainBackupResult,
        tables: &[TableBackupStats],
    ) -> CallResult<String>;

    fn content_inventory(&self, env: Environment) -> CallResult<Vec<ContentObject>>;

    fn config_artifacts(&self, env: Environment) -> CallResult<Vec<ConfigArtifact>>;

    fn store_artifact_manifest(
        &self,
        env: Environment,
        manifest: &ArtifactManifest,
    ) -> CallResult<String>;

    fn create_recovery_point(&self, env: Environment, label: &str) -> CallResult<String>;
}

/// Row and size statistics per table.
pub trait TableInspector: Send + Sync {
    /// Rows not soft-deleted, or `None` if the table has no soft-delete marker.
    fn count_live_rows(&self, env: Environment, table: &str) -> CallResult<Option<u64>>;

    fn count_rows(&self, env: Environment, table: &str) -> CallResult<u64>;

    fn table_size(&self, env: Environment, table: &str) -> CallResult<u64>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Receives audit entries for persistence.
pub trait AuditSink: Send {
    fn append(&mut self, entry: &AuditEntry) -> Result<(), AuditError>;
}
