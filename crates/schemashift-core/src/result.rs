use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::AuditEntry;
use crate::backup::BackupReport;
use crate::traits::{HealthReport, ScoreReport};
use crate::types::{duration_secs, DestructiveOpKind, Environment, RiskLevel};

pub const PRE_MIGRATION: &str = "pre-migration";
pub const POST_MIGRATION: &str = "post-migration";

/// Accumulated outcome of one migration pipeline run.
///
/// Invariants: a domain is never in both `completed_domains` and
/// `failed_domains`; `success` is true exactly when `failed_domains` is empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    pub environment: Environment,
    pub correlation_id: String,
    pub success: bool,
    pub completed_domains: Vec<String>,
    pub failed_domains: Vec<String>,
    /// Domains with nothing pending.
    pub skipped_domains: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupReport>,
    pub backup_locations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_point: Option<String>,
    pub validation_results: BTreeMap<String, HealthReport>,
    pub security_results: BTreeMap<String, ScoreReport>,
    pub compliance_results: BTreeMap<String, ScoreReport>,
    pub approval_status: String,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub audit_trail: Vec<AuditEntry>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(with = "duration_secs")]
    pub execution_duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_impact_score: Option<f64>,
}

impl MigrationResult {
    pub fn new(environment: Environment, correlation_id: String, started_at: DateTime<Utc>) -> Self {
        Self {
            environment,
            correlation_id,
            success: false,
            completed_domains: Vec::new(),
            failed_domains: Vec::new(),
            skipped_domains: Vec::new(),
            backup: None,
            backup_locations: Vec::new(),
            recovery_point: None,
            validation_results: BTreeMap::new(),
            security_results: BTreeMap::new(),
            compliance_results: BTreeMap::new(),
            approval_status: "not_required".to_string(),
            warnings: Vec::new(),
            errors: Vec::new(),
            audit_trail: Vec::new(),
            started_at,
            finished_at: None,
            execution_duration: Duration::ZERO,
            business_impact_score: None,
        }
    }

    pub fn mark_completed(&mut self, domain: &str) {
        if !self.failed_domains.iter().any(|d| d == domain)
            && !self.completed_domains.iter().any(|d| d == domain)
        {
            self.completed_domains.push(domain.to_string());
        }
    }

    pub fn mark_failed(&mut self, domain: &str, error: impl Into<String>) {
        self.completed_domains.retain(|d| d != domain);
        if !self.failed_domains.iter().any(|d| d == domain) {
            self.failed_domains.push(domain.to_string());
        }
        self.errors.push(format!("{domain}: {}", error.into()));
    }

    pub fn mark_skipped(&mut self, domain: &str) {
        self.skipped_domains.push(domain.to_string());
    }

    /// Stamp the run as finished and derive `success`.
    pub fn close(
        &mut self,
        finished_at: DateTime<Utc>,
        duration: Duration,
        audit_trail: Vec<AuditEntry>,
    ) {
        self.finished_at = Some(finished_at);
        self.execution_duration = duration;
        self.audit_trail = audit_trail;
        self.success = self.failed_domains.is_empty();
    }
}

/// Lightweight pre-rollback marker. Not a data copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSnapshot {
    pub domain: String,
    pub version: u64,
    pub taken_at: DateTime<Utc>,
}

/// One destructive operation detected in a rollback range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataLossWarning {
    pub domain: String,
    pub operation: DestructiveOpKind,
    pub object: String,
    pub severity: RiskLevel,
    pub consequence: String,
}

/// Outcome of executing a rollback plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackResult {
    pub plan_id: String,
    pub environment: Environment,
    pub correlation_id: String,
    pub success: bool,
    /// Computed execution order (dependents first).
    pub order: Vec<String>,
    pub rolled_back: Vec<String>,
    pub failed_domains: Vec<String>,
    pub not_attempted: Vec<String>,
    /// Pre-rollback markers. Discarded on full success.
    pub snapshots: BTreeMap<String, VersionSnapshot>,
    pub data_loss: Vec<DataLossWarning>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub recovery_steps: Vec<String>,
    pub audit_trail: Vec<AuditEntry>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(with = "duration_secs")]
    pub execution_duration: Duration,
}

impl RollbackResult {
    pub fn new(
        plan_id: String,
        environment: Environment,
        correlation_id: String,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            plan_id,
            environment,
            correlation_id,
            success: false,
            order: Vec::new(),
            rolled_back: Vec::new(),
            failed_domains: Vec::new(),
            not_attempted: Vec::new(),
            snapshots: BTreeMap::new(),
            data_loss: Vec::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
            recovery_steps: Vec::new(),
            audit_trail: Vec::new(),
            started_at,
            finished_at: None,
            execution_duration: Duration::ZERO,
        }
    }

    pub fn close(
        &mut self,
        finished_at: DateTime<Utc>,
        duration: Duration,
        audit_trail: Vec<AuditEntry>,
    ) {
        self.finished_at = Some(finished_at);
        self.execution_duration = duration;
        self.audit_trail = audit_trail;
        self.success = self.failed_domains.is_empty() && self.not_attempted.is_empty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_domain_leaves_completed_list() {
        let mut r = MigrationResult::new(Environment::Staging, "c".into(), Utc::now());
        r.mark_completed("content");
        r.mark_failed("content", "post-check broke it");
        r.mark_completed("content");
        assert!(r.completed_domains.is_empty());
        assert_eq!(r.failed_domains, ["content"]);
        assert_eq!(r.errors, ["content: post-check broke it"]);
    }

    #[test]
    fn success_tracks_failed_domains() {
        let mut r = MigrationResult::new(Environment::Development, "c".into(), Utc::now());
        r.close(Utc::now(), Duration::from_millis(5), vec![]);
        assert!(r.success);

        let mut r = MigrationResult::new(Environment::Development, "c".into(), Utc::now());
        r.mark_completed("content");
        r.mark_failed("services", "boom");
        r.close(Utc::now(), Duration::from_millis(5), vec![]);
        assert!(!r.success);
        assert_eq!(r.completed_domains, ["content"]);
    }
}
