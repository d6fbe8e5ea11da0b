use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    ApprovalStatus, AuditOutcome, BackupKind, Environment, GateKind, PostCheck, RiskLevel,
};

/// One append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in the recorder, starting at 0. Never reused.
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub event: String,
    pub actor: String,
    pub target: String,
    pub outcome: AuditOutcome,
    pub detail: AuditDetail,
    pub correlation_id: String,
}

/// Typed payload per event kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditDetail {
    RunStarted {
        environment: Environment,
        operation: RunOperation,
        domains: Vec<String>,
    },
    Gate {
        gate: GateKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        score: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        minimum: Option<f64>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        issues: Vec<String>,
    },
    Approval {
        subject: String,
        status: ApprovalStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        approver: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Backup {
        backup: BackupKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        location: Option<String>,
        records: u64,
        bytes: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    DomainAttempt {
        attempt: u32,
        max_attempts: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    DomainSkipped {
        reason: String,
    },
    PostCondition {
        check: PostCheck,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        issues: Vec<String>,
    },
    RollbackPlanned {
        plan_id: String,
        risk: RiskLevel,
        domains: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rejection: Option<String>,
    },
    RollbackDomain {
        plan_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_version: Option<u64>,
        to_version: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    RunCompleted {
        success: bool,
        completed: usize,
        failed: usize,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOperation {
    Migration,
    Rollback,
}

impl AuditDetail {
    /// True for the entry that closes a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AuditDetail::RunCompleted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detail_is_tagged_by_kind() {
        let detail = AuditDetail::DomainAttempt {
            attempt: 2,
            max_attempts: 3,
            error: Some("lock timeout".into()),
        };
        let v = serde_json::to_value(&detail).unwrap();
        assert_eq!(v["kind"], "domain_attempt");
        assert_eq!(v["attempt"], 2);
        let back: AuditDetail = serde_json::from_value(v).unwrap();
        assert_eq!(back, detail);
    }

    #[test]
    fn optional_fields_are_omitted() {
        let detail = AuditDetail::Gate {
            gate: GateKind::MaintenanceWindow,
            score: None,
            minimum: None,
            issues: vec![],
        };
        let v = serde_json::to_value(&detail).unwrap();
        assert_eq!(v, serde_json::json!({"kind": "gate", "gate": "maintenance_window"}));
    }
}
