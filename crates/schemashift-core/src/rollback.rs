use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{ApprovalTransitionError, PlanIntegrityError};
use crate::types::{duration_secs, ApprovalStatus, Environment, RiskLevel};

/// Edge of the dependency check: `required_by` depends on `domain`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackDependency {
    pub domain: String,
    pub required_by: String,
    pub reason: String,
    pub can_proceed: bool,
}

/// Who decided a plan's approval and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub approver: String,
    pub decided_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Dependency-checked, risk-scored rollback request.
///
/// Only the planner builds plans. After creation the approval status may
/// leave `Pending` once; everything else is fixed. A plan read back from JSON
/// must pass [`RollbackPlan::verify`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StoredPlan")]
pub struct RollbackPlan {
    pub id: String,
    pub environment: Environment,
    pub requester: String,
    pub requested_at: DateTime<Utc>,
    pub reason: String,
    pub target_versions: BTreeMap<String, u64>,
    /// Versions read at planning time; `None` when the read failed.
    pub current_versions: BTreeMap<String, Option<u64>>,
    pub risk_level: RiskLevel,
    pub domain_risks: BTreeMap<String, RiskLevel>,
    /// Base duration per domain times domain count. An approximation, not a
    /// scheduling guarantee.
    #[serde(with = "duration_secs")]
    pub estimated_duration: Duration,
    pub dependencies: Vec<RollbackDependency>,
    approval_status: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    approval: Option<ApprovalDecision>,
}

/// Wire form of [`RollbackPlan`], checked before it becomes one.
#[derive(Deserialize)]
struct StoredPlan {
    id: String,
    environment: Environment,
    requester: String,
    requested_at: DateTime<Utc>,
    reason: String,
    target_versions: BTreeMap<String, u64>,
    current_versions: BTreeMap<String, Option<u64>>,
    risk_level: RiskLevel,
    domain_risks: BTreeMap<String, RiskLevel>,
    #[serde(with = "duration_secs")]
    estimated_duration: Duration,
    dependencies: Vec<RollbackDependency>,
    approval_status: ApprovalStatus,
    #[serde(default)]
    approval: Option<ApprovalDecision>,
}

impl TryFrom<StoredPlan> for RollbackPlan {
    type Error = PlanIntegrityError;

    fn try_from(s: StoredPlan) -> Result<Self, Self::Error> {
        let plan = RollbackPlan {
            id: s.id,
            environment: s.environment,
            requester: s.requester,
            requested_at: s.requested_at,
            reason: s.reason,
            target_versions: s.target_versions,
            current_versions: s.current_versions,
            risk_level: s.risk_level,
            domain_risks: s.domain_risks,
            estimated_duration: s.estimated_duration,
            dependencies: s.dependencies,
            approval_status: s.approval_status,
            approval: s.approval,
        };
        plan.verify()?;
        Ok(plan)
    }
}

/// Content-derived plan id: `rbp-` plus the first 12 hex digits of a SHA-256
/// over environment, requester, request time, reason and targets.
pub fn derive_plan_id(
    environment: Environment,
    requester: &str,
    requested_at: &DateTime<Utc>,
    reason: &str,
    targets: &BTreeMap<String, u64>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(
        format!(
            "{environment}\n{requester}\n{}\n{reason}\n",
            requested_at.to_rfc3339()
        )
        .as_bytes(),
    );
    for (domain, version) in targets {
        hasher.update(format!("{domain}={version}\n").as_bytes());
    }
    let digest = format!("{:x}", hasher.finalize());
    format!("rbp-{}", &digest[..12])
}

/// Fields the planner computes before a plan exists.
#[derive(Debug, Clone)]
pub struct PlanDraft {
    pub id: String,
    pub environment: Environment,
    pub requester: String,
    pub requested_at: DateTime<Utc>,
    pub reason: String,
    pub target_versions: BTreeMap<String, u64>,
    pub current_versions: BTreeMap<String, Option<u64>>,
    pub risk_level: RiskLevel,
    pub domain_risks: BTreeMap<String, RiskLevel>,
    pub estimated_duration: Duration,
    pub dependencies: Vec<RollbackDependency>,
    pub approval_status: ApprovalStatus,
}

impl From<PlanDraft> for RollbackPlan {
    fn from(d: PlanDraft) -> Self {
        Self {
            id: d.id,
            environment: d.environment,
            requester: d.requester,
            requested_at: d.requested_at,
            reason: d.reason,
            target_versions: d.target_versions,
            current_versions: d.current_versions,
            risk_level: d.risk_level,
            domain_risks: d.domain_risks,
            estimated_duration: d.estimated_duration,
            dependencies: d.dependencies,
            approval_status: d.approval_status,
            approval: None,
        }
    }
}

impl RollbackPlan {
    pub fn approval_status(&self) -> ApprovalStatus {
        self.approval_status
    }

    pub fn approval(&self) -> Option<&ApprovalDecision> {
        self.approval.as_ref()
    }

    /// Move out of `Pending`. Allowed exactly once.
    pub fn record_decision(
        &mut self,
        status: ApprovalStatus,
        decision: ApprovalDecision,
    ) -> Result<(), ApprovalTransitionError> {
        if self.approval_status.is_terminal() {
            return Err(ApprovalTransitionError::AlreadyDecided {
                plan_id: self.id.clone(),
                status: self.approval_status,
            });
        }
        if !status.is_terminal() {
            return Err(ApprovalTransitionError::BackToPending(self.id.clone()));
        }
        self.approval_status = status;
        self.approval = Some(decision);
        Ok(())
    }

    /// Check the invariants every planner-built plan holds.
    pub fn verify(&self) -> Result<(), PlanIntegrityError> {
        if self.target_versions.is_empty() {
            return Err(PlanIntegrityError::NoTargets);
        }
        let expected = derive_plan_id(
            self.environment,
            &self.requester,
            &self.requested_at,
            &self.reason,
            &self.target_versions,
        );
        if self.id != expected {
            return Err(PlanIntegrityError::IdMismatch {
                found: self.id.clone(),
                expected,
            });
        }
        if let Some(blocked) = self.dependencies.iter().find(|d| !d.can_proceed) {
            return Err(PlanIntegrityError::BlockedDependency {
                domain: blocked.domain.clone(),
                required_by: blocked.required_by.clone(),
            });
        }
        let derived = self
            .domain_risks
            .values()
            .copied()
            .max()
            .unwrap_or(RiskLevel::Low);
        if self.risk_level != derived {
            return Err(PlanIntegrityError::RiskMismatch {
                stated: self.risk_level,
                derived,
            });
        }
        if self.environment == Environment::Production && self.risk_level == RiskLevel::Critical {
            return Err(PlanIntegrityError::ExcessiveRisk {
                environment: self.environment,
                risk: self.risk_level,
            });
        }
        match (self.approval_status, &self.approval) {
            (ApprovalStatus::Pending, Some(_)) => Err(PlanIntegrityError::UnexpectedDecision),
            (status @ (ApprovalStatus::Denied | ApprovalStatus::Expired), None) => {
                Err(PlanIntegrityError::MissingDecision(status))
            }
            _ => Ok(()),
        }
    }

    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.target_versions.keys().map(String::as_str)
    }

    /// One-line description used in approval requests.
    pub fn summary(&self) -> String {
        let targets: Vec<String> = self
            .target_versions
            .iter()
            .map(|(d, v)| match self.current_versions.get(d).copied().flatten() {
                Some(cur) => format!("{d} {cur}->{v}"),
                None => format!("{d} ?->{v}"),
            })
            .collect();
        format!(
            "rollback {} in {}: {} ({} risk, requested by {}: {})",
            self.id,
            self.environment,
            targets.join(", "),
            self.risk_level,
            self.requester,
            self.reason
        )
    }
}
