use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use schemashift_core::audit::AuditDetail;
use schemashift_core::errors::{CollaboratorError, GateFailure};
use schemashift_core::rollback::{ApprovalDecision, RollbackPlan};
use schemashift_core::traits::{
    ApprovalRequest, ApprovalSubject, ApprovalWorkflow, CallResult, Clock,
};
use schemashift_core::types::{ApprovalStatus, Environment, RiskLevel};
use sha2::{Digest, Sha256};

use crate::context::ExecutionContext;

/// Terminal answer to one approval request.
#[derive(Debug, Clone, PartialEq)]
pub struct GateDecision {
    pub subject: ApprovalSubject,
    pub status: ApprovalStatus,
    pub approver: Option<String>,
    pub decided_at: DateTime<Utc>,
    pub reason: Option<String>,
    /// Set when the decision is `Expired`.
    pub waited: Option<Duration>,
}

impl GateDecision {
    pub fn is_granted(&self) -> bool {
        self.status == ApprovalStatus::Granted
    }

    /// Anything other than `Granted` is a gate failure.
    pub fn require_granted(&self) -> Result<(), GateFailure> {
        match self.status {
            ApprovalStatus::Granted => Ok(()),
            ApprovalStatus::Expired => Err(GateFailure::Expired(self.waited.unwrap_or_default())),
            ApprovalStatus::Denied | ApprovalStatus::Pending => Err(GateFailure::Denied {
                approver: self.approver.clone().unwrap_or_else(|| "unknown".into()),
                reason: self
                    .reason
                    .clone()
                    .unwrap_or_else(|| "no reason given".into()),
            }),
        }
    }

    pub fn audit_detail(&self) -> AuditDetail {
        AuditDetail::Approval {
            subject: subject_name(self.subject).to_string(),
            status: self.status,
            approver: self.approver.clone(),
            reason: self.reason.clone(),
        }
    }
}

fn subject_name(subject: ApprovalSubject) -> &'static str {
    match subject {
        ApprovalSubject::Migration => "migration",
        ApprovalSubject::Rollback => "rollback",
        ApprovalSubject::BackupConfirmation => "backup_confirmation",
    }
}

/// What a migration approval request describes.
#[derive(Debug, Clone)]
pub struct MigrationApprovalInput {
    pub environment: Environment,
    pub summary: String,
    pub risk_level: RiskLevel,
    pub expected_duration: Duration,
    pub requested_by: String,
    pub fallback_versions: BTreeMap<String, u64>,
}

/// Human approval checkpoint.
///
/// Waits are bounded by the context's approval timeout, not the per-call
/// timeout. A timeout is an `Expired` decision, not an error; collaborator
/// failures and cancellation are errors.
#[derive(Clone)]
pub struct ApprovalGate {
    workflow: Arc<dyn ApprovalWorkflow>,
    clock: Arc<dyn Clock>,
}

impl ApprovalGate {
    pub fn new(workflow: Arc<dyn ApprovalWorkflow>, clock: Arc<dyn Clock>) -> Self {
        Self { workflow, clock }
    }

    pub fn request_migration_approval(
        &self,
        ctx: &ExecutionContext,
        input: MigrationApprovalInput,
    ) -> CallResult<GateDecision> {
        let request = self.build_request(
            ApprovalSubject::Migration,
            input.environment,
            input.summary,
            input.risk_level,
            input.expected_duration,
            input.requested_by,
            input.fallback_versions,
            None,
        );
        self.await_decision(ctx, request)
    }

    pub fn request_backup_confirmation(
        &self,
        ctx: &ExecutionContext,
        environment: Environment,
        summary: String,
        requested_by: &str,
    ) -> CallResult<GateDecision> {
        let request = self.build_request(
            ApprovalSubject::BackupConfirmation,
            environment,
            summary,
            RiskLevel::Low,
            Duration::ZERO,
            requested_by.to_string(),
            BTreeMap::new(),
            None,
        );
        self.await_decision(ctx, request)
    }

    /// Ask for a decision on a pending plan and record it on the plan.
    ///
    /// A plan that already left `Pending` is returned unchanged and the
    /// workflow is not contacted.
    pub fn request_rollback_approval(
        &self,
        ctx: &ExecutionContext,
        plan: &mut RollbackPlan,
        requested_by: &str,
    ) -> Result<Option<GateDecision>, GateFailure> {
        if plan.approval_status().is_terminal() {
            return Ok(None);
        }
        let fallback = plan
            .current_versions
            .iter()
            .filter_map(|(d, v)| v.map(|v| (d.clone(), v)))
            .collect();
        let request = self.build_request(
            ApprovalSubject::Rollback,
            plan.environment,
            plan.summary(),
            plan.risk_level,
            plan.estimated_duration,
            requested_by.to_string(),
            fallback,
            Some(plan.clone()),
        );
        let decision = self.await_decision(ctx, request)?;
        plan.record_decision(
            decision.status,
            ApprovalDecision {
                approver: decision
                    .approver
                    .clone()
                    .unwrap_or_else(|| "approval-timeout".into()),
                decided_at: decision.decided_at,
                reason: decision.reason.clone(),
            },
        )?;
        Ok(Some(decision))
    }

    #[allow(clippy::too_many_arguments)]
    fn build_request(
        &self,
        subject: ApprovalSubject,
        environment: Environment,
        summary: String,
        risk_level: RiskLevel,
        expected_duration: Duration,
        requested_by: String,
        fallback_versions: BTreeMap<String, u64>,
        rollback_plan: Option<RollbackPlan>,
    ) -> ApprovalRequest {
        let requested_at = self.clock.now();
        let seed = format!(
            "{}|{environment}|{summary}|{}",
            subject_name(subject),
            requested_at.to_rfc3339()
        );
        let digest = format!("{:x}", Sha256::digest(seed.as_bytes()));
        ApprovalRequest {
            id: format!("apr-{}", &digest[..12]),
            subject,
            environment,
            summary,
            risk_level,
            expected_duration,
            requested_by,
            requested_at,
            fallback_versions,
            rollback_plan,
        }
    }

    fn await_decision(
        &self,
        ctx: &ExecutionContext,
        request: ApprovalRequest,
    ) -> CallResult<GateDecision> {
        let subject = request.subject;
        tracing::info!(
            request = %request.id,
            environment = %request.environment,
            subject = subject_name(subject),
            "waiting for approval"
        );
        let workflow = Arc::clone(&self.workflow);
        let outcome = ctx.wait_for_approval("approval", move || workflow.request_approval(&request));
        match outcome {
            Ok(response) if response.approved => Ok(GateDecision {
                subject,
                status: ApprovalStatus::Granted,
                approver: Some(response.approver),
                decided_at: response.timestamp,
                reason: None,
                waited: None,
            }),
            Ok(response) => Ok(GateDecision {
                subject,
                status: ApprovalStatus::Denied,
                approver: Some(response.approver),
                decided_at: response.timestamp,
                reason: response.rejection_reason,
                waited: None,
            }),
            Err(CollaboratorError::Timeout { after, .. }) => {
                tracing::warn!(subject = subject_name(subject), ?after, "approval expired");
                Ok(GateDecision {
                    subject,
                    status: ApprovalStatus::Expired,
                    approver: None,
                    decided_at: self.clock.now(),
                    reason: Some(format!("no decision within {after:?}")),
                    waited: Some(after),
                })
            }
            Err(e) => Err(e),
        }
    }
}
