use std::time::Duration;

use crate::rollback::RollbackDependency;
use crate::types::{ApprovalStatus, Environment, GateKind, RiskLevel};

/// Failure of a single call into an external collaborator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CollaboratorError {
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },
    #[error("{operation} cancelled")]
    Cancelled { operation: String },
    #[error("{operation} refused: {pending} was abandoned and may still be running")]
    Abandoned { operation: String, pending: String },
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Failed(String),
}

impl CollaboratorError {
    /// True when the execution context, not the collaborator, ended the call.
    pub fn is_interrupt(&self) -> bool {
        matches!(
            self,
            CollaboratorError::Timeout { .. }
                | CollaboratorError::Cancelled { .. }
                | CollaboratorError::Abandoned { .. }
        )
    }
}

/// Why a gate refused to let the pipeline continue.
#[derive(Debug, thiserror::Error)]
pub enum GateFailure {
    #[error("outside maintenance window {window} (now {now})")]
    OutsideWindow { window: String, now: String },
    #[error("environment unhealthy: {}", issues.join("; "))]
    Unhealthy { issues: Vec<String> },
    #[error("{check} score {score:.1} below minimum {minimum:.1}")]
    ScoreBelowMinimum {
        check: &'static str,
        score: f64,
        minimum: f64,
    },
    #[error("{check} check did not pass: {}", issues.join("; "))]
    CheckFailed {
        check: &'static str,
        issues: Vec<String>,
    },
    #[error("denied by {approver}: {reason}")]
    Denied { approver: String, reason: String },
    #[error("no decision within {0:?}")]
    Expired(Duration),
    #[error(transparent)]
    Transition(#[from] ApprovalTransitionError),
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("backup of domain {domain} failed: {reason}")]
    Domain { domain: String, reason: String },
    #[error("backup confirmation refused: {0}")]
    Confirmation(#[source] GateFailure),
    #[error("integrity validation failed for: {}", .0.join(", "))]
    Integrity(Vec<String>),
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

/// Errors that abort the migration pipeline before any domain is mutated.
///
/// Domain-level failures are never raised; they are recorded in the result.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("{gate} gate failed: {source}")]
    Gate {
        gate: GateKind,
        #[source]
        source: GateFailure,
    },
    #[error("backup failed: {0}")]
    Backup(#[source] BackupError),
    #[error("precondition violated: {0}")]
    Precondition(String),
}

impl MigrationError {
    pub fn gate(gate: GateKind, source: impl Into<GateFailure>) -> Self {
        MigrationError::Gate {
            gate,
            source: source.into(),
        }
    }

    /// Gate that failed, if this was a gate failure. Backup failures report
    /// [`GateKind::Backup`].
    pub fn failed_gate(&self) -> Option<GateKind> {
        match self {
            MigrationError::Gate { gate, .. } => Some(*gate),
            MigrationError::Backup(_) => Some(GateKind::Backup),
            MigrationError::Precondition(_) => None,
        }
    }
}

/// Rollback plan creation refused. No plan object exists after this error.
#[derive(Debug, thiserror::Error)]
pub enum PlanningError {
    #[error("rollback request names no domains")]
    EmptyRequest,
    #[error("unknown domain: {0}")]
    UnknownDomain(String),
    #[error("target version {target} for {domain} is above current version {current}")]
    TargetAboveCurrent {
        domain: String,
        current: u64,
        target: u64,
    },
    #[error("dependency conflict: {}", describe_conflicts(.0))]
    DependencyConflict(Vec<RollbackDependency>),
    #[error("{risk} risk rollback is not allowed in {environment}")]
    ExcessiveRisk {
        environment: Environment,
        risk: RiskLevel,
    },
}

fn describe_conflicts(conflicts: &[RollbackDependency]) -> String {
    conflicts
        .iter()
        .map(|d| format!("{} required by {} ({})", d.domain, d.required_by, d.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

/// A rollback plan that the planner could not have produced.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanIntegrityError {
    #[error("plan names no domains")]
    NoTargets,
    #[error("plan id {found} does not match its contents (expected {expected})")]
    IdMismatch { found: String, expected: String },
    #[error("dependency {domain} required by {required_by} cannot proceed")]
    BlockedDependency { domain: String, required_by: String },
    #[error("stated risk {stated} does not match per-domain risk {derived}")]
    RiskMismatch { stated: RiskLevel, derived: RiskLevel },
    #[error("{risk} risk rollback is not allowed in {environment}")]
    ExcessiveRisk {
        environment: Environment,
        risk: RiskLevel,
    },
    #[error("plan is {0} but carries no approval decision")]
    MissingDecision(ApprovalStatus),
    #[error("plan is pending but carries an approval decision")]
    UnexpectedDecision,
}

#[derive(Debug, thiserror::Error)]
pub enum RollbackError {
    #[error("plan {plan_id} failed integrity check: {source}")]
    Integrity {
        plan_id: String,
        #[source]
        source: PlanIntegrityError,
    },
    #[error("plan {0} is marked granted without a recorded approval")]
    UnrecordedApproval(String),
    #[error("plan {plan_id} is {status}, approval required")]
    NotApproved {
        plan_id: String,
        status: ApprovalStatus,
    },
    #[error("plan {0} was already executed")]
    AlreadyExecuted(String),
    #[error("rollback is disabled for {0}")]
    Disabled(Environment),
    #[error("precondition violated: {0}")]
    Precondition(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("unknown environment: {0}")]
    UnknownEnvironment(String),
    #[error("invalid maintenance window: {0}")]
    InvalidWindow(String),
    #[error("invalid domain catalog: {0}")]
    InvalidCatalog(String),
    #[error("invalid policy: {0}")]
    Invalid(String),
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("write failure: {0}")]
    WriteFailure(String),
    #[error("chain corruption at entry {0}")]
    ChainCorruption(u64),
}

#[derive(Debug, thiserror::Error)]
pub enum ApprovalTransitionError {
    #[error("plan {plan_id} already {status}")]
    AlreadyDecided {
        plan_id: String,
        status: ApprovalStatus,
    },
    #[error("cannot transition plan {0} back to pending")]
    BackToPending(String),
}
