use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use schemashift_core::audit::{AuditDetail, RunOperation};
use schemashift_core::errors::RollbackError;
use schemashift_core::policy::Policy;
use schemashift_core::result::{RollbackResult, VersionSnapshot};
use schemashift_core::rollback::RollbackPlan;
use schemashift_core::types::{ApprovalStatus, AuditOutcome, Environment};
use tracing::{error, info, warn};

use super::data_loss;
use crate::audit::{AuditTrailRecorder, RunLog};
use crate::collaborators::Collaborators;
use crate::context::ExecutionContext;
use crate::strategy::StrategyProvider;

/// Executes approved rollback plans, each at most once.
pub struct RollbackExecutor {
    policy: Policy,
    collaborators: Collaborators,
    executed: HashSet<String>,
}

impl RollbackExecutor {
    pub fn new(policy: Policy, collaborators: Collaborators) -> Self {
        Self {
            policy,
            collaborators,
            executed: HashSet::new(),
        }
    }

    /// Refuse plans this executor must not run. No side effects.
    pub fn check_preconditions(&self, plan: &RollbackPlan) -> Result<(), RollbackError> {
        if self.executed.contains(&plan.id) {
            return Err(RollbackError::AlreadyExecuted(plan.id.clone()));
        }
        plan.verify().map_err(|source| RollbackError::Integrity {
            plan_id: plan.id.clone(),
            source,
        })?;
        let strategy = StrategyProvider::new(&self.policy)
            .for_environment(plan.environment)
            .map_err(|e| RollbackError::Precondition(e.to_string()))?;
        if !strategy.allow_rollback {
            return Err(RollbackError::Disabled(plan.environment));
        }
        let status = plan.approval_status();
        let refused = matches!(status, ApprovalStatus::Denied | ApprovalStatus::Expired);
        if refused || (strategy.require_approval && status != ApprovalStatus::Granted) {
            return Err(RollbackError::NotApproved {
                plan_id: plan.id.clone(),
                status,
            });
        }
        if strategy.require_approval && plan.approval().is_none() {
            return Err(RollbackError::UnrecordedApproval(plan.id.clone()));
        }
        if plan.target_versions.is_empty() {
            return Err(RollbackError::Precondition(format!(
                "plan {} names no domains",
                plan.id
            )));
        }
        if let Some(unknown) = plan.domains().find(|d| !self.policy.domains.contains(d)) {
            return Err(RollbackError::Precondition(format!(
                "plan {} names unknown domain {unknown}",
                plan.id
            )));
        }
        Ok(())
    }

    pub fn execute_rollback(
        &mut self,
        ctx: &ExecutionContext,
        plan: &RollbackPlan,
        recorder: &mut AuditTrailRecorder,
    ) -> Result<RollbackResult, RollbackError> {
        self.check_preconditions(plan)?;
        self.executed.insert(plan.id.clone());

        let env = plan.environment;
        let clock = Arc::clone(&self.collaborators.clock);
        let started = Instant::now();
        let mut log = RunLog::begin(recorder, "rbk");
        let mut result = RollbackResult::new(
            plan.id.clone(),
            env,
            log.correlation_id().to_string(),
            clock.now(),
        );
        result.order = self.policy.domains.rollback_order(plan.domains());

        info!(plan = %plan.id, environment = %env, order = ?result.order, "rollback started");
        log.success(
            "run.started",
            env.as_str(),
            AuditDetail::RunStarted {
                environment: env,
                operation: RunOperation::Rollback,
                domains: result.order.clone(),
            },
        );

        self.snapshot(ctx, env, &mut result);
        self.inspect_data_loss(ctx, env, plan, &mut result);

        let order = result.order.clone();
        for (i, domain) in order.iter().enumerate() {
            let target = plan.target_versions[domain];
            let from_version = result.snapshots.get(domain).map(|s| s.version);
            let migrator = Arc::clone(&self.collaborators.migrator);
            let d = domain.clone();
            match ctx.mutate("apply target version", move || {
                migrator.apply_target_version(&d, env, target)
            }) {
                Ok(()) => {
                    info!(domain = %domain, to = target, "domain rolled back");
                    result.rolled_back.push(domain.clone());
                    log.success(
                        "rollback.domain",
                        domain,
                        AuditDetail::RollbackDomain {
                            plan_id: plan.id.clone(),
                            from_version,
                            to_version: target,
                            error: None,
                        },
                    );
                }
                Err(e) => {
                    error!(domain = %domain, to = target, error = %e, "domain rollback failed");
                    result.failed_domains.push(domain.clone());
                    result.errors.push(match ctx.abandoned_call() {
                        Some(_) => format!("{domain}: outcome unknown, rollback may still be running: {e}"),
                        None => format!("{domain}: {e}"),
                    });
                    log.failure(
                        "rollback.domain",
                        domain,
                        AuditDetail::RollbackDomain {
                            plan_id: plan.id.clone(),
                            from_version,
                            to_version: target,
                            error: Some(e.to_string()),
                        },
                    );
                    if env != Environment::Development || ctx.is_interrupted() {
                        result.not_attempted = order[i + 1..].to_vec();
                        break;
                    }
                }
            }
        }

        let success = result.failed_domains.is_empty() && result.not_attempted.is_empty();
        if success {
            result.snapshots.clear();
        } else {
            result.recovery_steps = recovery_steps(plan, &result);
        }
        result.warnings.extend(log.take_sink_errors());

        let duration = started.elapsed();
        log.record(
            "run.completed",
            env.as_str(),
            if success {
                AuditOutcome::Success
            } else {
                AuditOutcome::Failure
            },
            AuditDetail::RunCompleted {
                success,
                completed: result.rolled_back.len(),
                failed: result.failed_domains.len(),
                duration_ms: duration.as_millis() as u64,
                error: result.errors.first().cloned(),
            },
        );
        result.close(clock.now(), duration, log.entries());
        Ok(result)
    }

    /// Version markers taken before anything is changed.
    fn snapshot(&self, ctx: &ExecutionContext, env: Environment, result: &mut RollbackResult) {
        for domain in result.order.clone() {
            let repo = Arc::clone(&self.collaborators.versions);
            let d = domain.clone();
            match ctx.call("current version", move || repo.current_version(&d, env)) {
                Ok(version) => {
                    result.snapshots.insert(
                        domain.clone(),
                        VersionSnapshot {
                            domain,
                            version,
                            taken_at: self.collaborators.clock.now(),
                        },
                    );
                }
                Err(e) => {
                    warn!(domain = %domain, error = %e, "no pre-rollback snapshot");
                    result
                        .warnings
                        .push(format!("{domain}: pre-rollback snapshot unavailable: {e}"));
                }
            }
        }
    }

    fn inspect_data_loss(
        &self,
        ctx: &ExecutionContext,
        env: Environment,
        plan: &RollbackPlan,
        result: &mut RollbackResult,
    ) {
        for domain in result.order.clone() {
            let target = plan.target_versions[&domain];
            let from = result
                .snapshots
                .get(&domain)
                .map(|s| s.version)
                .or_else(|| plan.current_versions.get(&domain).copied().flatten());
            let Some(from) = from else { continue };
            if from <= target {
                continue;
            }
            let repo = Arc::clone(&self.collaborators.versions);
            let d = domain.clone();
            match ctx.call("destructive operations", move || {
                repo.destructive_operations(&d, env, from, target)
            }) {
                Ok(ops) => {
                    for w in data_loss::classify(&domain, &ops) {
                        warn!(domain = %domain, object = %w.object, severity = %w.severity, "data loss risk");
                        result.warnings.push(data_loss::describe(&w));
                        result.data_loss.push(w);
                    }
                }
                Err(e) => {
                    warn!(domain = %domain, error = %e, "data-loss inspection unavailable");
                }
            }
        }
    }
}

/// Ordered manual recovery guidance for a partial rollback.
fn recovery_steps(plan: &RollbackPlan, result: &RollbackResult) -> Vec<String> {
    let mut steps = vec![
        format!(
            "Review the audit trail for correlation id {} and the rollback logs",
            result.correlation_id
        ),
        format!("Verify database connectivity in {}", result.environment),
        format!(
            "Verify integrity of the migration files for {}",
            result.failed_domains.join(", ")
        ),
    ];
    for domain in &result.failed_domains {
        let target = plan.target_versions.get(domain).copied().unwrap_or_default();
        let before = result
            .snapshots
            .get(domain)
            .map(|s| s.version.to_string())
            .unwrap_or_else(|| "unknown".into());
        steps.push(format!(
            "Manually inspect {domain}: rollback to version {target} failed (version before rollback: {before})"
        ));
    }
    for domain in &result.not_attempted {
        let target = plan.target_versions.get(domain).copied().unwrap_or_default();
        steps.push(format!(
            "Roll back {domain} to version {target} once the failed domains are resolved"
        ));
    }
    steps.push(
        "If the schema cannot be repaired, restore from the most recent backup or recovery point"
            .to_string(),
    );
    steps
}
