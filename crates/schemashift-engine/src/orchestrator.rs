use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use schemashift_core::audit::{AuditDetail, RunOperation};
use schemashift_core::errors::{CollaboratorError, GateFailure, MigrationError};
use schemashift_core::policy::Policy;
use schemashift_core::result::{MigrationResult, POST_MIGRATION, PRE_MIGRATION};
use schemashift_core::strategy::MigrationStrategy;
use schemashift_core::types::{AuditOutcome, Environment, GateKind, PostCheck, RiskLevel};
use tracing::{debug, error, info, warn};

use crate::audit::{AuditTrailRecorder, RunLog};
use crate::backup::BackupCoordinator;
use crate::collaborators::Collaborators;
use crate::context::ExecutionContext;
use crate::gates::{
    enforce_minimum, evaluate_window, require_healthy, ApprovalGate, MigrationApprovalInput,
    WindowDecision,
};
use crate::strategy::StrategyProvider;

/// Drives one end-to-end migration run.
///
/// Gates run in order (window, pre-validation, security, compliance,
/// approval, backup); a gate disabled by the strategy is skipped. A gate
/// failure returns an error before any domain is touched. Domains are then
/// migrated one at a time in declared order with bounded retries, followed by
/// post-checks whose failures only produce warnings.
pub struct MigrationOrchestrator {
    policy: Policy,
    collaborators: Collaborators,
    actor: String,
}

impl MigrationOrchestrator {
    pub fn new(policy: Policy, collaborators: Collaborators, actor: impl Into<String>) -> Self {
        Self {
            policy,
            collaborators,
            actor: actor.into(),
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn run(
        &self,
        env: Environment,
        ctx: &ExecutionContext,
        recorder: &mut AuditTrailRecorder,
    ) -> Result<MigrationResult, MigrationError> {
        let strategy = StrategyProvider::new(&self.policy)
            .for_environment(env)
            .map_err(|e| MigrationError::Precondition(e.to_string()))?;
        self.run_with_strategy(&strategy, ctx, recorder)
    }

    pub fn run_with_strategy(
        &self,
        strategy: &MigrationStrategy,
        ctx: &ExecutionContext,
        recorder: &mut AuditTrailRecorder,
    ) -> Result<MigrationResult, MigrationError> {
        strategy
            .validate()
            .map_err(|e| MigrationError::Precondition(e.to_string()))?;
        let env = strategy.environment;
        let clock = Arc::clone(&self.collaborators.clock);
        let started = Instant::now();

        let mut log = RunLog::begin(recorder, "mig");
        let mut result = MigrationResult::new(env, log.correlation_id().to_string(), clock.now());
        let domains: Vec<String> = self.policy.domains.names().map(String::from).collect();

        info!(environment = %env, correlation_id = log.correlation_id(), "migration run started");
        log.success(
            "run.started",
            env.as_str(),
            AuditDetail::RunStarted {
                environment: env,
                operation: RunOperation::Migration,
                domains: domains.clone(),
            },
        );

        if let Err(e) = self.pass_gates(ctx, strategy, &mut log, &mut result) {
            error!(environment = %env, error = %e, "migration aborted at gate");
            log.failure(
                "run.aborted",
                env.as_str(),
                AuditDetail::RunCompleted {
                    success: false,
                    completed: 0,
                    failed: 0,
                    duration_ms: started.elapsed().as_millis() as u64,
                    error: Some(e.to_string()),
                },
            );
            return Err(e);
        }

        if strategy.backup_before_migrate {
            self.create_recovery_point(ctx, env, &mut log, &mut result);
        }

        self.migrate_domains(ctx, strategy, &domains, &mut log, &mut result);
        match ctx.abandoned_call() {
            Some(pending) => {
                warn!(environment = %env, %pending, "post-checks skipped");
                result
                    .warnings
                    .push(format!("post-checks skipped: {pending} may still be running"));
            }
            None => self.post_checks(ctx, strategy, &mut log, &mut result),
        }

        let success = result.failed_domains.is_empty();
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
                completed: result.completed_domains.len(),
                failed: result.failed_domains.len(),
                duration_ms: duration.as_millis() as u64,
                error: result.errors.first().cloned(),
            },
        );
        result.close(clock.now(), duration, log.entries());
        info!(
            environment = %env,
            success,
            completed = result.completed_domains.len(),
            failed = result.failed_domains.len(),
            skipped = result.skipped_domains.len(),
            "migration run finished"
        );
        Ok(result)
    }

    fn pass_gates(
        &self,
        ctx: &ExecutionContext,
        strategy: &MigrationStrategy,
        log: &mut RunLog<'_>,
        result: &mut MigrationResult,
    ) -> Result<(), MigrationError> {
        let env = strategy.environment;
        let c = &self.collaborators;

        if let Some(window) = strategy.maintenance_window.as_ref() {
            let decision = evaluate_window(Some(window), c.clock.now());
            let issues = match &decision {
                Ok(WindowDecision::Overridden) => {
                    let note = format!("outside maintenance window {window}, override allowed");
                    warn!(environment = %env, "{note}");
                    result.warnings.push(note.clone());
                    vec![note]
                }
                Ok(_) => vec![],
                Err(e) => vec![e.to_string()],
            };
            gate_entry(log, env, GateKind::MaintenanceWindow, decision.is_ok(), None, None, issues);
            decision.map_err(|e| MigrationError::gate(GateKind::MaintenanceWindow, e))?;
        }

        if strategy.validate_before {
            let validator = Arc::clone(&c.validator);
            let outcome = ctx
                .call("validate environment", move || validator.validate_environment(env))
                .map_err(GateFailure::from)
                .and_then(|report| {
                    let checked = require_healthy(&report);
                    result
                        .validation_results
                        .insert(PRE_MIGRATION.to_string(), report);
                    checked
                });
            let issues = outcome.as_ref().err().map(|e| vec![e.to_string()]).unwrap_or_default();
            gate_entry(log, env, GateKind::PreValidation, outcome.is_ok(), None, None, issues);
            outcome.map_err(|e| MigrationError::gate(GateKind::PreValidation, e))?;
        }

        if strategy.require_security_scan {
            let security = Arc::clone(&c.security);
            let minimum = self.policy.thresholds.security_min;
            self.scored_gate(
                log,
                env,
                GateKind::Security,
                minimum,
                ctx.call("assess security", move || security.assess_security(env)),
                |report| {
                    result
                        .security_results
                        .insert(PRE_MIGRATION.to_string(), report.clone());
                    enforce_minimum("security", report, minimum)
                },
            )?;
        }

        if strategy.require_compliance {
            let compliance = Arc::clone(&c.compliance);
            let minimum = self.policy.thresholds.compliance_min;
            self.scored_gate(
                log,
                env,
                GateKind::Compliance,
                minimum,
                ctx.call("assess compliance", move || compliance.assess_compliance(env)),
                |report| {
                    result
                        .compliance_results
                        .insert(PRE_MIGRATION.to_string(), report.clone());
                    enforce_minimum("compliance", report, minimum)
                },
            )?;
        }

        if strategy.require_approval {
            self.approval_gate(ctx, env, log, result)?;
        }

        if strategy.backup_before_migrate {
            let coordinator =
                BackupCoordinator::new(&self.collaborators, self.policy.domains.clone(), &self.actor);
            let outcome = coordinator
                .run(ctx, strategy, log)
                .map_err(MigrationError::Backup)?;
            result.backup_locations = outcome.report.locations();
            result.backup = Some(outcome.report);
            result.warnings.extend(outcome.warnings);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn scored_gate<F>(
        &self,
        log: &mut RunLog<'_>,
        env: Environment,
        gate: GateKind,
        minimum: f64,
        report: Result<schemashift_core::traits::ScoreReport, CollaboratorError>,
        check: F,
    ) -> Result<(), MigrationError>
    where
        F: FnOnce(&schemashift_core::traits::ScoreReport) -> Result<(), GateFailure>,
    {
        let (score, outcome) = match report {
            Ok(report) => (Some(report.score), check(&report)),
            Err(e) => (None, Err(GateFailure::from(e))),
        };
        let issues = outcome.as_ref().err().map(|e| vec![e.to_string()]).unwrap_or_default();
        gate_entry(log, env, gate, outcome.is_ok(), score, Some(minimum), issues);
        outcome.map_err(|e| MigrationError::gate(gate, e))
    }

    fn approval_gate(
        &self,
        ctx: &ExecutionContext,
        env: Environment,
        log: &mut RunLog<'_>,
        result: &mut MigrationResult,
    ) -> Result<(), MigrationError> {
        let input = match self.approval_input(ctx, env) {
            Ok(input) => input,
            Err(e) => {
                gate_entry(log, env, GateKind::Approval, false, None, None, vec![e.to_string()]);
                return Err(MigrationError::gate(GateKind::Approval, e));
            }
        };
        let gate = ApprovalGate::new(
            Arc::clone(&self.collaborators.approvals),
            Arc::clone(&self.collaborators.clock),
        );
        let decision = match gate.request_migration_approval(ctx, input) {
            Ok(decision) => decision,
            Err(e) => {
                gate_entry(log, env, GateKind::Approval, false, None, None, vec![e.to_string()]);
                return Err(MigrationError::gate(GateKind::Approval, e));
            }
        };
        result.approval_status = decision.status.to_string();
        log.record(
            "gate.approval",
            env.as_str(),
            if decision.is_granted() {
                AuditOutcome::Success
            } else {
                AuditOutcome::Failure
            },
            decision.audit_detail(),
        );
        decision
            .require_granted()
            .map_err(|e| MigrationError::gate(GateKind::Approval, e))
    }

    /// Describe the pending change for the approver: versions, aggregate
    /// risk, a rough duration, and the versions a rollback would return to.
    fn approval_input(
        &self,
        ctx: &ExecutionContext,
        env: Environment,
    ) -> Result<MigrationApprovalInput, CollaboratorError> {
        let mut changes = Vec::new();
        let mut fallback = BTreeMap::new();
        let mut risk = RiskLevel::Low;
        let mut changing = 0u32;
        for domain in self.policy.domains.names() {
            let repo = Arc::clone(&self.collaborators.versions);
            let d = domain.to_string();
            let current = ctx.call("current version", move || repo.current_version(&d, env))?;
            let repo = Arc::clone(&self.collaborators.versions);
            let d = domain.to_string();
            let latest = ctx.call("latest version", move || repo.latest_version(&d, env))?;
            risk = risk.max(self.policy.risk.classify(latest.saturating_sub(current)));
            if latest > current {
                changing += 1;
            }
            changes.push(format!("{domain} {current}->{latest}"));
            fallback.insert(domain.to_string(), current);
        }
        Ok(MigrationApprovalInput {
            environment: env,
            summary: format!("migrate {env}: {}", changes.join(", ")),
            risk_level: risk,
            expected_duration: self.policy.rollback_base() * changing,
            requested_by: self.actor.clone(),
            fallback_versions: fallback,
        })
    }

    fn create_recovery_point(
        &self,
        ctx: &ExecutionContext,
        env: Environment,
        log: &mut RunLog<'_>,
        result: &mut MigrationResult,
    ) {
        let store = Arc::clone(&self.collaborators.backups);
        let label = log.correlation_id().to_string();
        match ctx.call("create recovery point", move || {
            store.create_recovery_point(env, &label)
        }) {
            Ok(location) => {
                result.recovery_point = Some(location);
                log.success(
                    "post.recovery_point",
                    env.as_str(),
                    AuditDetail::PostCondition {
                        check: PostCheck::RecoveryPoint,
                        issues: vec![],
                    },
                );
            }
            Err(e) => {
                warn!(environment = %env, error = %e, "recovery point not created");
                result.warnings.push(format!("recovery point: {e}"));
                log.failure(
                    "post.recovery_point",
                    env.as_str(),
                    AuditDetail::PostCondition {
                        check: PostCheck::RecoveryPoint,
                        issues: vec![e.to_string()],
                    },
                );
            }
        }
    }

    fn migrate_domains(
        &self,
        ctx: &ExecutionContext,
        strategy: &MigrationStrategy,
        domains: &[String],
        log: &mut RunLog<'_>,
        result: &mut MigrationResult,
    ) {
        let env = strategy.environment;
        let max_attempts = strategy.max_retries;

        for domain in domains {
            let migrator = Arc::clone(&self.collaborators.migrator);
            let d = domain.clone();
            let pending = match ctx.call("pending count", move || migrator.pending_count(&d, env)) {
                Ok(n) => n,
                Err(e) => {
                    let msg = format!("cannot read pending migrations: {e}");
                    log.failure(
                        "domain.attempt",
                        domain,
                        AuditDetail::DomainAttempt {
                            attempt: 0,
                            max_attempts,
                            error: Some(msg.clone()),
                        },
                    );
                    result.mark_failed(domain, msg);
                    if ctx.is_interrupted() || strategy.fail_fast {
                        break;
                    }
                    continue;
                }
            };

            if pending == 0 {
                debug!(domain = %domain, "nothing pending");
                result.mark_skipped(domain);
                log.success(
                    "domain.skipped",
                    domain,
                    AuditDetail::DomainSkipped {
                        reason: "no pending migrations".into(),
                    },
                );
                continue;
            }

            let mut last_error: Option<CollaboratorError> = None;
            let mut attempts = 0u32;
            for attempt in 1..=max_attempts {
                attempts = attempt;
                let migrator = Arc::clone(&self.collaborators.migrator);
                let d = domain.clone();
                match ctx.mutate("migrate domain", move || {
                    migrator.execute_domain_migrations(&d, env)
                }) {
                    Ok(()) => {
                        info!(domain = %domain, attempt, pending, "domain migrated");
                        log.success(
                            "domain.attempt",
                            domain,
                            AuditDetail::DomainAttempt {
                                attempt,
                                max_attempts,
                                error: None,
                            },
                        );
                        last_error = None;
                        break;
                    }
                    Err(e) => {
                        warn!(domain = %domain, attempt, max_attempts, error = %e, "domain attempt failed");
                        log.failure(
                            "domain.attempt",
                            domain,
                            AuditDetail::DomainAttempt {
                                attempt,
                                max_attempts,
                                error: Some(e.to_string()),
                            },
                        );
                        last_error = Some(e);
                        if ctx.is_interrupted() {
                            break;
                        }
                        if attempt < max_attempts {
                            if let Err(e) = ctx.sleep(strategy.retry_delay) {
                                last_error = Some(e);
                                break;
                            }
                        }
                    }
                }
            }

            match last_error {
                None => result.mark_completed(domain),
                Some(e) => {
                    let msg = match ctx.abandoned_call() {
                        Some(_) => format!(
                            "outcome unknown after {attempts} attempt(s), migration may still be running: {e}"
                        ),
                        None => format!("failed after {attempts} attempt(s): {e}"),
                    };
                    result.mark_failed(domain, msg);
                    if ctx.is_interrupted() {
                        warn!(domain = %domain, "execution context ended, stopping domain loop");
                        break;
                    }
                    if strategy.fail_fast {
                        warn!(domain = %domain, "fail-fast: remaining domains not attempted");
                        break;
                    }
                }
            }
        }
    }

    fn post_checks(
        &self,
        ctx: &ExecutionContext,
        strategy: &MigrationStrategy,
        log: &mut RunLog<'_>,
        result: &mut MigrationResult,
    ) {
        let env = strategy.environment;

        if strategy.validate_after {
            let validator = Arc::clone(&self.collaborators.validator);
            let issues = match ctx.call("validate environment", move || {
                validator.validate_environment(env)
            }) {
                Ok(report) => {
                    let issues = match require_healthy(&report) {
                        Ok(()) => vec![],
                        Err(e) => vec![e.to_string()],
                    };
                    result
                        .validation_results
                        .insert(POST_MIGRATION.to_string(), report);
                    issues
                }
                Err(e) => vec![e.to_string()],
            };
            post_entry(log, result, env, PostCheck::PostValidation, issues);
        }

        if strategy.check_business_continuity {
            let compliance = Arc::clone(&self.collaborators.compliance);
            let issues = match ctx.call("assess business continuity", move || {
                compliance.assess_business_continuity(env)
            }) {
                Ok(report) => {
                    result.business_impact_score = Some(report.impact_score);
                    if report.passed {
                        vec![]
                    } else if report.issues.is_empty() {
                        vec![format!("impact score {:.1}", report.impact_score)]
                    } else {
                        report.issues
                    }
                }
                Err(e) => vec![e.to_string()],
            };
            post_entry(log, result, env, PostCheck::BusinessContinuity, issues);
        }
    }
}

fn gate_entry(
    log: &mut RunLog<'_>,
    env: Environment,
    gate: GateKind,
    passed: bool,
    score: Option<f64>,
    minimum: Option<f64>,
    issues: Vec<String>,
) {
    let event = format!("gate.{gate}");
    let detail = AuditDetail::Gate {
        gate,
        score,
        minimum,
        issues,
    };
    if passed {
        log.success(&event, env.as_str(), detail);
    } else {
        log.failure(&event, env.as_str(), detail);
    }
}

/// Post-check failures are downgraded to warnings.
fn post_entry(
    log: &mut RunLog<'_>,
    result: &mut MigrationResult,
    env: Environment,
    check: PostCheck,
    issues: Vec<String>,
) {
    let event = format!("post.{check}");
    if issues.is_empty() {
        log.success(&event, env.as_str(), AuditDetail::PostCondition { check, issues });
        return;
    }
    warn!(environment = %env, %check, ?issues, "post-condition failed");
    result
        .warnings
        .extend(issues.iter().map(|i| format!("{check}: {i}")));
    log.failure(&event, env.as_str(), AuditDetail::PostCondition { check, issues });
}
