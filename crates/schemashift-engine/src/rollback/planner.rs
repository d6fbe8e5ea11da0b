use std::collections::BTreeMap;
use std::sync::Arc;

use schemashift_core::audit::AuditDetail;
use schemashift_core::errors::{PlanningError, PolicyError};
use schemashift_core::policy::Policy;
use schemashift_core::rollback::{derive_plan_id, PlanDraft, RollbackDependency, RollbackPlan};
use schemashift_core::strategy::MigrationStrategy;
use schemashift_core::types::{ApprovalStatus, Environment, RiskLevel};
use tracing::{info, warn};

use crate::audit::{AuditTrailRecorder, RunLog};
use crate::collaborators::Collaborators;
use crate::context::ExecutionContext;
use crate::strategy::StrategyProvider;

/// Builds dependency-checked, risk-scored rollback plans for one environment.
pub struct RollbackPlanner {
    policy: Policy,
    strategy: MigrationStrategy,
    collaborators: Collaborators,
}

impl RollbackPlanner {
    pub fn new(
        environment: Environment,
        policy: Policy,
        collaborators: Collaborators,
    ) -> Result<Self, PolicyError> {
        let strategy = StrategyProvider::new(&policy).for_environment(environment)?;
        Ok(Self {
            policy,
            strategy,
            collaborators,
        })
    }

    pub fn environment(&self) -> Environment {
        self.strategy.environment
    }

    /// Plan a rollback of each named domain to its target version.
    ///
    /// No plan exists after an error. Both outcomes are audited.
    pub fn create_rollback_plan(
        &self,
        ctx: &ExecutionContext,
        target_versions: &BTreeMap<String, u64>,
        reason: &str,
        requester: &str,
        recorder: &mut AuditTrailRecorder,
    ) -> Result<RollbackPlan, PlanningError> {
        let env = self.environment();
        let requested_at = self.collaborators.clock.now();
        let id = derive_plan_id(env, requester, &requested_at, reason, target_versions);
        let mut log = RunLog::begin(recorder, "rbp");

        match self.build(ctx, id.clone(), target_versions, reason, requester, requested_at) {
            Ok(plan) => {
                info!(
                    plan = %plan.id,
                    environment = %env,
                    risk = %plan.risk_level,
                    status = %plan.approval_status(),
                    "rollback plan created"
                );
                log.success(
                    "rollback.planned",
                    env.as_str(),
                    AuditDetail::RollbackPlanned {
                        plan_id: plan.id.clone(),
                        risk: plan.risk_level,
                        domains: plan.domains().map(String::from).collect(),
                        rejection: None,
                    },
                );
                Ok(plan)
            }
            Err((risk, e)) => {
                warn!(plan = %id, environment = %env, error = %e, "rollback plan rejected");
                log.failure(
                    "rollback.rejected",
                    env.as_str(),
                    AuditDetail::RollbackPlanned {
                        plan_id: id,
                        risk,
                        domains: target_versions.keys().cloned().collect(),
                        rejection: Some(e.to_string()),
                    },
                );
                Err(e)
            }
        }
    }

    fn build(
        &self,
        ctx: &ExecutionContext,
        id: String,
        targets: &BTreeMap<String, u64>,
        reason: &str,
        requester: &str,
        requested_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<RollbackPlan, (RiskLevel, PlanningError)> {
        let env = self.environment();
        let catalog = &self.policy.domains;
        if targets.is_empty() {
            return Err((RiskLevel::Low, PlanningError::EmptyRequest));
        }
        if let Some(unknown) = targets.keys().find(|d| !catalog.contains(d)) {
            return Err((RiskLevel::Low, PlanningError::UnknownDomain(unknown.clone())));
        }

        let dependencies = self.dependencies(targets);

        let mut current_versions = BTreeMap::new();
        let mut domain_risks = BTreeMap::new();
        for (domain, &target) in targets {
            let repo = Arc::clone(&self.collaborators.versions);
            let d = domain.clone();
            let risk = match ctx.call("current version", move || repo.current_version(&d, env)) {
                Ok(current) => {
                    current_versions.insert(domain.clone(), Some(current));
                    if target > current {
                        return Err((
                            RiskLevel::Low,
                            PlanningError::TargetAboveCurrent {
                                domain: domain.clone(),
                                current,
                                target,
                            },
                        ));
                    }
                    self.policy.risk.classify(current - target)
                }
                Err(e) => {
                    warn!(domain = %domain, error = %e, "current version unreadable, treating as critical");
                    current_versions.insert(domain.clone(), None);
                    RiskLevel::Critical
                }
            };
            domain_risks.insert(domain.clone(), risk);
        }
        let risk_level = domain_risks
            .values()
            .copied()
            .max()
            .unwrap_or(RiskLevel::Low);

        let estimated_duration = self.policy.rollback_base() * targets.len() as u32;

        let conflicts: Vec<RollbackDependency> = dependencies
            .iter()
            .filter(|d| !d.can_proceed)
            .cloned()
            .collect();
        if !conflicts.is_empty() {
            return Err((risk_level, PlanningError::DependencyConflict(conflicts)));
        }
        if env == Environment::Production && risk_level == RiskLevel::Critical {
            return Err((
                risk_level,
                PlanningError::ExcessiveRisk {
                    environment: env,
                    risk: risk_level,
                },
            ));
        }

        let approval_status = if self.strategy.require_approval {
            ApprovalStatus::Pending
        } else {
            ApprovalStatus::Granted
        };

        Ok(PlanDraft {
            id,
            environment: env,
            requester: requester.to_string(),
            requested_at,
            reason: reason.to_string(),
            target_versions: targets.clone(),
            current_versions,
            risk_level,
            domain_risks,
            estimated_duration,
            dependencies,
            approval_status,
        }
        .into())
    }

    /// One edge per (requested domain, domain it depends on). A dependent may
    /// not end up below a dependency that is also being rolled back.
    pub fn dependencies(&self, targets: &BTreeMap<String, u64>) -> Vec<RollbackDependency> {
        let catalog = &self.policy.domains;
        let mut edges = Vec::new();
        for dependent in catalog.names().filter(|d| targets.contains_key(*d)) {
            let dependent_target = targets[dependent];
            for dependency in catalog.dependencies_of(dependent) {
                let (can_proceed, reason) = match targets.get(dependency) {
                    Some(&dep_target) if dep_target > dependent_target => (
                        false,
                        format!(
                            "{dependency} target {dep_target} is above {dependent} target {dependent_target}; \
                             {dependent} cannot roll back past a dependency left ahead of it"
                        ),
                    ),
                    Some(&dep_target) => (
                        true,
                        format!(
                            "{dependency} target {dep_target} does not exceed {dependent} target {dependent_target}"
                        ),
                    ),
                    None => (true, format!("{dependency} is not being rolled back")),
                };
                edges.push(RollbackDependency {
                    domain: dependency.clone(),
                    required_by: dependent.to_string(),
                    reason,
                    can_proceed,
                });
            }
        }
        edges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::World;
    use std::time::Duration;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(Duration::from_secs(5), Duration::from_secs(5))
    }

    fn targets(pairs: &[(&str, u64)]) -> BTreeMap<String, u64> {
        pairs.iter().map(|(d, v)| (d.to_string(), *v)).collect()
    }

    fn planner(world: &World, env: Environment) -> RollbackPlanner {
        RollbackPlanner::new(env, Policy::default(), world.collaborators()).unwrap()
    }

    #[test]
    fn dependency_ahead_of_dependent_is_rejected() {
        let world = World::new(Environment::Staging);
        world.set_versions("content", 6, 6);
        world.set_versions("services", 4, 4);
        let mut recorder = AuditTrailRecorder::new("tester");
        let err = planner(&world, Environment::Staging)
            .create_rollback_plan(
                &ctx(),
                &targets(&[("content", 5), ("services", 2)]),
                "bad release",
                "ops",
                &mut recorder,
            )
            .unwrap_err();
        match err {
            PlanningError::DependencyConflict(conflicts) => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].domain, "content");
                assert_eq!(conflicts[0].required_by, "services");
                assert!(!conflicts[0].can_proceed);
            }
            other => panic!("unexpected {other}"),
        }
        let entry = recorder.entries().last().unwrap();
        assert_eq!(entry.event, "rollback.rejected");
    }

    #[test]
    fn risk_boundary_ten_is_high_eleven_critical() {
        let world = World::new(Environment::Production);
        world.set_versions("content", 20, 20);
        let mut recorder = AuditTrailRecorder::new("tester");
        let p = planner(&world, Environment::Production);
        let plan = p
            .create_rollback_plan(&ctx(), &targets(&[("content", 10)]), "r", "ops", &mut recorder)
            .unwrap();
        assert_eq!(plan.risk_level, RiskLevel::High);
        assert_eq!(plan.approval_status(), ApprovalStatus::Pending);

        let err = p
            .create_rollback_plan(&ctx(), &targets(&[("content", 9)]), "r", "ops", &mut recorder)
            .unwrap_err();
        assert!(matches!(
            err,
            PlanningError::ExcessiveRisk {
                risk: RiskLevel::Critical,
                ..
            }
        ));
    }

    #[test]
    fn critical_risk_allowed_outside_production() {
        let world = World::new(Environment::Staging);
        world.set_versions("content", 20, 20);
        let mut recorder = AuditTrailRecorder::new("tester");
        let plan = planner(&world, Environment::Staging)
            .create_rollback_plan(&ctx(), &targets(&[("content", 1)]), "r", "ops", &mut recorder)
            .unwrap();
        assert_eq!(plan.risk_level, RiskLevel::Critical);
    }

    #[test]
    fn unreadable_version_escalates_to_critical() {
        let world = World::new(Environment::Production);
        world.set_versions("services", 3, 3);
        world.unreadable_version("services");
        let mut recorder = AuditTrailRecorder::new("tester");
        let err = planner(&world, Environment::Production)
            .create_rollback_plan(&ctx(), &targets(&[("services", 2)]), "r", "ops", &mut recorder)
            .unwrap_err();
        assert!(matches!(err, PlanningError::ExcessiveRisk { .. }));

        let world = World::new(Environment::Development);
        world.unreadable_version("services");
        let plan = planner(&world, Environment::Development)
            .create_rollback_plan(&ctx(), &targets(&[("services", 2)]), "r", "ops", &mut recorder)
            .unwrap();
        assert_eq!(plan.domain_risks["services"], RiskLevel::Critical);
        assert_eq!(plan.current_versions["services"], None);
    }

    #[test]
    fn development_plans_are_auto_granted() {
        let world = World::new(Environment::Development);
        world.set_versions("content", 5, 5);
        world.set_versions("services", 5, 5);
        let mut recorder = AuditTrailRecorder::new("tester");
        let plan = planner(&world, Environment::Development)
            .create_rollback_plan(
                &ctx(),
                &targets(&[("content", 3), ("services", 4)]),
                "r",
                "ops",
                &mut recorder,
            )
            .unwrap();
        assert_eq!(plan.approval_status(), ApprovalStatus::Granted);
        assert_eq!(plan.estimated_duration, Duration::from_secs(600));
        assert_eq!(plan.risk_level, RiskLevel::Low);
        assert!(plan.dependencies.iter().all(|d| d.can_proceed));
        assert!(plan.id.starts_with("rbp-"));
        assert_eq!(recorder.entries().last().unwrap().event, "rollback.planned");
    }

    #[test]
    fn dependency_outside_request_can_proceed() {
        let world = World::new(Environment::Staging);
        let p = planner(&world, Environment::Staging);
        let edges = p.dependencies(&targets(&[("services", 1)]));
        assert_eq!(edges.len(), 1);
        assert!(edges[0].can_proceed);
    }

    #[test]
    fn request_validation() {
        let world = World::new(Environment::Staging);
        world.set_versions("content", 2, 2);
        let p = planner(&world, Environment::Staging);
        let mut recorder = AuditTrailRecorder::new("tester");
        assert!(matches!(
            p.create_rollback_plan(&ctx(), &BTreeMap::new(), "r", "ops", &mut recorder),
            Err(PlanningError::EmptyRequest)
        ));
        assert!(matches!(
            p.create_rollback_plan(&ctx(), &targets(&[("identity", 1)]), "r", "ops", &mut recorder),
            Err(PlanningError::UnknownDomain(_))
        ));
        assert!(matches!(
            p.create_rollback_plan(&ctx(), &targets(&[("content", 3)]), "r", "ops", &mut recorder),
            Err(PlanningError::TargetAboveCurrent { current: 2, .. })
        ));
    }
}
