use std::time::Duration;

use chrono::NaiveTime;
use schemashift_core::errors::PolicyError;
use schemashift_core::policy::Policy;
use schemashift_core::strategy::{BackupScope, MaintenanceWindow, MigrationStrategy};
use schemashift_core::types::Environment;

/// Builds the per-run [`MigrationStrategy`] for an environment.
///
/// Gating flags are fixed per environment; retries, retry delay and the
/// maintenance window can be overridden by the policy document.
pub struct StrategyProvider<'a> {
    policy: &'a Policy,
}

impl<'a> StrategyProvider<'a> {
    pub fn new(policy: &'a Policy) -> Self {
        Self { policy }
    }

    pub fn for_environment(&self, env: Environment) -> Result<MigrationStrategy, PolicyError> {
        let mut strategy = defaults(env)?;
        if let Some(overrides) = self.policy.environments.get(env) {
            if let Some(retries) = overrides.max_retries {
                strategy.max_retries = retries;
            }
            if let Some(delay) = overrides.retry_delay_secs {
                if !delay.is_finite() || delay < 0.0 {
                    return Err(PolicyError::Invalid(format!(
                        "{env}: retry_delay_secs must be a non-negative number"
                    )));
                }
                strategy.retry_delay = Duration::from_secs_f64(delay);
            }
            if let Some(window) = &overrides.maintenance_window {
                strategy.maintenance_window = Some(window.clone());
            }
        }
        strategy.validate()?;
        Ok(strategy)
    }

    /// Parse an environment name from configuration and build its strategy.
    pub fn for_name(&self, name: &str) -> Result<MigrationStrategy, PolicyError> {
        self.for_environment(name.parse()?)
    }
}

fn hm(h: u32, m: u32) -> Result<NaiveTime, PolicyError> {
    NaiveTime::from_hms_opt(h, m, 0)
        .ok_or_else(|| PolicyError::InvalidWindow(format!("{h:02}:{m:02} is not a time of day")))
}

fn defaults(env: Environment) -> Result<MigrationStrategy, PolicyError> {
    let strategy = match env {
        Environment::Development => MigrationStrategy {
            environment: env,
            validate_before: true,
            validate_after: false,
            require_approval: false,
            backup_before_migrate: false,
            allow_rollback: true,
            require_security_scan: false,
            require_compliance: false,
            check_business_continuity: false,
            fail_fast: false,
            confirm_backup: false,
            strict_backup_integrity: false,
            backup_scope: BackupScope::none(),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            maintenance_window: None,
        },
        Environment::Staging => MigrationStrategy {
            environment: env,
            validate_before: true,
            validate_after: true,
            require_approval: true,
            backup_before_migrate: true,
            allow_rollback: true,
            require_security_scan: true,
            require_compliance: false,
            check_business_continuity: true,
            fail_fast: false,
            confirm_backup: false,
            strict_backup_integrity: false,
            backup_scope: BackupScope {
                full_database: false,
                table_level: true,
                content: false,
                configuration: true,
            },
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            maintenance_window: Some(MaintenanceWindow::new(
                hm(0, 0)?,
                hm(6, 0)?,
                "UTC",
                true,
                Duration::from_secs(15 * 60),
            )?),
        },
        Environment::Production => MigrationStrategy {
            environment: env,
            validate_before: true,
            validate_after: true,
            require_approval: true,
            backup_before_migrate: true,
            allow_rollback: true,
            require_security_scan: true,
            require_compliance: true,
            check_business_continuity: true,
            fail_fast: true,
            confirm_backup: true,
            strict_backup_integrity: true,
            backup_scope: BackupScope {
                full_database: true,
                table_level: true,
                content: true,
                configuration: true,
            },
            max_retries: 2,
            retry_delay: Duration::from_secs(30),
            maintenance_window: Some(MaintenanceWindow::new(
                hm(2, 0)?,
                hm(4, 0)?,
                "UTC",
                false,
                Duration::from_secs(60 * 60),
            )?),
        },
    };
    Ok(strategy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemashift_core::policy::EnvironmentPolicy;

    #[test]
    fn approval_required_outside_development() {
        let policy = Policy::default();
        let provider = StrategyProvider::new(&policy);
        for env in Environment::ALL {
            let s = provider.for_environment(env).unwrap();
            assert_eq!(s.require_approval, env != Environment::Development, "{env}");
            assert!(s.max_retries >= 1);
        }
    }

    #[test]
    fn production_is_most_conservative() {
        let policy = Policy::default();
        let s = StrategyProvider::new(&policy)
            .for_environment(Environment::Production)
            .unwrap();
        assert!(s.fail_fast);
        assert!(s.confirm_backup);
        assert!(s.require_compliance);
        assert!(s.strict_backup_integrity);
        let window = s.maintenance_window.unwrap();
        assert!(!window.override_allowed());
    }

    #[test]
    fn development_has_no_window_or_gates() {
        let policy = Policy::default();
        let s = StrategyProvider::new(&policy)
            .for_environment(Environment::Development)
            .unwrap();
        assert!(s.maintenance_window.is_none());
        assert!(!s.require_security_scan);
        assert!(!s.backup_before_migrate);
        assert!(s.backup_scope.is_empty());
    }

    #[test]
    fn policy_overrides_tunables_only() {
        let mut policy = Policy::default();
        policy.environments.production = Some(EnvironmentPolicy {
            max_retries: Some(1),
            retry_delay_secs: Some(0.0),
            maintenance_window: None,
        });
        let s = StrategyProvider::new(&policy)
            .for_environment(Environment::Production)
            .unwrap();
        assert_eq!(s.max_retries, 1);
        assert_eq!(s.retry_delay, Duration::ZERO);
        assert!(s.require_approval);
        assert!(s.maintenance_window.is_some());
    }

    #[test]
    fn for_name_accepts_aliases() {
        let policy = Policy::default();
        let provider = StrategyProvider::new(&policy);
        assert_eq!(
            provider.for_name("prod").unwrap().environment,
            Environment::Production
        );
        assert!(provider.for_name("qa").is_err());
    }
}
