use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domains::DomainCatalog;
use crate::errors::PolicyError;
use crate::strategy::MaintenanceWindow;
use crate::types::{Environment, RiskLevel};

/// Operator policy document (`shift.policy.json`).
///
/// Every field has a default, so an empty object is a valid policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub thresholds: ScoreThresholds,
    pub risk: RiskThresholds,
    pub timeouts: Timeouts,
    /// Per-domain base used to approximate rollback duration.
    pub rollback_base_secs: u64,
    pub domains: DomainCatalog,
    pub environments: EnvironmentOverrides,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            thresholds: ScoreThresholds::default(),
            risk: RiskThresholds::default(),
            timeouts: Timeouts::default(),
            rollback_base_secs: 300,
            domains: DomainCatalog::canonical(),
            environments: EnvironmentOverrides::default(),
        }
    }
}

/// Minimum scores for the security and compliance gates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreThresholds {
    pub security_min: f64,
    pub compliance_min: f64,
}

impl Default for ScoreThresholds {
    fn default() -> Self {
        Self {
            security_min: 95.0,
            compliance_min: 98.0,
        }
    }
}

/// Version-diff buckets for risk assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskThresholds {
    /// Diffs strictly above this are Critical.
    pub critical_above: u64,
    /// Diffs from this value up to `critical_above` are High.
    pub high_from: u64,
    /// Diffs from this value below `high_from` are Moderate.
    pub moderate_from: u64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            critical_above: 10,
            high_from: 6,
            moderate_from: 3,
        }
    }
}

impl RiskThresholds {
    pub fn classify(&self, diff: u64) -> RiskLevel {
        if diff > self.critical_above {
            RiskLevel::Critical
        } else if diff >= self.high_from {
            RiskLevel::High
        } else if diff >= self.moderate_from {
            RiskLevel::Moderate
        } else {
            RiskLevel::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Per-call limit for validators, migrators and storage.
    pub call_secs: u64,
    /// Limit for a human approval decision.
    pub approval_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            call_secs: 30,
            approval_secs: 900,
        }
    }
}

impl Timeouts {
    pub fn call(&self) -> Duration {
        Duration::from_secs(self.call_secs)
    }

    pub fn approval(&self) -> Duration {
        Duration::from_secs(self.approval_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub development: Option<EnvironmentPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staging: Option<EnvironmentPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub production: Option<EnvironmentPolicy>,
}

impl EnvironmentOverrides {
    pub fn get(&self, env: Environment) -> Option<&EnvironmentPolicy> {
        match env {
            Environment::Development => self.development.as_ref(),
            Environment::Staging => self.staging.as_ref(),
            Environment::Production => self.production.as_ref(),
        }
    }
}

/// Tunable knobs per environment. Gating flags are not overridable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_window: Option<MaintenanceWindow>,
}

impl Policy {
    /// Load, schema-check and validate a policy file.
    pub fn load(path: &str) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("cannot read policy {path}"))?;
        let value: serde_json::Value =
            serde_json::from_str(&content).with_context(|| format!("{path}: invalid JSON"))?;
        crate::schema::validate_policy(&value).with_context(|| format!("{path}: schema"))?;
        let policy: Policy =
            serde_json::from_value(value).with_context(|| format!("{path}: invalid policy"))?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        let r = &self.risk;
        if !(r.moderate_from <= r.high_from && r.high_from <= r.critical_above) {
            return Err(PolicyError::Invalid(format!(
                "risk buckets must satisfy moderate_from <= high_from <= critical_above (got {}, {}, {})",
                r.moderate_from, r.high_from, r.critical_above
            )));
        }
        for (name, score) in [
            ("security_min", self.thresholds.security_min),
            ("compliance_min", self.thresholds.compliance_min),
        ] {
            if !(0.0..=100.0).contains(&score) {
                return Err(PolicyError::Invalid(format!(
                    "{name} must be within [0, 100], got {score}"
                )));
            }
        }
        if self.domains.is_empty() {
            return Err(PolicyError::InvalidCatalog("no domains declared".into()));
        }
        for env in Environment::ALL {
            if let Some(overrides) = self.environments.get(env) {
                if overrides.max_retries == Some(0) {
                    return Err(PolicyError::Invalid(format!(
                        "{env}: max_retries must be at least 1"
                    )));
                }
                if let Some(delay) = overrides.retry_delay_secs {
                    if !delay.is_finite() || delay < 0.0 {
                        return Err(PolicyError::Invalid(format!(
                            "{env}: retry_delay_secs must be a non-negative number"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn rollback_base(&self) -> Duration {
        Duration::from_secs(self.rollback_base_secs)
    }
}
