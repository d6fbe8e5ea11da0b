use anyhow::{bail, Context, Result};
use jsonschema::Validator;
use serde_json::Value;

const POLICY_SCHEMA: &str = include_str!("../schema/policy.schema.json");

/// Compile the embedded policy schema.
pub fn policy_validator() -> Result<Validator> {
    let schema: Value =
        serde_json::from_str(POLICY_SCHEMA).context("embedded schema is invalid JSON")?;
    Validator::new(&schema).map_err(|e| anyhow::anyhow!("schema compilation failed: {e}"))
}

/// Schema violations as `location: message` lines. Empty when valid.
pub fn policy_issues(data: &Value) -> Result<Vec<String>> {
    let v = policy_validator()?;
    Ok(v.iter_errors(data)
        .map(|error| {
            let path = error.instance_path.to_string();
            let loc = if path.is_empty() {
                "(root)".into()
            } else {
                path
            };
            format!("{loc}: {error}")
        })
        .collect())
}

/// Validate a policy value against the embedded schema.
pub fn validate_policy(data: &Value) -> Result<()> {
    let issues = policy_issues(data)?;
    if issues.is_empty() {
        return Ok(());
    }
    bail!("validation failed:\n  {}", issues.join("\n  "));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_policy_is_valid() {
        validate_policy(&json!({})).unwrap();
    }

    #[test]
    fn full_policy_is_valid() {
        let policy = json!({
            "thresholds": { "security_min": 95.0, "compliance_min": 98.0 },
            "risk": { "critical_above": 10, "high_from": 6, "moderate_from": 3 },
            "timeouts": { "call_secs": 30, "approval_secs": 600 },
            "rollback_base_secs": 300,
            "domains": [
                { "name": "content", "tables": ["articles"] },
                { "name": "services", "depends_on": ["content"] }
            ],
            "environments": {
                "production": {
                    "max_retries": 2,
                    "retry_delay_secs": 30,
                    "maintenance_window": {
                        "start": "02:00:00", "end": "04:00:00",
                        "timezone": "+00:00", "override_allowed": false
                    }
                }
            }
        });
        validate_policy(&policy).unwrap();
    }

    #[test]
    fn unknown_keys_are_reported_with_location() {
        let issues = policy_issues(&json!({ "environments": { "qa": {} } })).unwrap();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].starts_with("/environments"));
    }

    #[test]
    fn malformed_time_is_rejected() {
        let policy = json!({
            "environments": { "staging": {
                "maintenance_window": { "start": "2am", "end": "04:00:00" }
            } }
        });
        assert!(validate_policy(&policy).is_err());
    }
}
