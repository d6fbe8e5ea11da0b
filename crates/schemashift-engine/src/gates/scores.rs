use schemashift_core::errors::GateFailure;
use schemashift_core::traits::{HealthReport, ScoreReport};

/// Pre-validation passes only on an overall-healthy report.
pub fn require_healthy(report: &HealthReport) -> Result<(), GateFailure> {
    if report.overall_healthy {
        return Ok(());
    }
    let mut issues = report.issues.clone();
    if issues.is_empty() {
        issues = report
            .dependencies
            .iter()
            .filter(|(_, healthy)| !**healthy)
            .map(|(dep, _)| format!("{dep} unhealthy"))
            .collect();
    }
    Err(GateFailure::Unhealthy { issues })
}

/// A scored check fails on a score below `minimum` or on its own `passed` flag.
pub fn enforce_minimum(
    check: &'static str,
    report: &ScoreReport,
    minimum: f64,
) -> Result<(), GateFailure> {
    if !report.score.is_finite() || report.score < minimum {
        return Err(GateFailure::ScoreBelowMinimum {
            check,
            score: report.score,
            minimum,
        });
    }
    if !report.passed {
        return Err(GateFailure::CheckFailed {
            check,
            issues: report.issues.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn score(passed: bool, score: f64) -> ScoreReport {
        ScoreReport {
            passed,
            score,
            issues: vec!["tls 1.0 enabled".into()],
        }
    }

    #[test]
    fn score_threshold_is_inclusive() {
        assert!(enforce_minimum("security", &score(true, 95.0), 95.0).is_ok());
        let err = enforce_minimum("security", &score(true, 94.9), 95.0).unwrap_err();
        assert!(matches!(err, GateFailure::ScoreBelowMinimum { .. }));
    }

    #[test]
    fn failed_flag_fails_even_with_high_score() {
        let err = enforce_minimum("compliance", &score(false, 99.5), 98.0).unwrap_err();
        assert!(err.to_string().contains("tls 1.0"));
    }

    #[test]
    fn nan_score_never_passes() {
        assert!(enforce_minimum("security", &score(true, f64::NAN), 95.0).is_err());
    }

    #[test]
    fn unhealthy_lists_dependencies_without_issues() {
        let report = HealthReport {
            overall_healthy: false,
            dependencies: BTreeMap::from([("db".into(), false), ("cache".into(), true)]),
            issues: vec![],
        };
        match require_healthy(&report).unwrap_err() {
            GateFailure::Unhealthy { issues } => assert_eq!(issues, ["db unhealthy"]),
            other => panic!("unexpected {other}"),
        }
    }
}
