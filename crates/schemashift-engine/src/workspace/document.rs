use std::collections::BTreeMap;

use schemashift_core::backup::{ConfigArtifact, ContentObject};
use schemashift_core::traits::{ContinuityReport, HealthReport, ScoreReport};
use schemashift_core::types::DestructiveOp;
use serde::{Deserialize, Serialize};

/// On-disk state of one environment: schema versions per domain, the
/// migration catalog, and the reports the validators hand back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceDocument {
    #[serde(default)]
    pub domains: BTreeMap<String, DomainState>,
    #[serde(default = "healthy")]
    pub health: HealthReport,
    #[serde(default = "clean_score")]
    pub security: ScoreReport,
    #[serde(default = "clean_score")]
    pub compliance: ScoreReport,
    #[serde(default = "no_impact")]
    pub continuity: ContinuityReport,
    #[serde(default)]
    pub database_bytes: u64,
    #[serde(default)]
    pub content_objects: Vec<ContentObject>,
    #[serde(default)]
    pub config_artifacts: Vec<ConfigArtifact>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainState {
    #[serde(default)]
    pub current_version: u64,
    #[serde(default)]
    pub migrations: Vec<MigrationEntry>,
    #[serde(default)]
    pub tables: BTreeMap<String, TableState>,
}

/// One versioned migration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationEntry {
    pub version: u64,
    pub name: String,
    /// Destructive operations its rollback performs.
    #[serde(default)]
    pub down: Vec<DestructiveOp>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub fails_up: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub fails_down: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableState {
    pub rows: u64,
    /// Rows not soft-deleted. Absent when the table has no soft-delete marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_rows: Option<u64>,
    #[serde(default)]
    pub bytes: u64,
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn healthy() -> HealthReport {
    HealthReport {
        overall_healthy: true,
        dependencies: BTreeMap::new(),
        issues: vec![],
    }
}

fn clean_score() -> ScoreReport {
    ScoreReport {
        passed: true,
        score: 100.0,
        issues: vec![],
    }
}

fn no_impact() -> ContinuityReport {
    ContinuityReport {
        passed: true,
        impact_score: 0.0,
        issues: vec![],
    }
}

impl Default for WorkspaceDocument {
    fn default() -> Self {
        Self {
            domains: BTreeMap::new(),
            health: healthy(),
            security: clean_score(),
            compliance: clean_score(),
            continuity: no_impact(),
            database_bytes: 0,
            content_objects: vec![],
            config_artifacts: vec![],
        }
    }
}

impl DomainState {
    /// Highest catalogued version, or the current one if nothing is catalogued.
    pub fn latest_version(&self) -> u64 {
        self.migrations
            .iter()
            .map(|m| m.version)
            .max()
            .unwrap_or(self.current_version)
            .max(self.current_version)
    }

    pub fn pending(&self) -> impl Iterator<Item = &MigrationEntry> {
        self.migrations
            .iter()
            .filter(move |m| m.version > self.current_version)
    }

    /// Migrations undone when moving from `from` down to `to`, newest first.
    pub fn rollback_range(&self, from: u64, to: u64) -> Vec<&MigrationEntry> {
        let mut range: Vec<_> = self
            .migrations
            .iter()
            .filter(|m| m.version > to && m.version <= from)
            .collect();
        range.sort_by(|a, b| b.version.cmp(&a.version));
        range
    }

    /// Apply pending migrations in version order. Stops at the first broken
    /// one, leaving the domain at the last good version.
    pub fn migrate_up(&mut self) -> Result<u32, String> {
        let mut pending: Vec<(u64, String, bool)> = self
            .pending()
            .map(|m| (m.version, m.name.clone(), m.fails_up))
            .collect();
        pending.sort_by_key(|p| p.0);
        let mut applied = 0;
        for (version, name, fails) in pending {
            if fails {
                return Err(format!("migration {version} ({name}) failed"));
            }
            self.current_version = version;
            applied += 1;
        }
        Ok(applied)
    }

    /// Undo migrations down to `target`. Stops at the first broken one.
    pub fn migrate_down(&mut self, target: u64) -> Result<(), String> {
        if target > self.current_version {
            return Err(format!(
                "target {target} is above current version {}",
                self.current_version
            ));
        }
        let steps: Vec<(u64, String, bool)> = self
            .rollback_range(self.current_version, target)
            .into_iter()
            .map(|m| (m.version, m.name.clone(), m.fails_down))
            .collect();
        for (version, name, fails) in steps {
            if fails {
                return Err(format!("rollback of migration {version} ({name}) failed"));
            }
            self.current_version = self
                .migrations
                .iter()
                .map(|m| m.version)
                .filter(|v| *v < version)
                .max()
                .unwrap_or(0)
                .max(target);
        }
        self.current_version = target;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemashift_core::types::DestructiveOpKind;

    fn domain() -> DomainState {
        let entry = |version, name: &str| MigrationEntry {
            version,
            name: name.into(),
            down: vec![],
            fails_up: false,
            fails_down: false,
        };
        DomainState {
            current_version: 2,
            migrations: vec![
                entry(1, "init"),
                entry(2, "tags"),
                entry(3, "media"),
                entry(4, "subtitle"),
            ],
            tables: BTreeMap::new(),
        }
    }

    #[test]
    fn pending_and_latest() {
        let d = domain();
        assert_eq!(d.latest_version(), 4);
        assert_eq!(d.pending().count(), 2);
        assert_eq!(DomainState::default().latest_version(), 0);
    }

    #[test]
    fn broken_migration_stops_upgrade_at_last_good_version() {
        let mut d = domain();
        d.migrations[3].fails_up = true;
        let err = d.migrate_up().unwrap_err();
        assert!(err.contains("subtitle"));
        assert_eq!(d.current_version, 3);
    }

    #[test]
    fn rollback_range_is_newest_first() {
        let mut d = domain();
        d.migrations[2].down = vec![DestructiveOp {
            kind: DestructiveOpKind::DropTable,
            object: "media_assets".into(),
        }];
        let versions: Vec<u64> = d.rollback_range(4, 1).iter().map(|m| m.version).collect();
        assert_eq!(versions, [4, 3, 2]);
    }

    #[test]
    fn broken_down_migration_stops_rollback() {
        let mut d = domain();
        d.migrate_up().unwrap();
        d.migrations[2].fails_down = true;
        assert!(d.migrate_down(1).is_err());
        assert_eq!(d.current_version, 3);
        assert!(d.migrate_down(9).is_err());
    }

    #[test]
    fn missing_reports_default_to_clean() {
        let doc: WorkspaceDocument = serde_json::from_str("{}").unwrap();
        assert!(doc.health.overall_healthy);
        assert_eq!(doc.security.score, 100.0);
        assert!(doc.continuity.passed);
    }
}
