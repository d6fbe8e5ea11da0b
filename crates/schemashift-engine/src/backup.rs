use std::sync::Arc;

use schemashift_core::audit::AuditDetail;
use schemashift_core::backup::{
    ArtifactBackupRecord, BackupReport, DomainBackupResult, FullBackupRecord, TableBackupStats,
};
use schemashift_core::domains::{DomainCatalog, DomainSpec};
use schemashift_core::errors::{BackupError, CollaboratorError, GateFailure};
use schemashift_core::strategy::MigrationStrategy;
use schemashift_core::traits::{ArtifactManifest, BackupStore, CallResult, Clock, TableInspector};
use schemashift_core::types::{AuditOutcome, BackupKind, Environment, GateKind};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::audit::RunLog;
use crate::collaborators::Collaborators;
use crate::context::ExecutionContext;
use crate::gates::ApprovalGate;

/// What the backup stage produced.
#[derive(Debug, Clone, Default)]
pub struct BackupOutcome {
    pub report: BackupReport,
    pub warnings: Vec<String>,
}

/// Backup accounting ahead of a migration.
///
/// Byte transfer belongs to the storage collaborator. This type only counts,
/// sizes and fingerprints, then hands manifests to storage and keeps the
/// returned location references.
pub struct BackupCoordinator {
    backups: Arc<dyn BackupStore>,
    tables: Arc<dyn TableInspector>,
    clock: Arc<dyn Clock>,
    gate: ApprovalGate,
    catalog: DomainCatalog,
    actor: String,
}

impl BackupCoordinator {
    pub fn new(collaborators: &Collaborators, catalog: DomainCatalog, actor: &str) -> Self {
        Self {
            backups: Arc::clone(&collaborators.backups),
            tables: Arc::clone(&collaborators.tables),
            clock: Arc::clone(&collaborators.clock),
            gate: ApprovalGate::new(
                Arc::clone(&collaborators.approvals),
                Arc::clone(&collaborators.clock),
            ),
            catalog,
            actor: actor.to_string(),
        }
    }

    /// Run every backup kind in the strategy's scope.
    ///
    /// Confirmation (when required) happens first; a refusal or timeout stops
    /// the stage before anything is stored.
    pub fn run(
        &self,
        ctx: &ExecutionContext,
        strategy: &MigrationStrategy,
        log: &mut RunLog<'_>,
    ) -> Result<BackupOutcome, BackupError> {
        let env = strategy.environment;
        let scope = strategy.backup_scope;
        let mut outcome = BackupOutcome::default();

        if strategy.confirm_backup {
            self.confirm(ctx, env, strategy, log)?;
        }

        if scope.full_database {
            match self.backup_full(ctx, env) {
                Ok(full) => {
                    log.success(
                        "backup.full_database",
                        env.as_str(),
                        AuditDetail::Backup {
                            backup: BackupKind::FullDatabase,
                            location: Some(full.location.clone()),
                            records: 0,
                            bytes: full.byte_size,
                            error: None,
                        },
                    );
                    outcome.report.full = Some(full);
                }
                Err(e) => {
                    log.failure(
                        "backup.full_database",
                        env.as_str(),
                        failed_detail(BackupKind::FullDatabase, &e),
                    );
                    return Err(e);
                }
            }
        }

        if scope.table_level {
            for spec in self.catalog.domains() {
                let result = self.backup_domain(ctx, env, spec);
                let detail = AuditDetail::Backup {
                    backup: BackupKind::TableLevel,
                    location: Some(result.location.clone()).filter(|l| !l.is_empty()),
                    records: result.record_count,
                    bytes: result.byte_size,
                    error: result.error.clone(),
                };
                if !result.success {
                    log.failure("backup.table_level", &spec.name, detail);
                    return Err(BackupError::Domain {
                        domain: spec.name.clone(),
                        reason: result.error.unwrap_or_else(|| "unknown failure".into()),
                    });
                }
                log.success("backup.table_level", &spec.name, detail);
                outcome.report.domains.push(result);
            }
        }

        for (enabled, kind) in [
            (scope.content, BackupKind::Content),
            (scope.configuration, BackupKind::Configuration),
        ] {
            if !enabled {
                continue;
            }
            let event = match kind {
                BackupKind::Content => "backup.content",
                _ => "backup.configuration",
            };
            match self.backup_artifacts(ctx, env, kind) {
                Ok(record) => {
                    log.success(
                        event,
                        env.as_str(),
                        AuditDetail::Backup {
                            backup: kind,
                            location: Some(record.location.clone()),
                            records: record.item_count,
                            bytes: record.byte_size,
                            error: None,
                        },
                    );
                    match kind {
                        BackupKind::Content => outcome.report.content = Some(record),
                        _ => outcome.report.configuration = Some(record),
                    }
                }
                Err(e) => {
                    log.failure(event, env.as_str(), failed_detail(kind, &e));
                    return Err(e);
                }
            }
        }

        let invalid = outcome.report.invalid_domains();
        if !invalid.is_empty() {
            let issues: Vec<String> = invalid
                .iter()
                .map(|d| format!("{d}: backup holds no records"))
                .collect();
            log.record(
                "backup.integrity",
                env.as_str(),
                if strategy.strict_backup_integrity {
                    AuditOutcome::Failure
                } else {
                    AuditOutcome::Success
                },
                AuditDetail::Gate {
                    gate: GateKind::Backup,
                    score: None,
                    minimum: None,
                    issues: issues.clone(),
                },
            );
            if strategy.strict_backup_integrity {
                return Err(BackupError::Integrity(invalid));
            }
            warn!(environment = %env, domains = ?invalid, "backup integrity warnings");
            outcome
                .warnings
                .extend(issues.into_iter().map(|i| format!("backup integrity: {i}")));
        }

        info!(
            environment = %env,
            locations = outcome.report.locations().len(),
            bytes = outcome.report.total_bytes(),
            "backup stage complete"
        );
        Ok(outcome)
    }

    fn confirm(
        &self,
        ctx: &ExecutionContext,
        env: Environment,
        strategy: &MigrationStrategy,
        log: &mut RunLog<'_>,
    ) -> Result<(), BackupError> {
        let scope = strategy.backup_scope;
        let mut kinds = Vec::new();
        if scope.full_database {
            kinds.push("full database");
        }
        if scope.table_level {
            kinds.push("table-level");
        }
        if scope.content {
            kinds.push("content");
        }
        if scope.configuration {
            kinds.push("configuration");
        }
        let summary = format!("confirm {} backup of {env}", kinds.join(", "));
        let decision = match self
            .gate
            .request_backup_confirmation(ctx, env, summary, &self.actor)
        {
            Ok(decision) => decision,
            Err(e) => {
                log.failure(
                    "backup.confirmation",
                    env.as_str(),
                    AuditDetail::Gate {
                        gate: GateKind::Backup,
                        score: None,
                        minimum: None,
                        issues: vec![e.to_string()],
                    },
                );
                return Err(BackupError::Confirmation(GateFailure::Collaborator(e)));
            }
        };
        let outcome = if decision.is_granted() {
            AuditOutcome::Success
        } else {
            AuditOutcome::Failure
        };
        log.record(
            "backup.confirmation",
            env.as_str(),
            outcome,
            decision.audit_detail(),
        );
        decision.require_granted().map_err(BackupError::Confirmation)
    }

    /// Record the full-database backup: size plus storage reference.
    pub fn backup_full(
        &self,
        ctx: &ExecutionContext,
        env: Environment,
    ) -> Result<FullBackupRecord, BackupError> {
        let store = Arc::clone(&self.backups);
        let byte_size = ctx.call("database size", move || store.database_size(env))?;
        let store = Arc::clone(&self.backups);
        let location = ctx.call("store full backup", move || {
            store.store_full_backup(env, byte_size)
        })?;
        Ok(FullBackupRecord {
            location,
            byte_size,
            taken_at: self.clock.now(),
        })
    }

    /// Table-level accounting for one domain. Never returns an error: failures
    /// are carried in the result so the caller can audit them.
    pub fn backup_domain(
        &self,
        ctx: &ExecutionContext,
        env: Environment,
        spec: &DomainSpec,
    ) -> DomainBackupResult {
        let mut result = DomainBackupResult {
            domain: spec.name.clone(),
            success: false,
            location: String::new(),
            table_count: 0,
            record_count: 0,
            byte_size: 0,
            integrity_hash: String::new(),
            validations_passed: false,
            error: None,
        };

        let stats = match self.table_stats(ctx, env, &spec.tables) {
            Ok(stats) => stats,
            Err(e) => {
                result.error = Some(e.to_string());
                return result;
            }
        };
        result.table_count = stats.len() as u32;
        result.record_count = stats.iter().map(|t| t.records).sum();
        result.byte_size = stats.iter().map(|t| t.bytes).sum();
        result.success = true;
        validate_integrity(std::slice::from_mut(&mut result));

        let store = Arc::clone(&self.backups);
        let manifest = result.clone();
        match ctx.call("store domain manifest", move || {
            store.store_domain_manifest(env, &manifest, &stats)
        }) {
            Ok(location) => result.location = location,
            Err(e) => {
                result.success = false;
                result.validations_passed = false;
                result.error = Some(e.to_string());
            }
        }
        result
    }

    fn table_stats(
        &self,
        ctx: &ExecutionContext,
        env: Environment,
        tables: &[String],
    ) -> CallResult<Vec<TableBackupStats>> {
        let mut stats = Vec::with_capacity(tables.len());
        for table in tables {
            let inspector = Arc::clone(&self.tables);
            let t = table.clone();
            let live = ctx.call("count live rows", move || inspector.count_live_rows(env, &t))?;
            let (records, live_only) = match live {
                Some(n) => (n, true),
                None => {
                    let inspector = Arc::clone(&self.tables);
                    let t = table.clone();
                    (ctx.call("count rows", move || inspector.count_rows(env, &t))?, false)
                }
            };
            let inspector = Arc::clone(&self.tables);
            let t = table.clone();
            let bytes = ctx.call("table size", move || inspector.table_size(env, &t))?;
            stats.push(TableBackupStats {
                table: table.clone(),
                records,
                bytes,
                live_only,
            });
        }
        Ok(stats)
    }

    /// Content or configuration accounting.
    pub fn backup_artifacts(
        &self,
        ctx: &ExecutionContext,
        env: Environment,
        kind: BackupKind,
    ) -> Result<ArtifactBackupRecord, BackupError> {
        let store = Arc::clone(&self.backups);
        let mut items: Vec<(String, u64)> = match kind {
            BackupKind::Content => ctx
                .call("content inventory", move || store.content_inventory(env))?
                .into_iter()
                .map(|o| (o.key, o.bytes))
                .collect(),
            BackupKind::Configuration => ctx
                .call("config artifacts", move || store.config_artifacts(env))?
                .into_iter()
                .map(|a| (a.name, a.bytes))
                .collect(),
            other => {
                return Err(BackupError::Collaborator(CollaboratorError::Failed(format!(
                    "{other:?} is not an artifact backup"
                ))))
            }
        };
        items.sort();

        let mut hasher = Sha256::new();
        for (name, bytes) in &items {
            hasher.update(format!("{name}:{bytes}\n").as_bytes());
        }
        let manifest = ArtifactManifest {
            kind,
            item_count: items.len() as u64,
            byte_size: items.iter().map(|(_, b)| b).sum(),
            integrity_hash: format!("sha256:{:x}", hasher.finalize()),
        };

        let store = Arc::clone(&self.backups);
        let stored = manifest.clone();
        let location = ctx.call("store artifact manifest", move || {
            store.store_artifact_manifest(env, &stored)
        })?;
        Ok(ArtifactBackupRecord {
            kind,
            location,
            item_count: manifest.item_count,
            byte_size: manifest.byte_size,
            integrity_hash: manifest.integrity_hash,
        })
    }
}

/// Assign each result its integrity marker and validity flag.
///
/// A result is valid only if it succeeded and holds at least one record; an
/// empty successful backup is flagged invalid.
pub fn validate_integrity(results: &mut [DomainBackupResult]) {
    for r in results {
        let marker = format!(
            "{}|{}|{}|{}|{}",
            r.domain, r.success, r.table_count, r.record_count, r.byte_size
        );
        r.integrity_hash = format!("sha256:{:x}", Sha256::digest(marker.as_bytes()));
        r.validations_passed = r.success && r.record_count > 0;
    }
}

fn failed_detail(kind: BackupKind, error: &BackupError) -> AuditDetail {
    AuditDetail::Backup {
        backup: kind,
        location: None,
        records: 0,
        bytes: 0,
        error: Some(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditTrailRecorder;
    use crate::strategy::StrategyProvider;
    use crate::testing::World;
    use schemashift_core::policy::Policy;
    use schemashift_core::strategy::BackupScope;
    use std::time::Duration;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(Duration::from_secs(5), Duration::from_secs(5))
    }

    fn strategy(env: Environment) -> MigrationStrategy {
        StrategyProvider::new(&Policy::default())
            .for_environment(env)
            .unwrap()
    }

    #[test]
    fn empty_successful_domain_is_invalid() {
        let mut results = vec![
            DomainBackupResult {
                domain: "content".into(),
                success: true,
                location: "mem://content".into(),
                table_count: 4,
                record_count: 0,
                byte_size: 0,
                integrity_hash: String::new(),
                validations_passed: true,
                error: None,
            },
            DomainBackupResult {
                domain: "services".into(),
                success: true,
                location: "mem://services".into(),
                table_count: 3,
                record_count: 12,
                byte_size: 4096,
                integrity_hash: String::new(),
                validations_passed: false,
                error: None,
            },
        ];
        validate_integrity(&mut results);
        assert!(results[0].success);
        assert!(!results[0].validations_passed);
        assert!(results[1].validations_passed);
        assert!(results[0].integrity_hash.starts_with("sha256:"));
        assert_ne!(results[0].integrity_hash, results[1].integrity_hash);
    }

    #[test]
    fn live_rows_preferred_with_unfiltered_fallback() {
        let world = World::new(Environment::Staging);
        world.set_table("articles", 10, Some(7), 1000);
        world.set_table("tags", 5, None, 100);
        let coordinator = BackupCoordinator::new(&world.collaborators(), Policy::default().domains, "t");
        let spec = Policy::default().domains.get("content").unwrap().clone();
        let result = coordinator.backup_domain(&ctx(), Environment::Staging, &spec);
        assert!(result.success);
        assert_eq!(result.table_count, 4);
        assert_eq!(result.record_count, 7 + 5);
        assert!(result.location.starts_with("mem://"));
        let stats = world.stored_table_stats("content");
        assert!(stats.iter().any(|t| t.table == "tags" && !t.live_only));
        assert!(stats.iter().any(|t| t.table == "articles" && t.live_only));
    }

    #[test]
    fn first_domain_failure_aborts_stage() {
        let world = World::new(Environment::Staging);
        world.seed_tables(5);
        world.fail_table("articles");
        let coordinator = BackupCoordinator::new(&world.collaborators(), Policy::default().domains, "t");
        let mut recorder = AuditTrailRecorder::new("t");
        let mut log = RunLog::begin(&mut recorder, "mig");
        let err = coordinator
            .run(&ctx(), &strategy(Environment::Staging), &mut log)
            .unwrap_err();
        assert!(matches!(err, BackupError::Domain { ref domain, .. } if domain == "content"));
        // services was never inspected
        assert!(world.stored_table_stats("services").is_empty());
    }

    #[test]
    fn strict_integrity_fails_production_only() {
        let world = World::new(Environment::Production);
        world.seed_tables(0);
        let coordinator = BackupCoordinator::new(&world.collaborators(), Policy::default().domains, "t");
        let mut recorder = AuditTrailRecorder::new("t");
        let mut log = RunLog::begin(&mut recorder, "mig");
        let err = coordinator
            .run(&ctx(), &strategy(Environment::Production), &mut log)
            .unwrap_err();
        assert!(matches!(err, BackupError::Integrity(ref d) if d.len() == 2));

        let mut lenient = strategy(Environment::Production);
        lenient.strict_backup_integrity = false;
        let outcome = coordinator.run(&ctx(), &lenient, &mut log).unwrap();
        assert_eq!(outcome.warnings.len(), 2);
        assert!(outcome.report.full.is_some());
        assert!(outcome.report.content.is_some());
    }

    #[test]
    fn refused_confirmation_stores_nothing() {
        let world = World::new(Environment::Production);
        world.seed_tables(5);
        world.deny_approvals("backup freeze");
        let coordinator = BackupCoordinator::new(&world.collaborators(), Policy::default().domains, "t");
        let mut recorder = AuditTrailRecorder::new("t");
        let mut log = RunLog::begin(&mut recorder, "mig");
        let err = coordinator
            .run(&ctx(), &strategy(Environment::Production), &mut log)
            .unwrap_err();
        assert!(matches!(err, BackupError::Confirmation(GateFailure::Denied { .. })));
        assert_eq!(world.stored_manifest_count(), 0);
    }

    #[test]
    fn scope_limits_backup_kinds() {
        let world = World::new(Environment::Staging);
        world.seed_tables(5);
        let coordinator = BackupCoordinator::new(&world.collaborators(), Policy::default().domains, "t");
        let mut s = strategy(Environment::Staging);
        s.backup_scope = BackupScope {
            configuration: true,
            ..BackupScope::none()
        };
        let mut recorder = AuditTrailRecorder::new("t");
        let mut log = RunLog::begin(&mut recorder, "mig");
        let outcome = coordinator.run(&ctx(), &s, &mut log).unwrap();
        assert!(outcome.report.domains.is_empty());
        assert!(outcome.report.full.is_none());
        let config = outcome.report.configuration.unwrap();
        assert_eq!(config.kind, BackupKind::Configuration);
        assert!(config.integrity_hash.starts_with("sha256:"));
    }
}
