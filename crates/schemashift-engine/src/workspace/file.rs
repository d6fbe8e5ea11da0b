use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use schemashift_core::errors::CollaboratorError;
use schemashift_core::traits::{
    CallResult, ComplianceManager, ContinuityReport, DomainMigrator, EnvironmentValidator,
    HealthReport, SchemaVersionRepository, ScoreReport, SecurityValidator, TableInspector,
};
use schemashift_core::types::{DestructiveOp, Environment};
use tracing::debug;

use super::document::{DomainState, TableState, WorkspaceDocument};
use crate::state::atomic::write_json;

/// JSON workspace file standing in for one environment's database.
///
/// Every mutation is written back atomically before the call returns.
pub struct FileWorkspace {
    path: PathBuf,
    doc: Mutex<WorkspaceDocument>,
}

impl FileWorkspace {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read workspace {}", path.display()))?;
        let doc: WorkspaceDocument = serde_json::from_str(&content)
            .with_context(|| format!("invalid workspace {}", path.display()))?;
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    /// Write a fresh document to `path` and open it.
    pub fn create(path: impl Into<PathBuf>, doc: WorkspaceDocument) -> Result<Self> {
        let path = path.into();
        write_json(&path, &doc)?;
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> CallResult<WorkspaceDocument> {
        Ok(self.lock()?.clone())
    }

    fn lock(&self) -> CallResult<MutexGuard<'_, WorkspaceDocument>> {
        self.doc
            .lock()
            .map_err(|_| CollaboratorError::Unavailable("workspace lock poisoned".into()))
    }

    fn domain<'a>(doc: &'a WorkspaceDocument, domain: &str) -> CallResult<&'a DomainState> {
        doc.domains
            .get(domain)
            .ok_or_else(|| CollaboratorError::Failed(format!("workspace has no domain {domain}")))
    }

    fn table(&self, table: &str) -> CallResult<TableState> {
        let doc = self.lock()?;
        doc.domains
            .values()
            .find_map(|d| d.tables.get(table).copied())
            .ok_or_else(|| CollaboratorError::Failed(format!("unknown table {table}")))
    }

    /// Apply `f` to the domain and persist. The document is only replaced
    /// once the write succeeds.
    fn mutate<T>(
        &self,
        domain: &str,
        f: impl FnOnce(&mut DomainState) -> Result<T, String>,
    ) -> CallResult<T> {
        let mut doc = self.lock()?;
        let mut next = doc.clone();
        let state = next
            .domains
            .get_mut(domain)
            .ok_or_else(|| CollaboratorError::Failed(format!("workspace has no domain {domain}")))?;
        let outcome = f(state);
        write_json(&self.path, &next)
            .map_err(|e| CollaboratorError::Failed(format!("{e:#}")))?;
        *doc = next;
        outcome.map_err(|e| CollaboratorError::Failed(format!("{domain}: {e}")))
    }
}

impl DomainMigrator for FileWorkspace {
    fn pending_count(&self, domain: &str, _env: Environment) -> CallResult<u32> {
        let doc = self.lock()?;
        Ok(Self::domain(&doc, domain)?.pending().count() as u32)
    }

    fn execute_domain_migrations(&self, domain: &str, env: Environment) -> CallResult<()> {
        let applied = self.mutate(domain, DomainState::migrate_up)?;
        debug!(domain, environment = %env, applied, "workspace migrated");
        Ok(())
    }

    fn apply_target_version(&self, domain: &str, env: Environment, version: u64) -> CallResult<()> {
        self.mutate(domain, |d| d.migrate_down(version))?;
        debug!(domain, environment = %env, version, "workspace rolled back");
        Ok(())
    }
}

impl SchemaVersionRepository for FileWorkspace {
    fn current_version(&self, domain: &str, _env: Environment) -> CallResult<u64> {
        let doc = self.lock()?;
        Ok(Self::domain(&doc, domain)?.current_version)
    }

    fn latest_version(&self, domain: &str, _env: Environment) -> CallResult<u64> {
        let doc = self.lock()?;
        Ok(Self::domain(&doc, domain)?.latest_version())
    }

    fn destructive_operations(
        &self,
        domain: &str,
        _env: Environment,
        from: u64,
        to: u64,
    ) -> CallResult<Vec<DestructiveOp>> {
        let doc = self.lock()?;
        Ok(Self::domain(&doc, domain)?
            .rollback_range(from, to)
            .into_iter()
            .flat_map(|m| m.down.iter().cloned())
            .collect())
    }
}

impl EnvironmentValidator for FileWorkspace {
    fn validate_environment(&self, _env: Environment) -> CallResult<HealthReport> {
        Ok(self.lock()?.health.clone())
    }
}

impl SecurityValidator for FileWorkspace {
    fn assess_security(&self, _env: Environment) -> CallResult<ScoreReport> {
        Ok(self.lock()?.security.clone())
    }
}

impl ComplianceManager for FileWorkspace {
    fn assess_compliance(&self, _env: Environment) -> CallResult<ScoreReport> {
        Ok(self.lock()?.compliance.clone())
    }

    fn assess_business_continuity(&self, _env: Environment) -> CallResult<ContinuityReport> {
        Ok(self.lock()?.continuity.clone())
    }
}

impl TableInspector for FileWorkspace {
    fn count_live_rows(&self, _env: Environment, table: &str) -> CallResult<Option<u64>> {
        Ok(self.table(table)?.live_rows)
    }

    fn count_rows(&self, _env: Environment, table: &str) -> CallResult<u64> {
        Ok(self.table(table)?.rows)
    }

    fn table_size(&self, _env: Environment, table: &str) -> CallResult<u64> {
        Ok(self.table(table)?.bytes)
    }
}
