use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use schemashift_core::backup::{ConfigArtifact, ContentObject, DomainBackupResult, TableBackupStats};
use schemashift_core::errors::CollaboratorError;
use schemashift_core::traits::{ArtifactManifest, BackupStore, CallResult};
use schemashift_core::types::Environment;
use serde_json::json;

use super::file::FileWorkspace;
use crate::state::atomic::write_json;

/// Writes backup manifests and recovery points as JSON files under one
/// directory. Locations are `file://` URIs.
pub struct DirectoryBackupStore {
    dir: PathBuf,
    workspace: Arc<FileWorkspace>,
    seq: AtomicU64,
}

impl DirectoryBackupStore {
    pub fn new(dir: impl Into<PathBuf>, workspace: Arc<FileWorkspace>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create backup directory {}", dir.display()))?;
        let dir = dir
            .canonicalize()
            .with_context(|| format!("cannot resolve {}", dir.display()))?;
        Ok(Self {
            dir,
            workspace,
            seq: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write(&self, env: Environment, kind: &str, value: &serde_json::Value) -> CallResult<String> {
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        let name = format!(
            "{}-{kind}-{}-{n}.json",
            env.as_str(),
            Utc::now().format("%Y%m%dT%H%M%S")
        );
        let path = self.dir.join(name);
        write_json(&path, value).map_err(|e| CollaboratorError::Failed(format!("{e:#}")))?;
        Ok(format!("file://{}", path.display()))
    }
}

impl BackupStore for DirectoryBackupStore {
    fn database_size(&self, _env: Environment) -> CallResult<u64> {
        Ok(self.workspace.snapshot()?.database_bytes)
    }

    fn store_full_backup(&self, env: Environment, byte_size: u64) -> CallResult<String> {
        let doc = self.workspace.snapshot()?;
        self.write(
            env,
            "full",
            &json!({
                "environment": env,
                "byte_size": byte_size,
                "workspace": doc,
            }),
        )
    }

    fn store_domain_manifest(
        &self,
        env: Environment,
        result: &DomainBackupResult,
        tables: &[TableBackupStats],
    ) -> CallResult<String> {
        self.write(
            env,
            &format!("table-{}", result.domain),
            &json!({
                "environment": env,
                "domain": result.domain,
                "record_count": result.record_count,
                "byte_size": result.byte_size,
                "tables": tables,
            }),
        )
    }

    fn content_inventory(&self, _env: Environment) -> CallResult<Vec<ContentObject>> {
        Ok(self.workspace.snapshot()?.content_objects)
    }

    fn config_artifacts(&self, _env: Environment) -> CallResult<Vec<ConfigArtifact>> {
        Ok(self.workspace.snapshot()?.config_artifacts)
    }

    fn store_artifact_manifest(
        &self,
        env: Environment,
        manifest: &ArtifactManifest,
    ) -> CallResult<String> {
        let kind = serde_json::to_value(manifest.kind)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "artifact".into());
        self.write(env, &kind, &json!(manifest))
    }

    fn create_recovery_point(&self, env: Environment, label: &str) -> CallResult<String> {
        let doc = self.workspace.snapshot()?;
        let versions: serde_json::Map<String, serde_json::Value> = doc
            .domains
            .iter()
            .map(|(d, s)| (d.clone(), json!(s.current_version)))
            .collect();
        self.write(
            env,
            "recovery",
            &json!({ "label": label, "versions": versions }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::document::{DomainState, WorkspaceDocument};

    #[test]
    fn manifests_land_in_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = WorkspaceDocument::default();
        doc.database_bytes = 2048;
        doc.domains.insert(
            "content".into(),
            DomainState {
                current_version: 4,
                ..DomainState::default()
            },
        );
        let ws = Arc::new(FileWorkspace::create(dir.path().join("w.json"), doc).unwrap());
        let store = DirectoryBackupStore::new(dir.path().join("backups"), ws).unwrap();
        let env = Environment::Staging;

        assert_eq!(store.database_size(env).unwrap(), 2048);
        let full = store.store_full_backup(env, 2048).unwrap();
        let rp = store.create_recovery_point(env, "post-migration").unwrap();
        assert!(full.starts_with("file://"));
        assert_ne!(full, rp);

        let path = rp.trim_start_matches("file://");
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(written["versions"]["content"], 4);
        assert_eq!(std::fs::read_dir(store.dir()).unwrap().count(), 2);
    }
}
