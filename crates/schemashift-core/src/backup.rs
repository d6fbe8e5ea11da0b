use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::BackupKind;

/// Per-domain table-level backup accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainBackupResult {
    pub domain: String,
    pub success: bool,
    /// Opaque reference from the storage collaborator.
    pub location: String,
    pub table_count: u32,
    pub record_count: u64,
    pub byte_size: u64,
    pub integrity_hash: String,
    /// Set by integrity validation: `success && record_count > 0`.
    pub validations_passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Row and size accounting for one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableBackupStats {
    pub table: String,
    pub records: u64,
    pub bytes: u64,
    /// False when the table has no soft-delete marker and all rows were counted.
    pub live_only: bool,
}

/// Full-database backup: size and location only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullBackupRecord {
    pub location: String,
    pub byte_size: u64,
    pub taken_at: DateTime<Utc>,
}

/// Binary content references or configuration artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactBackupRecord {
    pub kind: BackupKind,
    pub location: String,
    pub item_count: u64,
    pub byte_size: u64,
    pub integrity_hash: String,
}

/// A binary content object known to the storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentObject {
    pub key: String,
    pub bytes: u64,
}

/// A configuration artifact (secrets excluded) known to the storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigArtifact {
    pub name: String,
    pub bytes: u64,
}

/// Everything the backup stage produced for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full: Option<FullBackupRecord>,
    #[serde(default)]
    pub domains: Vec<DomainBackupResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ArtifactBackupRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<ArtifactBackupRecord>,
}

impl BackupReport {
    /// Domains whose backups failed integrity validation.
    pub fn invalid_domains(&self) -> Vec<String> {
        self.domains
            .iter()
            .filter(|d| !d.validations_passed)
            .map(|d| d.domain.clone())
            .collect()
    }

    /// All storage references produced, in stage order.
    pub fn locations(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(full) = &self.full {
            out.push(full.location.clone());
        }
        out.extend(self.domains.iter().map(|d| d.location.clone()));
        if let Some(content) = &self.content {
            out.push(content.location.clone());
        }
        if let Some(config) = &self.configuration {
            out.push(config.location.clone());
        }
        out
    }

    pub fn total_records(&self) -> u64 {
        self.domains.iter().map(|d| d.record_count).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.full.as_ref().map(|f| f.byte_size).unwrap_or(0)
            + self.domains.iter().map(|d| d.byte_size).sum::<u64>()
            + self.content.as_ref().map(|c| c.byte_size).unwrap_or(0)
            + self.configuration.as_ref().map(|c| c.byte_size).unwrap_or(0)
    }
}
