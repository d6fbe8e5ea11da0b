use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use schemashift_core::audit::AuditEntry;
use schemashift_core::errors::AuditError;
use schemashift_core::traits::AuditSink;
use sha2::{Digest, Sha256};

use crate::state::atomic::write_json;

const GENESIS: &str = "genesis";

fn line_hash(line: &str) -> String {
    format!("sha256:{:x}", Sha256::digest(line.as_bytes()))
}

fn last_line(content: &str) -> Option<&str> {
    content.lines().rev().find(|line| !line.trim().is_empty())
}

/// JSONL audit log with a SHA-256 hash chain.
///
/// Each line carries `prev_hash`, the hash of the previous raw line, with
/// `"genesis"` for the first. Lines are appended and never rewritten.
pub struct FileAuditSink {
    path: PathBuf,
    head: String,
}

impl FileAuditSink {
    /// Open (or create on first append) the log at `path`, resuming its chain.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let head = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("cannot read audit {}", path.display()))?;
            last_line(&content)
                .map(line_hash)
                .unwrap_or_else(|| GENESIS.to_string())
        } else {
            GENESIS.to_string()
        };
        Ok(Self { path, head })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hash of the last written line.
    pub fn head(&self) -> &str {
        &self.head
    }

    fn write_line(&mut self, entry: &AuditEntry) -> Result<(), AuditError> {
        let mut value =
            serde_json::to_value(entry).map_err(|e| AuditError::WriteFailure(e.to_string()))?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "prev_hash".into(),
                serde_json::Value::String(self.head.clone()),
            );
        }
        let line = serde_json::to_string(&value).map_err(|e| AuditError::WriteFailure(e.to_string()))?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| AuditError::WriteFailure(format!("{}: {e}", self.path.display())))?;
        writeln!(file, "{line}")
            .and_then(|_| file.sync_data())
            .map_err(|e| AuditError::WriteFailure(format!("{}: {e}", self.path.display())))?;

        self.head = line_hash(&line);
        Ok(())
    }
}

impl AuditSink for FileAuditSink {
    fn append(&mut self, entry: &AuditEntry) -> Result<(), AuditError> {
        self.write_line(entry)
    }
}

/// Verify the hash chain of an audit log. Returns the number of entries.
pub fn verify_chain(path: &Path) -> Result<u64> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read audit {}", path.display()))?;

    let mut count = 0u64;
    let mut prev_hash = GENESIS.to_string();
    for (i, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: serde_json::Value = serde_json::from_str(line)
            .with_context(|| format!("invalid JSON at line {}", i + 1))?;
        let entry_prev = entry
            .get("prev_hash")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(GENESIS);
        if entry_prev != prev_hash {
            return Err(AuditError::ChainCorruption(count)).with_context(|| {
                format!("expected prev_hash '{prev_hash}', got '{entry_prev}'")
            });
        }
        prev_hash = line_hash(line);
        count += 1;
    }
    Ok(count)
}

/// Record the chain head and entry count so later tampering with the prefix
/// is detectable even if the chain is rebuilt.
pub fn create_checkpoint(audit_path: &Path, checkpoint_path: &Path) -> Result<serde_json::Value> {
    let count = verify_chain(audit_path)?;
    let content = std::fs::read_to_string(audit_path)
        .with_context(|| format!("cannot read audit {}", audit_path.display()))?;
    let chain_head = last_line(&content)
        .map(line_hash)
        .unwrap_or_else(|| GENESIS.to_string());

    let checkpoint = serde_json::json!({
        "audit_file": audit_path.display().to_string(),
        "entries": count,
        "chain_head": chain_head,
        "created_at": chrono::Utc::now().to_rfc3339(),
    });
    write_json(checkpoint_path, &checkpoint)
        .with_context(|| format!("cannot write checkpoint {}", checkpoint_path.display()))?;
    Ok(checkpoint)
}

/// True if the first `entries` lines of the log still hash to the checkpoint head.
pub fn verify_checkpoint(audit_path: &Path, checkpoint_path: &Path) -> Result<bool> {
    let raw = std::fs::read_to_string(checkpoint_path)
        .with_context(|| format!("cannot read checkpoint {}", checkpoint_path.display()))?;
    let checkpoint: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("{}: invalid checkpoint JSON", checkpoint_path.display()))?;
    let expected_count = checkpoint
        .get("entries")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0);
    let expected_head = checkpoint
        .get("chain_head")
        .and_then(serde_json::Value::as_str)
        .unwrap_or(GENESIS);

    let content = std::fs::read_to_string(audit_path)
        .with_context(|| format!("cannot read audit {}", audit_path.display()))?;

    let mut count = 0u64;
    let mut prev_hash = GENESIS.to_string();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        if count >= expected_count {
            break;
        }
        let entry: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => return Ok(false),
        };
        let entry_prev = entry
            .get("prev_hash")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(GENESIS);
        if entry_prev != prev_hash {
            return Ok(false);
        }
        prev_hash = line_hash(line);
        count += 1;
    }
    Ok(count == expected_count && prev_hash == expected_head)
}
