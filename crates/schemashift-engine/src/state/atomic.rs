use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Locks older than this are assumed to belong to a crashed run.
pub const STALE_AFTER: Duration = Duration::from_secs(2 * 60 * 60);

/// Write content atomically: write to temp file, fsync, rename.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let temp_path = dir.join(format!(".{}.tmp", temp_suffix()));

    let mut file = std::fs::File::create(&temp_path)
        .with_context(|| format!("cannot create temp file for {}", path.display()))?;
    file.write_all(content)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&temp_path, path)
        .with_context(|| format!("cannot rename temp to {}", path.display()))?;
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut json = serde_json::to_string_pretty(value)?;
    json.push('\n');
    atomic_write(path, json.as_bytes())
}

/// Advisory lock serializing pipeline runs against one workspace.
///
/// Creates `<target>.lock` holding the PID and acquisition timestamp.
pub struct AdvisoryLock {
    lock_path: PathBuf,
}

impl AdvisoryLock {
    pub fn acquire(target: &Path) -> Result<Self> {
        Self::acquire_with_stale(target, STALE_AFTER)
    }

    /// Acquire the lock, breaking it if its holder is older than `stale_after`.
    pub fn acquire_with_stale(target: &Path, stale_after: Duration) -> Result<Self> {
        let mut lock_path = target.as_os_str().to_owned();
        lock_path.push(".lock");
        let lock_path = PathBuf::from(lock_path);

        if lock_path.exists() {
            let content = std::fs::read_to_string(&lock_path).unwrap_or_default();
            let mut lines = content.lines();
            let holder = lines.next().unwrap_or("?").to_string();
            let taken = lines.next().and_then(|ts| ts.parse::<i64>().ok());
            let now = chrono::Utc::now().timestamp();
            match taken {
                Some(ts) if now - ts > stale_after.as_secs() as i64 => {
                    tracing::warn!(lock = %lock_path.display(), holder, "breaking stale lock");
                    let _ = std::fs::remove_file(&lock_path);
                }
                _ => bail!(
                    "{} is locked by process {holder} (lock: {})",
                    target.display(),
                    lock_path.display()
                ),
            }
        }

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .with_context(|| format!("cannot acquire lock {}", lock_path.display()))?;
        let pid = std::process::id();
        let ts = chrono::Utc::now().timestamp();
        file.write_all(format!("{pid}\n{ts}\n").as_bytes())
            .with_context(|| format!("cannot write lock {}", lock_path.display()))?;

        Ok(Self { lock_path })
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }

    pub fn release(self) -> Result<()> {
        if self.lock_path.exists() {
            std::fs::remove_file(&self.lock_path)
                .with_context(|| format!("cannot release lock {}", self.lock_path.display()))?;
        }
        Ok(())
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

fn temp_suffix() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{:x}-{nanos:x}", std::process::id())
}
