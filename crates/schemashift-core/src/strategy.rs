use std::fmt;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::PolicyError;
use crate::types::{duration_secs, Environment};

/// Time-of-day range in which disruptive operations are permitted.
///
/// Windows never wrap midnight: `start < end` is enforced on construction
/// and on deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawWindow", into = "RawWindow")]
pub struct MaintenanceWindow {
    start: NaiveTime,
    end: NaiveTime,
    timezone: String,
    offset: FixedOffset,
    override_allowed: bool,
    notification_lead: Duration,
}

#[derive(Serialize, Deserialize)]
struct RawWindow {
    start: NaiveTime,
    end: NaiveTime,
    #[serde(default = "default_timezone")]
    timezone: String,
    #[serde(default)]
    override_allowed: bool,
    #[serde(default)]
    notification_lead_secs: u64,
}

fn default_timezone() -> String {
    "+00:00".to_string()
}

impl MaintenanceWindow {
    pub fn new(
        start: NaiveTime,
        end: NaiveTime,
        timezone: &str,
        override_allowed: bool,
        notification_lead: Duration,
    ) -> Result<Self, PolicyError> {
        if start >= end {
            return Err(PolicyError::InvalidWindow(format!(
                "start {start} must be before end {end}"
            )));
        }
        let offset = parse_offset(timezone)?;
        Ok(Self {
            start,
            end,
            timezone: timezone.to_string(),
            offset,
            override_allowed,
            notification_lead,
        })
    }

    pub fn start(&self) -> NaiveTime {
        self.start
    }

    pub fn end(&self) -> NaiveTime {
        self.end
    }

    pub fn timezone(&self) -> &str {
        &self.timezone
    }

    pub fn override_allowed(&self) -> bool {
        self.override_allowed
    }

    pub fn notification_lead(&self) -> Duration {
        self.notification_lead
    }

    /// Local time-of-day of `now` in the window's timezone.
    pub fn local_time(&self, now: DateTime<Utc>) -> NaiveTime {
        now.with_timezone(&self.offset).time()
    }

    /// True if `now` falls in `[start, end)` in the window's timezone.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let local = self.local_time(now);
        local >= self.start && local < self.end
    }

    /// True if the window opens within the notification lead of `now`.
    pub fn opens_soon(&self, now: DateTime<Utc>) -> bool {
        let local = self.local_time(now);
        if local >= self.start {
            return false;
        }
        let until_start = (self.start - local).to_std().unwrap_or_default();
        until_start <= self.notification_lead
    }
}

impl fmt::Display for MaintenanceWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{} {}",
            self.start.format("%H:%M"),
            self.end.format("%H:%M"),
            self.timezone
        )
    }
}

impl TryFrom<RawWindow> for MaintenanceWindow {
    type Error = PolicyError;

    fn try_from(raw: RawWindow) -> Result<Self, Self::Error> {
        MaintenanceWindow::new(
            raw.start,
            raw.end,
            &raw.timezone,
            raw.override_allowed,
            Duration::from_secs(raw.notification_lead_secs),
        )
    }
}

impl From<MaintenanceWindow> for RawWindow {
    fn from(w: MaintenanceWindow) -> Self {
        RawWindow {
            start: w.start,
            end: w.end,
            timezone: w.timezone,
            override_allowed: w.override_allowed,
            notification_lead_secs: w.notification_lead.as_secs(),
        }
    }
}

/// Parse `Z`, `UTC`, or `±HH:MM` into a fixed offset.
fn parse_offset(tz: &str) -> Result<FixedOffset, PolicyError> {
    let tz = tz.trim();
    if tz.eq_ignore_ascii_case("utc") || tz == "Z" {
        return FixedOffset::east_opt(0)
            .ok_or_else(|| PolicyError::InvalidWindow("bad offset".into()));
    }
    let invalid = || PolicyError::InvalidWindow(format!("timezone '{tz}' is not ±HH:MM"));
    let (sign, rest) = match tz.as_bytes().first() {
        Some(b'+') => (1, &tz[1..]),
        Some(b'-') => (-1, &tz[1..]),
        _ => return Err(invalid()),
    };
    let (h, m) = rest.split_once(':').ok_or_else(invalid)?;
    let hours: i32 = h.parse().map_err(|_| invalid())?;
    let minutes: i32 = m.parse().map_err(|_| invalid())?;
    if hours > 14 || minutes > 59 {
        return Err(invalid());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

/// Which backup kinds run before migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupScope {
    pub full_database: bool,
    pub table_level: bool,
    pub content: bool,
    pub configuration: bool,
}

impl BackupScope {
    pub fn none() -> Self {
        Self {
            full_database: false,
            table_level: false,
            content: false,
            configuration: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.full_database || self.table_level || self.content || self.configuration)
    }
}

/// Environment-derived execution policy for one pipeline run.
///
/// Constructed fresh per run and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationStrategy {
    pub environment: Environment,
    pub validate_before: bool,
    pub validate_after: bool,
    pub require_approval: bool,
    pub backup_before_migrate: bool,
    pub allow_rollback: bool,
    pub require_security_scan: bool,
    pub require_compliance: bool,
    pub check_business_continuity: bool,
    /// Abort the remaining domain loop on the first exhausted domain.
    pub fail_fast: bool,
    /// Ask a human to confirm before backups run.
    pub confirm_backup: bool,
    /// Treat an integrity-invalid domain backup as a hard failure.
    pub strict_backup_integrity: bool,
    pub backup_scope: BackupScope,
    pub max_retries: u32,
    #[serde(with = "duration_secs")]
    pub retry_delay: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maintenance_window: Option<MaintenanceWindow>,
}

impl MigrationStrategy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.max_retries == 0 {
            return Err(PolicyError::Invalid(format!(
                "{}: max_retries must be at least 1",
                self.environment
            )));
        }
        Ok(())
    }
}
