//! In-memory collaborators for engine tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use schemashift_core::backup::{ConfigArtifact, ContentObject, DomainBackupResult, TableBackupStats};
use schemashift_core::domains::DomainCatalog;
use schemashift_core::errors::CollaboratorError;
use schemashift_core::rollback::{derive_plan_id, PlanDraft};
use schemashift_core::traits::{
    ApprovalRequest, ApprovalResponse, ApprovalWorkflow, ArtifactManifest, BackupStore, CallResult,
    Clock, ComplianceManager, ContinuityReport, DomainMigrator, EnvironmentValidator, HealthReport,
    SchemaVersionRepository, ScoreReport, SecurityValidator, TableInspector,
};
use schemashift_core::types::{ApprovalStatus, DestructiveOp, Environment, RiskLevel};

use crate::collaborators::Collaborators;
use crate::context::CancelToken;

/// Settable clock.
pub struct FixedClock(Mutex<DateTime<Utc>>);

impl FixedClock {
    pub fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> Self {
        Self(Mutex::new(utc(y, m, d, h, min)))
    }

    pub fn set(&self, t: DateTime<Utc>) {
        *self.0.lock().unwrap() = t;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).single().unwrap()
}

enum Script {
    Approve(String),
    Deny(String, String),
    Slow(Duration),
    Unavailable,
}

/// Approval workflow with a fixed answer.
pub struct ScriptedApproval {
    script: Script,
    requests: Mutex<Vec<ApprovalRequest>>,
}

impl ScriptedApproval {
    fn with(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn approve(approver: &str) -> Arc<Self> {
        Self::with(Script::Approve(approver.into()))
    }

    pub fn deny(approver: &str, reason: &str) -> Arc<Self> {
        Self::with(Script::Deny(approver.into(), reason.into()))
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Self::with(Script::Slow(delay))
    }

    pub fn unavailable() -> Arc<Self> {
        Self::with(Script::Unavailable)
    }

    pub fn requests(&self) -> Vec<ApprovalRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl ApprovalWorkflow for ScriptedApproval {
    fn request_approval(&self, request: &ApprovalRequest) -> CallResult<ApprovalResponse> {
        self.requests.lock().unwrap().push(request.clone());
        match &self.script {
            Script::Approve(who) => Ok(response(who, None)),
            Script::Deny(who, reason) => Ok(response(who, Some(reason))),
            Script::Slow(delay) => {
                thread::sleep(*delay);
                Ok(response("late", None))
            }
            Script::Unavailable => Err(CollaboratorError::Unavailable("approval service down".into())),
        }
    }
}

fn response(approver: &str, rejection: Option<&str>) -> ApprovalResponse {
    ApprovalResponse {
        approved: rejection.is_none(),
        approver: approver.to_string(),
        timestamp: Utc::now(),
        rejection_reason: rejection.map(str::to_string),
    }
}

/// Pending staging-style draft: content 5 -> 3.
pub fn plan_draft(env: Environment, status: ApprovalStatus) -> PlanDraft {
    let mut draft = PlanDraft {
        id: String::new(),
        environment: env,
        requester: "ops".into(),
        requested_at: utc(2026, 5, 4, 3, 0),
        reason: "bad release".into(),
        target_versions: BTreeMap::from([("content".into(), 3)]),
        current_versions: BTreeMap::from([("content".into(), Some(5))]),
        risk_level: RiskLevel::Low,
        domain_risks: BTreeMap::from([("content".into(), RiskLevel::Low)]),
        estimated_duration: Duration::from_secs(300),
        dependencies: vec![],
        approval_status: status,
    };
    reseal(&mut draft);
    draft
}

/// Recompute the content-derived id after editing a draft.
pub fn reseal(draft: &mut PlanDraft) {
    draft.id = derive_plan_id(
        draft.environment,
        &draft.requester,
        &draft.requested_at,
        &draft.reason,
        &draft.target_versions,
    );
}

#[derive(Clone, Copy)]
struct Table {
    rows: u64,
    live: Option<u64>,
    bytes: u64,
}

#[derive(Default)]
struct State {
    pending: HashMap<String, u32>,
    versions: HashMap<String, (u64, u64)>,
    unreadable: Vec<String>,
    destructive: HashMap<String, Vec<DestructiveOp>>,
    migrate_calls: HashMap<String, u32>,
    failures_left: HashMap<String, u32>,
    hangs: HashMap<String, Duration>,
    in_flight: u32,
    max_in_flight: u32,
    finished_mutations: u32,
    cancel_on_migrate: Option<CancelToken>,
    failing_apply: Vec<String>,
    applied: Vec<(String, u64)>,
    validator_calls: u32,
    security: f64,
    compliance: f64,
    continuity: (bool, f64),
    denial: Option<String>,
    approvals: Vec<ApprovalRequest>,
    tables: HashMap<String, Table>,
    failing_tables: Vec<String>,
    table_stats: HashMap<String, Vec<TableBackupStats>>,
    manifests: usize,
    recovery_point_fails: bool,
}

impl State {
    fn enter(&mut self) {
        self.in_flight += 1;
        self.max_in_flight = self.max_in_flight.max(self.in_flight);
    }

    fn leave(&mut self) {
        self.in_flight -= 1;
        self.finished_mutations += 1;
    }
}

/// One simulated environment behind every collaborator trait.
pub struct World {
    clock: Arc<FixedClock>,
    state: Arc<Mutex<State>>,
}

impl World {
    /// Healthy environment at 2026-05-04 03:00 UTC with approvals granted.
    pub fn new(_env: Environment) -> Self {
        let state = State {
            security: 99.0,
            compliance: 99.0,
            continuity: (true, 5.0),
            ..State::default()
        };
        Self {
            clock: Arc::new(FixedClock::at(2026, 5, 4, 3, 0)),
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn collaborators(&self) -> Collaborators {
        let fake = Arc::new(Fake {
            state: Arc::clone(&self.state),
        });
        Collaborators {
            migrator: fake.clone(),
            versions: fake.clone(),
            validator: fake.clone(),
            security: fake.clone(),
            compliance: fake.clone(),
            approvals: fake.clone(),
            backups: fake.clone(),
            tables: fake,
            clock: self.clock.clone(),
        }
    }

    pub fn set_time(&self, h: u32, min: u32) {
        self.clock.set(utc(2026, 5, 4, h, min));
    }

    pub fn set_pending(&self, domain: &str, count: u32) {
        self.state().pending.insert(domain.into(), count);
    }

    pub fn set_versions(&self, domain: &str, current: u64, latest: u64) {
        self.state().versions.insert(domain.into(), (current, latest));
    }

    pub fn unreadable_version(&self, domain: &str) {
        self.state().unreadable.push(domain.into());
    }

    pub fn current_version(&self, domain: &str) -> u64 {
        self.state().versions.get(domain).map_or(0, |v| v.0)
    }

    pub fn set_destructive(&self, domain: &str, ops: Vec<DestructiveOp>) {
        self.state().destructive.insert(domain.into(), ops);
    }

    /// Fail the next `times` migration calls for `domain`.
    pub fn fail_migrations(&self, domain: &str, times: u32) {
        self.state().failures_left.insert(domain.into(), times);
    }

    /// Delay migrations and rollbacks of `domain` by `delay`.
    pub fn hang_migrations(&self, domain: &str, delay: Duration) {
        self.state().hangs.insert(domain.into(), delay);
    }

    /// Most migrator mutations observed running at the same time.
    pub fn max_in_flight(&self) -> u32 {
        self.state().max_in_flight
    }

    pub fn in_flight(&self) -> u32 {
        self.state().in_flight
    }

    pub fn finished_mutations(&self) -> u32 {
        self.state().finished_mutations
    }

    pub fn cancel_on_migrate(&self, token: CancelToken) {
        self.state().cancel_on_migrate = Some(token);
    }

    pub fn migrate_calls(&self, domain: &str) -> u32 {
        self.state().migrate_calls.get(domain).copied().unwrap_or(0)
    }

    pub fn fail_apply(&self, domain: &str) {
        self.state().failing_apply.push(domain.into());
    }

    pub fn applied(&self) -> Vec<(String, u64)> {
        self.state().applied.clone()
    }

    pub fn validator_calls(&self) -> u32 {
        self.state().validator_calls
    }

    pub fn set_security(&self, score: f64) {
        self.state().security = score;
    }

    pub fn set_compliance(&self, score: f64) {
        self.state().compliance = score;
    }

    pub fn set_continuity(&self, passed: bool, impact: f64) {
        self.state().continuity = (passed, impact);
    }

    pub fn deny_approvals(&self, reason: &str) {
        self.state().denial = Some(reason.into());
    }

    pub fn approval_calls(&self) -> usize {
        self.state().approvals.len()
    }

    pub fn approval_requests(&self) -> Vec<ApprovalRequest> {
        self.state().approvals.clone()
    }

    pub fn set_table(&self, table: &str, rows: u64, live: Option<u64>, bytes: u64) {
        self.state()
            .tables
            .insert(table.into(), Table { rows, live, bytes });
    }

    /// Give every catalog table `rows` live rows.
    pub fn seed_tables(&self, rows: u64) {
        let catalog = DomainCatalog::canonical();
        let mut state = self.state();
        for spec in catalog.domains() {
            for table in &spec.tables {
                state.tables.insert(
                    table.clone(),
                    Table {
                        rows,
                        live: Some(rows),
                        bytes: rows * 128,
                    },
                );
            }
        }
    }

    pub fn fail_table(&self, table: &str) {
        self.state().failing_tables.push(table.into());
    }

    pub fn stored_table_stats(&self, domain: &str) -> Vec<TableBackupStats> {
        self.state().table_stats.get(domain).cloned().unwrap_or_default()
    }

    pub fn stored_manifest_count(&self) -> usize {
        self.state().manifests
    }

    pub fn fail_recovery_point(&self) {
        self.state().recovery_point_fails = true;
    }
}

struct Fake {
    state: Arc<Mutex<State>>,
}

impl Fake {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn table(&self, table: &str) -> CallResult<Table> {
        let state = self.state();
        if state.failing_tables.iter().any(|t| t == table) {
            return Err(CollaboratorError::Failed(format!("{table}: relation is locked")));
        }
        Ok(state.tables.get(table).copied().unwrap_or(Table {
            rows: 0,
            live: Some(0),
            bytes: 0,
        }))
    }

    fn location(&self, env: Environment, what: &str) -> String {
        format!("mem://{}/{what}", env.as_str())
    }
}

impl DomainMigrator for Fake {
    fn pending_count(&self, domain: &str, _env: Environment) -> CallResult<u32> {
        Ok(self.state().pending.get(domain).copied().unwrap_or(0))
    }

    fn execute_domain_migrations(&self, domain: &str, _env: Environment) -> CallResult<()> {
        let hang = {
            let mut state = self.state();
            *state.migrate_calls.entry(domain.into()).or_default() += 1;
            if let Some(token) = &state.cancel_on_migrate {
                token.cancel();
            }
            if let Some(left) = state.failures_left.get_mut(domain) {
                if *left > 0 {
                    *left -= 1;
                    return Err(CollaboratorError::Failed(format!(
                        "{domain}: migration script error"
                    )));
                }
            }
            state.enter();
            state.hangs.get(domain).copied()
        };
        if let Some(delay) = hang {
            thread::sleep(delay);
        }
        let mut state = self.state();
        state.leave();
        state.pending.insert(domain.into(), 0);
        if let Some(v) = state.versions.get_mut(domain) {
            v.0 = v.1;
        }
        Ok(())
    }

    fn apply_target_version(&self, domain: &str, _env: Environment, version: u64) -> CallResult<()> {
        let hang = {
            let mut state = self.state();
            if state.failing_apply.iter().any(|d| d == domain) {
                return Err(CollaboratorError::Failed(format!(
                    "{domain}: down migration {version} failed"
                )));
            }
            state.enter();
            state.hangs.get(domain).copied()
        };
        if let Some(delay) = hang {
            thread::sleep(delay);
        }
        let mut state = self.state();
        state.leave();
        state.applied.push((domain.into(), version));
        let entry = state.versions.entry(domain.into()).or_insert((version, version));
        entry.0 = version;
        Ok(())
    }
}

impl SchemaVersionRepository for Fake {
    fn current_version(&self, domain: &str, _env: Environment) -> CallResult<u64> {
        let state = self.state();
        if state.unreadable.iter().any(|d| d == domain) {
            return Err(CollaboratorError::Failed(format!("{domain}: version table missing")));
        }
        Ok(state.versions.get(domain).map_or(0, |v| v.0))
    }

    fn latest_version(&self, domain: &str, _env: Environment) -> CallResult<u64> {
        Ok(self.state().versions.get(domain).map_or(0, |v| v.1))
    }

    fn destructive_operations(
        &self,
        domain: &str,
        _env: Environment,
        _from: u64,
        _to: u64,
    ) -> CallResult<Vec<DestructiveOp>> {
        Ok(self.state().destructive.get(domain).cloned().unwrap_or_default())
    }
}

impl EnvironmentValidator for Fake {
    fn validate_environment(&self, _env: Environment) -> CallResult<HealthReport> {
        self.state().validator_calls += 1;
        Ok(HealthReport {
            overall_healthy: true,
            dependencies: BTreeMap::from([("database".into(), true)]),
            issues: vec![],
        })
    }
}

impl SecurityValidator for Fake {
    fn assess_security(&self, _env: Environment) -> CallResult<ScoreReport> {
        Ok(ScoreReport {
            passed: true,
            score: self.state().security,
            issues: vec![],
        })
    }
}

impl ComplianceManager for Fake {
    fn assess_compliance(&self, _env: Environment) -> CallResult<ScoreReport> {
        Ok(ScoreReport {
            passed: true,
            score: self.state().compliance,
            issues: vec![],
        })
    }

    fn assess_business_continuity(&self, _env: Environment) -> CallResult<ContinuityReport> {
        let (passed, impact_score) = self.state().continuity;
        Ok(ContinuityReport {
            passed,
            impact_score,
            issues: if passed {
                vec![]
            } else {
                vec!["booking throughput degraded".into()]
            },
        })
    }
}

impl ApprovalWorkflow for Fake {
    fn request_approval(&self, request: &ApprovalRequest) -> CallResult<ApprovalResponse> {
        let mut state = self.state();
        state.approvals.push(request.clone());
        Ok(response("release-manager", state.denial.as_deref()))
    }
}

impl BackupStore for Fake {
    fn database_size(&self, _env: Environment) -> CallResult<u64> {
        Ok(64 * 1024 * 1024)
    }

    fn store_full_backup(&self, env: Environment, _byte_size: u64) -> CallResult<String> {
        self.state().manifests += 1;
        Ok(self.location(env, "full"))
    }

    fn store_domain_manifest(
        &self,
        env: Environment,
        result: &DomainBackupResult,
        tables: &[TableBackupStats],
    ) -> CallResult<String> {
        let mut state = self.state();
        state.manifests += 1;
        state.table_stats.insert(result.domain.clone(), tables.to_vec());
        Ok(self.location(env, &result.domain))
    }

    fn content_inventory(&self, _env: Environment) -> CallResult<Vec<ContentObject>> {
        Ok(vec![
            ContentObject {
                key: "media/hero.jpg".into(),
                bytes: 20_480,
            },
            ContentObject {
                key: "media/logo.svg".into(),
                bytes: 2_048,
            },
        ])
    }

    fn config_artifacts(&self, _env: Environment) -> CallResult<Vec<ConfigArtifact>> {
        Ok(vec![ConfigArtifact {
            name: "app.toml".into(),
            bytes: 512,
        }])
    }

    fn store_artifact_manifest(
        &self,
        env: Environment,
        manifest: &ArtifactManifest,
    ) -> CallResult<String> {
        self.state().manifests += 1;
        let kind = serde_json::to_value(manifest.kind)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        Ok(self.location(env, &kind))
    }

    fn create_recovery_point(&self, env: Environment, label: &str) -> CallResult<String> {
        if self.state().recovery_point_fails {
            return Err(CollaboratorError::Unavailable("snapshot service down".into()));
        }
        Ok(self.location(env, &format!("recovery/{label}")))
    }
}

impl TableInspector for Fake {
    fn count_live_rows(&self, _env: Environment, table: &str) -> CallResult<Option<u64>> {
        Ok(self.table(table)?.live)
    }

    fn count_rows(&self, _env: Environment, table: &str) -> CallResult<u64> {
        Ok(self.table(table)?.rows)
    }

    fn table_size(&self, _env: Environment, table: &str) -> CallResult<u64> {
        Ok(self.table(table)?.bytes)
    }
}
