#![forbid(unsafe_code)]

mod approvers;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use schemashift_core::policy::Policy;
use schemashift_core::rollback::RollbackPlan;
use schemashift_core::traits::{ApprovalWorkflow, SystemClock};
use schemashift_core::types::Environment;
use schemashift_engine::audit::log::{create_checkpoint, verify_chain, verify_checkpoint};
use schemashift_engine::audit::{AuditTrailRecorder, FileAuditSink};
use schemashift_engine::gates::ApprovalGate;
use schemashift_engine::state::atomic::{write_json, AdvisoryLock};
use schemashift_engine::strategy::StrategyProvider;
use schemashift_engine::workspace::{self, DirectoryBackupStore, FileWorkspace};
use schemashift_engine::{Collaborators, ExecutionContext, MigrationOrchestrator};
use schemashift_engine::{RollbackExecutor, RollbackPlanner};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use approvers::{ConsoleApproval, NoApprover, StaticApproval};

#[derive(Parser)]
#[command(
    name = "shift",
    version,
    about = "Gated schema migrations and dependency-aware rollbacks. JSON on stdout."
)]
struct Cli {
    /// Debug logging on stderr (RUST_LOG overrides).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Policy file (defaults apply when omitted).
    #[arg(long, global = true)]
    policy: Option<String>,

    /// Name recorded as the actor in audit entries and requests.
    #[arg(long, global = true, default_value = "shift")]
    actor: String,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print the effective strategy for an environment.
    Strategy {
        /// development | staging | production (dev, stage, prod accepted).
        env: String,
    },

    /// Policy file operations.
    Policy {
        #[command(subcommand)]
        cmd: PolicyCmd,
    },

    /// Run the migration pipeline against a workspace.
    Migrate {
        env: String,

        #[command(flatten)]
        target: WorkspaceArgs,

        #[command(flatten)]
        approval: ApprovalArgs,
    },

    /// Create a rollback plan.
    Plan {
        env: String,

        #[command(flatten)]
        target: WorkspaceArgs,

        /// Target version per domain, e.g. content=3 (repeatable).
        #[arg(long = "target", value_parser = parse_target, required = true)]
        targets: Vec<(String, u64)>,

        /// Why the rollback is requested.
        #[arg(long)]
        reason: String,

        /// Write the plan to this file as well as stdout.
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Decide a pending rollback plan and write the decision back to it.
    Approve {
        /// Path to the plan .json file.
        plan: String,

        #[command(flatten)]
        approval: ApprovalArgs,
    },

    /// Execute an approved rollback plan.
    Rollback {
        /// Path to the plan .json file.
        plan: String,

        #[command(flatten)]
        target: WorkspaceArgs,
    },

    /// Audit log operations.
    Audit {
        #[command(subcommand)]
        cmd: AuditCmd,
    },
}

#[derive(Subcommand)]
enum PolicyCmd {
    /// Schema-check and validate a policy file.
    Check {
        file: String,
    },
    /// Print the built-in default policy.
    Default,
}

#[derive(Subcommand)]
enum AuditCmd {
    /// Verify the hash chain of an audit log.
    Verify {
        file: String,

        /// Also verify against a checkpoint file.
        #[arg(long)]
        checkpoint: Option<String>,
    },
    /// Record the current chain head in a checkpoint file.
    Checkpoint {
        file: String,

        #[arg(short, long)]
        output: String,
    },
}

#[derive(clap::Args)]
struct WorkspaceArgs {
    /// Workspace .json file.
    #[arg(long)]
    workspace: String,

    /// Backup directory (default: <workspace>.backups).
    #[arg(long)]
    backups: Option<String>,

    /// Append audit entries to this hash-chained JSONL log.
    #[arg(long)]
    audit: Option<String>,
}

#[derive(clap::Args)]
struct ApprovalArgs {
    /// Pre-authorize approval requests as this approver.
    #[arg(long, conflicts_with = "interactive")]
    approve_as: Option<String>,

    /// Refuse approval requests with this reason.
    #[arg(long, conflicts_with = "interactive")]
    deny: Option<String>,

    /// Ask on the terminal.
    #[arg(long)]
    interactive: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.cmd {
        Cmd::Strategy { env } => cmd_strategy(cli.policy.as_deref(), &env),

        Cmd::Policy { cmd } => match cmd {
            PolicyCmd::Check { file } => cmd_policy_check(&file),
            PolicyCmd::Default => cmd_policy_default(),
        },

        Cmd::Migrate {
            env,
            target,
            approval,
        } => cmd_migrate(cli.policy.as_deref(), &cli.actor, &env, &target, &approval),

        Cmd::Plan {
            env,
            target,
            targets,
            reason,
            output,
        } => cmd_plan(
            cli.policy.as_deref(),
            &cli.actor,
            &env,
            &target,
            targets,
            &reason,
            output.as_deref(),
        ),

        Cmd::Approve { plan, approval } => {
            cmd_approve(cli.policy.as_deref(), &cli.actor, &plan, &approval)
        }

        Cmd::Rollback { plan, target } => {
            cmd_rollback(cli.policy.as_deref(), &cli.actor, &plan, &target)
        }

        Cmd::Audit { cmd } => match cmd {
            AuditCmd::Verify { file, checkpoint } => cmd_audit_verify(&file, checkpoint.as_deref()),
            AuditCmd::Checkpoint { file, output } => cmd_audit_checkpoint(&file, &output),
        },
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

// ── Shared setup ────────────────────────────────────────────────

fn parse_target(s: &str) -> Result<(String, u64), String> {
    let (domain, version) = s
        .split_once('=')
        .ok_or_else(|| format!("expected DOMAIN=VERSION, got \"{s}\""))?;
    let version = version
        .trim()
        .parse()
        .map_err(|e| format!("bad version in \"{s}\": {e}"))?;
    Ok((domain.trim().to_string(), version))
}

fn load_policy(path: Option<&str>) -> Result<Policy> {
    match path {
        Some(p) => Policy::load(p),
        None => Ok(Policy::default()),
    }
}

fn parse_env(env: &str) -> Result<Environment> {
    Ok(env.parse()?)
}

fn approval_workflow(args: &ApprovalArgs, actor: &str) -> Arc<dyn ApprovalWorkflow> {
    if args.interactive {
        return Arc::new(ConsoleApproval::new(actor));
    }
    match (&args.approve_as, &args.deny) {
        (approver, Some(reason)) => Arc::new(StaticApproval::deny(
            approver.as_deref().unwrap_or(actor),
            reason.as_str(),
        )),
        (Some(approver), None) => Arc::new(StaticApproval::grant(approver.as_str())),
        (None, None) => Arc::new(NoApprover),
    }
}

fn open_workspace(args: &WorkspaceArgs, approvals: Arc<dyn ApprovalWorkflow>) -> Result<Collaborators> {
    let ws = Arc::new(FileWorkspace::open(&args.workspace)?);
    let backups = args
        .backups
        .clone()
        .unwrap_or_else(|| format!("{}.backups", args.workspace.trim_end_matches(".json")));
    let store = Arc::new(DirectoryBackupStore::new(backups, ws.clone())?);
    Ok(workspace::collaborators(ws, store, approvals))
}

fn recorder(actor: &str, audit: Option<&str>) -> Result<AuditTrailRecorder> {
    let recorder = AuditTrailRecorder::new(actor);
    Ok(match audit {
        Some(path) => recorder.with_sink(Box::new(FileAuditSink::open(path)?)),
        None => recorder,
    })
}

fn read_plan(path: &str) -> Result<RollbackPlan> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("cannot read plan {path}"))?;
    serde_json::from_str(&content).with_context(|| format!("{path}: invalid rollback plan"))
}

/// Hold the workspace lock until an abandoned call stops writing, up to one
/// more call timeout.
fn settle(ctx: &ExecutionContext) {
    let Some(pending) = ctx.abandoned_call() else {
        return;
    };
    warn!(%pending, "waiting for abandoned call before releasing the workspace");
    if !ctx.settle(ctx.call_timeout()) {
        warn!(%pending, "abandoned call still running, workspace state unknown");
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ── Commands ────────────────────────────────────────────────────

fn cmd_strategy(policy: Option<&str>, env: &str) -> Result<()> {
    let policy = load_policy(policy)?;
    let strategy = StrategyProvider::new(&policy).for_environment(parse_env(env)?)?;
    print_json(&strategy)
}

fn cmd_policy_check(file: &str) -> Result<()> {
    let content =
        std::fs::read_to_string(file).with_context(|| format!("cannot read {file}"))?;
    let value: serde_json::Value =
        serde_json::from_str(&content).with_context(|| format!("{file}: invalid JSON"))?;

    let mut errors = schemashift_core::schema::policy_issues(&value)?;
    if errors.is_empty() {
        match serde_json::from_value::<Policy>(value) {
            Ok(policy) => {
                if let Err(e) = policy.validate() {
                    errors.push(e.to_string());
                }
            }
            Err(e) => errors.push(e.to_string()),
        }
    }

    let pass = errors.is_empty();
    print_json(&json!({ "file": file, "pass": pass, "errors": errors }))?;
    if !pass {
        bail!("policy check failed for {file}");
    }
    Ok(())
}

fn cmd_policy_default() -> Result<()> {
    print_json(&Policy::default())
}

fn cmd_migrate(
    policy: Option<&str>,
    actor: &str,
    env: &str,
    target: &WorkspaceArgs,
    approval: &ApprovalArgs,
) -> Result<()> {
    let policy = load_policy(policy)?;
    let env = parse_env(env)?;
    let _lock = AdvisoryLock::acquire(Path::new(&target.workspace))?;
    let collaborators = open_workspace(target, approval_workflow(approval, actor))?;
    let ctx = ExecutionContext::from_policy(&policy);
    let mut recorder = recorder(actor, target.audit.as_deref())?;

    let orchestrator = MigrationOrchestrator::new(policy, collaborators, actor);
    let outcome = orchestrator.run(env, &ctx, &mut recorder);
    settle(&ctx);
    match outcome {
        Ok(result) => {
            print_json(&result)?;
            if !result.success {
                bail!(
                    "migration failed for {} domain(s): {}",
                    result.failed_domains.len(),
                    result.failed_domains.join(", ")
                );
            }
            info!(
                completed = result.completed_domains.len(),
                skipped = result.skipped_domains.len(),
                "migration finished"
            );
            Ok(())
        }
        Err(e) => {
            print_json(&json!({
                "environment": env,
                "success": false,
                "aborted_at": e.failed_gate(),
                "error": e.to_string(),
                "audit_trail": recorder.entries(),
            }))?;
            Err(e.into())
        }
    }
}

fn cmd_plan(
    policy: Option<&str>,
    actor: &str,
    env: &str,
    target: &WorkspaceArgs,
    targets: Vec<(String, u64)>,
    reason: &str,
    output: Option<&str>,
) -> Result<()> {
    let policy = load_policy(policy)?;
    let env = parse_env(env)?;
    let collaborators = open_workspace(target, Arc::new(NoApprover))?;
    let ctx = ExecutionContext::from_policy(&policy);
    let mut recorder = recorder(actor, target.audit.as_deref())?;

    let planner = RollbackPlanner::new(env, policy, collaborators)?;
    let targets: BTreeMap<String, u64> = targets.into_iter().collect();
    match planner.create_rollback_plan(&ctx, &targets, reason, actor, &mut recorder) {
        Ok(plan) => {
            if let Some(path) = output {
                write_json(Path::new(path), &plan)?;
                info!(plan = %plan.id, path, "plan written");
            }
            print_json(&plan)
        }
        Err(e) => {
            print_json(&json!({
                "environment": env,
                "planned": false,
                "error": e.to_string(),
            }))?;
            Err(e.into())
        }
    }
}

fn cmd_approve(policy: Option<&str>, actor: &str, plan_path: &str, approval: &ApprovalArgs) -> Result<()> {
    let policy = load_policy(policy)?;
    let mut plan = read_plan(plan_path)?;
    let gate = ApprovalGate::new(approval_workflow(approval, actor), Arc::new(SystemClock));
    let ctx = ExecutionContext::from_policy(&policy);

    let Some(decision) = gate.request_rollback_approval(&ctx, &mut plan, actor)? else {
        bail!(
            "plan {} is already {}; nothing to decide",
            plan.id,
            plan.approval_status()
        );
    };
    write_json(Path::new(plan_path), &plan)?;
    print_json(&json!({
        "plan_id": plan.id,
        "status": decision.status,
        "approver": decision.approver,
        "reason": decision.reason,
        "decided_at": decision.decided_at,
    }))?;
    decision.require_granted()?;
    Ok(())
}

fn result_path(plan_path: &str) -> PathBuf {
    PathBuf::from(format!("{}.result.json", plan_path.trim_end_matches(".json")))
}

fn cmd_rollback(policy: Option<&str>, actor: &str, plan_path: &str, target: &WorkspaceArgs) -> Result<()> {
    let policy = load_policy(policy)?;
    let plan = read_plan(plan_path)?;
    let out = result_path(plan_path);
    if out.exists() {
        bail!(
            "plan {} was already executed (result in {})",
            plan.id,
            out.display()
        );
    }

    let _lock = AdvisoryLock::acquire(Path::new(&target.workspace))?;
    let collaborators = open_workspace(target, Arc::new(NoApprover))?;
    let ctx = ExecutionContext::from_policy(&policy);
    let mut recorder = recorder(actor, target.audit.as_deref())?;

    let mut executor = RollbackExecutor::new(policy, collaborators);
    let outcome = executor.execute_rollback(&ctx, &plan, &mut recorder);
    settle(&ctx);
    let result = match outcome {
        Ok(result) => result,
        Err(e) => {
            print_json(&json!({
                "plan_id": plan.id,
                "executed": false,
                "error": e.to_string(),
            }))?;
            return Err(e.into());
        }
    };
    write_json(&out, &result)?;
    print_json(&result)?;
    if !result.success {
        bail!(
            "rollback incomplete: {} failed, {} not attempted",
            result.failed_domains.len(),
            result.not_attempted.len()
        );
    }
    Ok(())
}

fn cmd_audit_verify(file: &str, checkpoint: Option<&str>) -> Result<()> {
    let path = Path::new(file);
    let (entries, error) = match verify_chain(path) {
        Ok(n) => (Some(n), None),
        Err(e) => (None, Some(format!("{e:#}"))),
    };
    let checkpoint_ok = match (checkpoint, &error) {
        (Some(cp), None) => Some(verify_checkpoint(path, Path::new(cp))?),
        _ => None,
    };
    let valid = error.is_none() && checkpoint_ok.unwrap_or(true);
    print_json(&json!({
        "file": file,
        "valid": valid,
        "entries": entries,
        "checkpoint_ok": checkpoint_ok,
        "error": error,
    }))?;
    if !valid {
        bail!("audit verification failed for {file}");
    }
    Ok(())
}

fn cmd_audit_checkpoint(file: &str, output: &str) -> Result<()> {
    let checkpoint = create_checkpoint(Path::new(file), Path::new(output))?;
    print_json(&checkpoint)
}
