//! File-backed collaborators for running the pipeline against a JSON workspace.

pub mod document;
pub mod file;
pub mod store;

use std::sync::Arc;

use schemashift_core::traits::{ApprovalWorkflow, SystemClock};

pub use document::WorkspaceDocument;
pub use file::FileWorkspace;
pub use store::DirectoryBackupStore;

use crate::collaborators::Collaborators;

/// Wire a workspace and backup directory into a collaborator set.
pub fn collaborators(
    workspace: Arc<FileWorkspace>,
    backups: Arc<DirectoryBackupStore>,
    approvals: Arc<dyn ApprovalWorkflow>,
) -> Collaborators {
    Collaborators {
        migrator: workspace.clone(),
        versions: workspace.clone(),
        validator: workspace.clone(),
        security: workspace.clone(),
        compliance: workspace.clone(),
        approvals,
        backups,
        tables: workspace,
        clock: Arc::new(SystemClock),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditTrailRecorder;
    use crate::context::ExecutionContext;
    use crate::orchestrator::MigrationOrchestrator;
    use crate::rollback::{RollbackExecutor, RollbackPlanner};
    use document::{DomainState, MigrationEntry};
    use schemashift_core::errors::CollaboratorError;
    use schemashift_core::policy::Policy;
    use schemashift_core::traits::{ApprovalRequest, ApprovalResponse, CallResult};
    use schemashift_core::types::Environment;
    use std::collections::BTreeMap;
    use std::time::Duration;

    struct Never;

    impl ApprovalWorkflow for Never {
        fn request_approval(&self, _: &ApprovalRequest) -> CallResult<ApprovalResponse> {
            Err(CollaboratorError::Unavailable("no approvers".into()))
        }
    }

    fn domain(current: u64, latest: u64) -> DomainState {
        DomainState {
            current_version: current,
            migrations: (1..=latest)
                .map(|v| MigrationEntry {
                    version: v,
                    name: format!("m{v}"),
                    down: vec![],
                    fails_up: false,
                    fails_down: false,
                })
                .collect(),
            tables: BTreeMap::new(),
        }
    }

    #[test]
    fn migrate_and_roll_back_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = WorkspaceDocument::default();
        doc.domains.insert("content".into(), domain(2, 5));
        doc.domains.insert("services".into(), domain(1, 1));
        let ws = Arc::new(FileWorkspace::create(dir.path().join("w.json"), doc).unwrap());
        let store = Arc::new(DirectoryBackupStore::new(dir.path().join("b"), ws.clone()).unwrap());
        let collab = collaborators(ws.clone(), store, Arc::new(Never));
        let ctx = ExecutionContext::new(Duration::from_secs(5), Duration::from_secs(5));
        let policy = Policy::default();
        let mut recorder = AuditTrailRecorder::new("tester");
        let env = Environment::Development;

        let result = MigrationOrchestrator::new(policy.clone(), collab.clone(), "tester")
            .run(env, &ctx, &mut recorder)
            .unwrap();
        assert_eq!(result.completed_domains, ["content"]);
        assert_eq!(result.skipped_domains, ["services"]);

        let plan = RollbackPlanner::new(env, policy.clone(), collab.clone())
            .unwrap()
            .create_rollback_plan(
                &ctx,
                &BTreeMap::from([("content".to_string(), 2)]),
                "revert",
                "tester",
                &mut recorder,
            )
            .unwrap();
        let rolled = RollbackExecutor::new(policy, collab)
            .execute_rollback(&ctx, &plan, &mut recorder)
            .unwrap();
        assert!(rolled.success);

        let reopened = FileWorkspace::open(ws.path()).unwrap();
        assert_eq!(reopened.snapshot().unwrap().domains["content"].current_version, 2);
    }
}
