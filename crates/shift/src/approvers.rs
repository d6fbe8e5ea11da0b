use std::io::{self, BufRead, Write};

use chrono::Utc;
use schemashift_core::errors::CollaboratorError;
use schemashift_core::traits::{ApprovalRequest, ApprovalResponse, ApprovalWorkflow, CallResult};

/// Answers every request the same way. Used for pre-authorized runs.
pub struct StaticApproval {
    approver: String,
    rejection: Option<String>,
}

impl StaticApproval {
    pub fn grant(approver: impl Into<String>) -> Self {
        Self {
            approver: approver.into(),
            rejection: None,
        }
    }

    pub fn deny(approver: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            approver: approver.into(),
            rejection: Some(reason.into()),
        }
    }
}

impl ApprovalWorkflow for StaticApproval {
    fn request_approval(&self, request: &ApprovalRequest) -> CallResult<ApprovalResponse> {
        tracing::info!(
            request = %request.id,
            approver = %self.approver,
            granted = self.rejection.is_none(),
            "pre-authorized approval"
        );
        Ok(ApprovalResponse {
            approved: self.rejection.is_none(),
            approver: self.approver.clone(),
            timestamp: Utc::now(),
            rejection_reason: self.rejection.clone(),
        })
    }
}

/// Prompts on stderr and reads the answer from stdin.
pub struct ConsoleApproval {
    approver: String,
}

impl ConsoleApproval {
    pub fn new(approver: impl Into<String>) -> Self {
        Self {
            approver: approver.into(),
        }
    }
}

impl ApprovalWorkflow for ConsoleApproval {
    fn request_approval(&self, request: &ApprovalRequest) -> CallResult<ApprovalResponse> {
        let mut err = io::stderr().lock();
        let prompt = format!(
            "\napproval {} ({:?}, {} risk, ~{}s)\n  {}\napprove? [y/N] ",
            request.id,
            request.subject,
            request.risk_level,
            request.expected_duration.as_secs(),
            request.summary
        );
        err.write_all(prompt.as_bytes())
            .and_then(|_| err.flush())
            .map_err(|e| CollaboratorError::Unavailable(format!("cannot prompt: {e}")))?;

        let mut answer = String::new();
        io::stdin()
            .lock()
            .read_line(&mut answer)
            .map_err(|e| CollaboratorError::Unavailable(format!("cannot read answer: {e}")))?;
        let approved = matches!(answer.trim(), "y" | "Y" | "yes");
        Ok(ApprovalResponse {
            approved,
            approver: self.approver.clone(),
            timestamp: Utc::now(),
            rejection_reason: (!approved).then(|| "declined at console".to_string()),
        })
    }
}

/// No approver configured: approval-gated steps cannot proceed.
pub struct NoApprover;

impl ApprovalWorkflow for NoApprover {
    fn request_approval(&self, _request: &ApprovalRequest) -> CallResult<ApprovalResponse> {
        Err(CollaboratorError::Unavailable(
            "no approver configured (pass --approve-as or --interactive)".into(),
        ))
    }
}
