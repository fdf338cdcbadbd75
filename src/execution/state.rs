//! Execution state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::JobAssignment;
use crate::error::JobError;

/// Status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Accepted, not yet started.
    Pending,
    /// Package code is being prepared or is running.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
    /// Stopped on request.
    Cancelled,
}

impl ExecutionStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: ExecutionStatus) -> bool {
        use ExecutionStatus::*;

        matches!(
            (self, target),
            (Pending, Running) | (Pending, Failed) | (Pending, Cancelled) |
            (Running, Completed) | (Running, Failed) | (Running, Cancelled)
        )
    }

    /// Terminal statuses are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A status transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// In-memory record of one execution attempt.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub job_id: String,
    pub package_id: String,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Structured result reported by the package.
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub transitions: Vec<StatusTransition>,
}

impl ExecutionRecord {
    /// Create a pending record for an assignment.
    pub fn new(assignment: &JobAssignment) -> Self {
        Self {
            execution_id: assignment.execution_id.clone(),
            job_id: assignment.job_id.clone(),
            package_id: assignment.package_id.clone(),
            status: ExecutionStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
            result: None,
            error: None,
            transitions: Vec::new(),
        }
    }

    /// Transition to a new status.
    pub fn transition_to(
        &mut self,
        new_status: ExecutionStatus,
        reason: Option<String>,
    ) -> Result<(), JobError> {
        if !self.status.can_transition_to(new_status) {
            return Err(JobError::InvalidTransition {
                execution_id: self.execution_id.clone(),
                from: self.status.to_string(),
                to: new_status.to_string(),
            });
        }

        self.transitions.push(StatusTransition {
            from: self.status,
            to: new_status,
            timestamp: Utc::now(),
            reason,
        });
        self.status = new_status;

        if new_status.is_terminal() {
            self.end_time = Some(Utc::now());
        }

        Ok(())
    }

    /// Move to a terminal status, recording the outcome.
    pub fn finish(
        &mut self,
        status: ExecutionStatus,
        error: Option<String>,
        result: Option<serde_json::Value>,
    ) -> Result<(), JobError> {
        self.transition_to(status, error.clone())?;
        self.error = error;
        self.result = result;
        Ok(())
    }

    /// Wall-clock time since the record was created, or its total run time
    /// once finished.
    pub fn elapsed(&self) -> Duration {
        let end = self.end_time.unwrap_or_else(Utc::now);
        end.signed_duration_since(self.start_time)
            .to_std()
            .unwrap_or_default()
    }
}
