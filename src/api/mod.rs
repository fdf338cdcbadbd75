//! Server API boundary.
//!
//! Everything the agent core needs from the fleet server goes through the
//! [`ServerApi`] trait. [`HttpServerApi`] is the production implementation.

pub mod http;
#[cfg(test)]
pub(crate) mod testing;

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::{JobError, TransportError};
use crate::execution::ExecutionStatus;
use crate::identity::AgentIdentity;

pub use http::HttpServerApi;

/// One unit of work handed to this agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobAssignment {
    #[serde(default)]
    pub execution_id: String,
    #[serde(default)]
    pub job_id: String,
    #[serde(default)]
    pub package_id: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    /// Asset ids in the order the job listed them.
    #[serde(default)]
    pub assets: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl JobAssignment {
    /// Check that the fields needed to run the job are present.
    pub fn validate(&self) -> Result<(), JobError> {
        let required = [
            ("execution_id", &self.execution_id),
            ("job_id", &self.job_id),
            ("package_id", &self.package_id),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(JobError::Validation {
                    field,
                    reason: "is missing",
                });
            }
        }
        // names the working directory under the agent's work dir
        if !is_path_segment(&self.execution_id) {
            return Err(JobError::Validation {
                field: "execution_id",
                reason: "must be a single path segment",
            });
        }
        Ok(())
    }
}

fn is_path_segment(value: &str) -> bool {
    let mut components = Path::new(value).components();
    matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none()
        && !value.contains(['/', '\\', '\0'])
}

/// Credentials returned by registration.
#[derive(Debug, Clone)]
pub struct Registration {
    pub agent_id: String,
    pub api_key: SecretString,
}

/// Resource metrics sent with each heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatMetrics {
    pub agent_id: Option<String>,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub disk_percent: f32,
    pub active_executions: usize,
    pub timestamp: DateTime<Utc>,
}

/// Server reply to a heartbeat.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HeartbeatResponse {
    #[serde(default)]
    pub commands: Vec<ServerCommand>,
}

/// Instruction piggybacked on a heartbeat reply.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerCommand {
    StopJob { execution_id: String },
    EvictCache { max_age_secs: u64 },
    #[serde(other)]
    Unknown,
}

/// Status update for one execution.
#[derive(Debug, Clone, Serialize)]
pub struct StatusUpdate {
    pub execution_id: String,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<serde_json::Value>,
}

/// Status of a single reported step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Running,
    Completed,
    Failed,
    Skipped,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// A structured step reported by running package code.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub execution_id: String,
    pub step_id: String,
    pub description: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Local screenshot file, uploaded alongside the step.
    #[serde(skip)]
    pub screenshot: Option<PathBuf>,
    pub timestamp: DateTime<Utc>,
}

/// Operations the agent consumes from the fleet server.
#[async_trait]
pub trait ServerApi: Send + Sync {
    /// Register (or re-register) this agent.
    async fn register(&self, identity: &AgentIdentity) -> Result<Registration, TransportError>;

    /// Report liveness and metrics; returns pending server commands.
    async fn heartbeat(
        &self,
        metrics: &HeartbeatMetrics,
    ) -> Result<HeartbeatResponse, TransportError>;

    /// Fetch newly assigned jobs.
    async fn poll_jobs(&self) -> Result<Vec<JobAssignment>, TransportError>;

    async fn update_status(&self, update: &StatusUpdate) -> Result<(), TransportError>;

    async fn log_step(&self, step: &StepReport) -> Result<(), TransportError>;

    /// Fetch a decrypted asset value. `Ok(None)` when the asset does not exist.
    async fn get_asset(&self, asset_id: &str) -> Result<Option<SecretString>, TransportError>;

    /// Download a package archive.
    async fn download_package(
        &self,
        package_id: &str,
        version: Option<&str>,
    ) -> Result<Vec<u8>, TransportError>;

    /// Server-side view of an execution, used when the local record is gone.
    async fn execution_status(
        &self,
        execution_id: &str,
    ) -> Result<Option<ExecutionStatus>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_deserializes_with_defaults() {
        let a: JobAssignment = serde_json::from_str(
            r#"{"execution_id":"e1","job_id":"j1","package_id":"p1","parameters":{"n":3}}"#,
        )
        .unwrap();
        assert_eq!(a.version, None);
        assert!(a.assets.is_empty());
        assert_eq!(a.parameters["n"], 3);
        assert!(a.validate().is_ok());
    }

    #[test]
    fn validate_names_missing_field() {
        let a = JobAssignment {
            execution_id: "e1".into(),
            job_id: "  ".into(),
            package_id: "p1".into(),
            ..JobAssignment::default()
        };
        let err = a.validate().unwrap_err();
        assert!(matches!(err, JobError::Validation { field: "job_id", .. }));
    }

    #[test]
    fn validate_rejects_path_like_execution_ids() {
        for id in ["../x", "a/b", "/abs", "..", ".", "a\\b"] {
            let a = JobAssignment {
                execution_id: id.into(),
                job_id: "j1".into(),
                package_id: "p1".into(),
                ..JobAssignment::default()
            };
            let err = a.validate().unwrap_err();
            assert!(
                matches!(err, JobError::Validation { field: "execution_id", .. }),
                "{id}"
            );
        }

        let ok = JobAssignment {
            execution_id: "exec-7f3a.retry_2".into(),
            job_id: "j1".into(),
            package_id: "acme/invoice bot".into(),
            ..JobAssignment::default()
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn server_commands_parse() {
        let resp: HeartbeatResponse = serde_json::from_str(
            r#"{"commands":[
                {"type":"stop_job","execution_id":"e9"},
                {"type":"evict_cache","max_age_secs":0},
                {"type":"reboot"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(
            resp.commands,
            vec![
                ServerCommand::StopJob {
                    execution_id: "e9".into()
                },
                ServerCommand::EvictCache { max_age_secs: 0 },
                ServerCommand::Unknown,
            ]
        );
    }

    #[test]
    fn heartbeat_response_without_commands() {
        let resp: HeartbeatResponse = serde_json::from_str("{}").unwrap();
        assert!(resp.commands.is_empty());
    }
}
