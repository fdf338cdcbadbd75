//! Error types for the fleet agent.

use std::path::PathBuf;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Identity file {path} is corrupt: {reason}")]
    CorruptIdentity { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures talking to the server. Retried by the dispatch loop, never
/// raised to the job layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Request to {endpoint} failed: {reason}")]
    Request { endpoint: String, reason: String },

    #[error("Server returned {status} for {endpoint}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("Invalid response from {endpoint}: {reason}")]
    Decode { endpoint: String, reason: String },

    #[error("Agent is not registered with the server")]
    NotRegistered,
}

/// Package cache errors.
#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    #[error("Package {package_id} unavailable: {reason}")]
    Unavailable { package_id: String, reason: String },

    #[error("Dependency install failed in {path}: {reason}")]
    DependencyInstallFailed { path: PathBuf, reason: String },

    #[error("Invalid package descriptor at {path}: {reason}")]
    Descriptor { path: PathBuf, reason: String },

    #[error("Archive extraction failed: {0}")]
    Archive(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A fault raised by package code while it was running.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RuntimeFault {
    pub kind: String,
    pub message: String,
}

impl RuntimeFault {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Job-related errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Invalid job assignment: {field} {reason}")]
    Validation {
        field: &'static str,
        reason: &'static str,
    },

    #[error("Execution {execution_id} is already in flight")]
    ConcurrencyViolation { execution_id: String },

    #[error("Execution {execution_id} not found")]
    NotFound { execution_id: String },

    #[error("Execution {execution_id} already {from}, cannot transition to {to}")]
    InvalidTransition {
        execution_id: String,
        from: String,
        to: String,
    },

    #[error("Cannot load entry point {path}: {reason}")]
    LoadFailure { path: PathBuf, reason: String },

    #[error(transparent)]
    Runtime(#[from] RuntimeFault),

    #[error(transparent)]
    Package(#[from] PackageError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}

impl JobError {
    /// Name of the error class, as reported upstream.
    pub fn kind(&self) -> &str {
        match self {
            Self::Validation { .. } => "ValidationError",
            Self::ConcurrencyViolation { .. } => "ConcurrencyViolation",
            Self::NotFound { .. } => "NotFound",
            Self::InvalidTransition { .. } => "InvalidTransition",
            Self::LoadFailure { .. } => "LoadFailure",
            Self::Runtime(fault) => &fault.kind,
            Self::Package(PackageError::DependencyInstallFailed { .. }) => {
                "DependencyInstallFailed"
            }
            Self::Package(_) => "PackageUnavailable",
            Self::Workspace(_) => "WorkspaceError",
        }
    }

    /// `"<Kind>: <message>"` summary sent with failed status updates.
    pub fn summary(&self) -> String {
        match self {
            Self::Runtime(fault) => fault.to_string(),
            other => format!("{}: {}", other.kind(), other),
        }
    }
}

/// Per-execution working directory errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("Failed to serialize {what}: {reason}")]
    Serialize { what: &'static str, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Screenshot capture errors.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Screenshots are not supported in headless mode")]
    Headless,

    #[error("No screenshot command configured")]
    Unsupported,

    #[error("Screenshot command failed: {0}")]
    Failed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_fault_summary_is_kind_and_message() {
        let err = JobError::from(RuntimeFault::new("ValueError", "bad input"));
        assert_eq!(err.kind(), "ValueError");
        assert_eq!(err.summary(), "ValueError: bad input");
    }

    #[test]
    fn package_errors_map_to_taxonomy() {
        let unavailable = JobError::from(PackageError::Unavailable {
            package_id: "pkg".into(),
            reason: "404".into(),
        });
        assert_eq!(unavailable.kind(), "PackageUnavailable");
        assert!(unavailable.summary().starts_with("PackageUnavailable: "));

        let deps = JobError::from(PackageError::DependencyInstallFailed {
            path: PathBuf::from("/tmp/pkg"),
            reason: "exit 1".into(),
        });
        assert_eq!(deps.kind(), "DependencyInstallFailed");
    }

    #[test]
    fn load_failure_summary() {
        let err = JobError::LoadFailure {
            path: PathBuf::from("main.sh"),
            reason: "no entry function".into(),
        };
        assert_eq!(
            err.summary(),
            "LoadFailure: Cannot load entry point main.sh: no entry function"
        );
    }
}
