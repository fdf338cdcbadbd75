//! Per-execution working directory.
//!
//! Every execution gets `{base}/{execution_id}/` containing:
//! - `parameters.json`: snapshot of the job parameters
//! - `results.json`: final result, when the package sets one
//! - `logs/execution.log`: the execution's own log lines
//! - `screenshots/`: captures taken for reported steps

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::WorkspaceError;

/// Well-known paths inside an execution directory.
pub mod paths {
    pub const SCREENSHOTS: &str = "screenshots";
    pub const LOGS: &str = "logs";
    pub const PARAMETERS: &str = "parameters.json";
    pub const RESULTS: &str = "results.json";
    pub const EXECUTION_LOG: &str = "logs/execution.log";
}

/// Working directory of one execution.
#[derive(Debug, Clone)]
pub struct ExecutionWorkspace {
    base_path: PathBuf,
}

impl ExecutionWorkspace {
    /// Workspace for `execution_id` under `base`. Nothing is created yet.
    pub fn new(base: &Path, execution_id: &str) -> Self {
        Self {
            base_path: base.join(execution_id),
        }
    }

    pub fn root(&self) -> &Path {
        &self.base_path
    }

    /// Resolve a relative path inside the workspace.
    pub fn resolve_path(&self, relative: &str) -> PathBuf {
        self.base_path.join(relative)
    }

    /// Create the directory layout. Safe to call repeatedly.
    pub async fn ensure_dirs(&self) -> Result<(), WorkspaceError> {
        fs::create_dir_all(self.base_path.join(paths::SCREENSHOTS)).await?;
        fs::create_dir_all(self.base_path.join(paths::LOGS)).await?;
        Ok(())
    }

    /// Write (overwrite) a file in the workspace.
    pub async fn write(&self, path: &str, content: &[u8]) -> Result<(), WorkspaceError> {
        let full_path = self.resolve_path(path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&full_path, content).await?;
        Ok(())
    }

    /// Serialize `value` as pretty JSON into `path`.
    pub async fn write_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        what: &'static str,
        value: &T,
    ) -> Result<(), WorkspaceError> {
        let json = serde_json::to_vec_pretty(value).map_err(|e| WorkspaceError::Serialize {
            what,
            reason: e.to_string(),
        })?;
        self.write(path, &json).await
    }

    /// Append one line to a file (creates if missing).
    pub async fn append_line(&self, path: &str, line: &str) -> Result<(), WorkspaceError> {
        let full_path = self.resolve_path(path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&full_path)
            .await?;
        file.write_all(format!("{}\n", line.trim_end()).as_bytes())
            .await?;
        file.flush().await?;
        Ok(())
    }

    /// Read a file from the workspace.
    pub async fn read(&self, path: &str) -> Result<String, WorkspaceError> {
        Ok(fs::read_to_string(self.resolve_path(path)).await?)
    }

    /// Target file for a step screenshot.
    pub fn screenshot_path(&self, step_id: &str) -> PathBuf {
        let step: String = step_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let timestamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
        self.base_path
            .join(paths::SCREENSHOTS)
            .join(format!("{step}_{timestamp}.png"))
    }
}
