//! Per-execution session handed to running package code.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::api::{JobAssignment, ServerApi, StepReport, StepStatus};
use crate::error::{CaptureError, WorkspaceError};
use crate::screenshot::ScreenCapture;
use crate::workspace::{ExecutionWorkspace, paths};

/// Severity of an execution log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    #[serde(alias = "warn")]
    Warning,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

/// Services an execution context talks to.
#[derive(Clone)]
pub struct ContextServices {
    pub api: Arc<dyn ServerApi>,
    pub capture: Arc<dyn ScreenCapture>,
    pub headless: bool,
}

/// Session object for one execution.
///
/// Shared between the executor and the running entry point; all methods take
/// `&self`.
pub struct ExecutionContext {
    execution_id: String,
    job_id: String,
    package_id: String,
    parameters: serde_json::Map<String, Value>,
    asset_ids: Vec<String>,
    services: ContextServices,
    workspace: OnceLock<ExecutionWorkspace>,
    /// Assets fetched so far. Dropped with the context.
    assets: tokio::sync::Mutex<HashMap<String, SecretString>>,
    steps: Mutex<Vec<StepReport>>,
    result: Mutex<Option<Value>>,
    started: Instant,
    cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(
        assignment: &JobAssignment,
        services: ContextServices,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            execution_id: assignment.execution_id.clone(),
            job_id: assignment.job_id.clone(),
            package_id: assignment.package_id.clone(),
            parameters: assignment.parameters.clone(),
            asset_ids: assignment.assets.clone(),
            services,
            workspace: OnceLock::new(),
            assets: tokio::sync::Mutex::new(HashMap::new()),
            steps: Mutex::new(Vec::new()),
            result: Mutex::new(None),
            started: Instant::now(),
            cancel,
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn package_id(&self) -> &str {
        &self.package_id
    }

    pub fn parameters(&self) -> &serde_json::Map<String, Value> {
        &self.parameters
    }

    pub fn parameter(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    /// Working directory, once [`setup_workspace`](Self::setup_workspace) ran.
    pub fn working_dir(&self) -> Option<PathBuf> {
        self.workspace.get().map(|ws| ws.root().to_path_buf())
    }

    /// Create `{base}/{execution_id}/{screenshots,logs}` and snapshot the
    /// parameters into it.
    pub async fn setup_workspace(&self, base: &std::path::Path) -> Result<PathBuf, WorkspaceError> {
        let workspace = self
            .workspace
            .get_or_init(|| ExecutionWorkspace::new(base, &self.execution_id));
        workspace.ensure_dirs().await?;
        workspace
            .write_json(paths::PARAMETERS, "parameters", &self.parameters)
            .await?;
        Ok(workspace.root().to_path_buf())
    }

    /// Log a message to the agent log and the execution log file.
    ///
    /// Never fails: a log file that cannot be written only produces a warning.
    pub async fn log(&self, message: &str, level: LogLevel, step_id: Option<&str>) {
        let execution_id = self.execution_id.as_str();
        let step_id = step_id.unwrap_or("");
        match level {
            LogLevel::Debug => tracing::debug!(execution_id, step_id, "{message}"),
            LogLevel::Info => tracing::info!(execution_id, step_id, "{message}"),
            LogLevel::Warning => tracing::warn!(execution_id, step_id, "{message}"),
            LogLevel::Error => tracing::error!(execution_id, step_id, "{message}"),
        }

        let Some(workspace) = self.workspace.get() else {
            return;
        };
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let line = format!("[{timestamp}][{level}] {message}");
        if let Err(e) = workspace.append_line(paths::EXECUTION_LOG, &line).await {
            tracing::warn!(execution_id, error = %e, "Failed to write execution log");
        }
    }

    /// Record a step locally and report it to the server.
    ///
    /// A screenshot is taken only when requested, supported and not headless.
    /// Capture or reporting failures are logged, never raised.
    pub async fn log_step(
        &self,
        step_id: &str,
        description: &str,
        status: StepStatus,
        data: Option<Value>,
        take_screenshot: bool,
    ) {
        let screenshot = if take_screenshot {
            match self.capture_screenshot(step_id).await {
                Ok(path) => Some(path),
                Err(e) => {
                    tracing::warn!(execution_id = %self.execution_id, step_id, error = %e, "Screenshot skipped");
                    None
                }
            }
        } else {
            None
        };

        let level = match status {
            StepStatus::Failed => LogLevel::Error,
            _ => LogLevel::Info,
        };
        self.log(&format!("Step {step_id} {status}: {description}"), level, Some(step_id))
            .await;

        let step = StepReport {
            execution_id: self.execution_id.clone(),
            step_id: step_id.to_string(),
            description: description.to_string(),
            status,
            data,
            screenshot,
            timestamp: Utc::now(),
        };
        self.steps.lock().push(step.clone());

        if let Err(e) = self.services.api.log_step(&step).await {
            tracing::warn!(execution_id = %self.execution_id, step_id, error = %e, "Failed to report step");
        }
    }

    async fn capture_screenshot(&self, step_id: &str) -> Result<PathBuf, CaptureError> {
        if self.services.headless {
            return Err(CaptureError::Headless);
        }
        let workspace = self.workspace.get().ok_or_else(|| {
            CaptureError::Failed("working directory not initialized".to_string())
        })?;
        let path = workspace.screenshot_path(step_id);
        self.services.capture.capture(&path).await?;
        Ok(path)
    }

    /// Steps recorded so far, in order.
    pub fn steps(&self) -> Vec<StepReport> {
        self.steps.lock().clone()
    }

    /// Fetch an asset, using the per-execution cache.
    ///
    /// Missing assets and fetch failures both return `None`.
    pub async fn get_asset(&self, asset_id: &str) -> Option<SecretString> {
        let mut assets = self.assets.lock().await;
        if let Some(value) = assets.get(asset_id) {
            return Some(SecretString::from(value.expose_secret().to_owned()));
        }

        match self.services.api.get_asset(asset_id).await {
            Ok(Some(value)) => {
                let copy = SecretString::from(value.expose_secret().to_owned());
                assets.insert(asset_id.to_string(), value);
                Some(copy)
            }
            Ok(None) => {
                tracing::warn!(execution_id = %self.execution_id, asset_id, "Asset not found");
                None
            }
            Err(e) => {
                tracing::warn!(execution_id = %self.execution_id, asset_id, error = %e, "Asset fetch failed");
                None
            }
        }
    }

    /// Fetch every asset listed by the assignment. Returns how many resolved.
    pub async fn prefetch_assets(&self) -> usize {
        let mut resolved = 0;
        for asset_id in &self.asset_ids {
            if self.get_asset(asset_id).await.is_some() {
                resolved += 1;
            }
        }
        if resolved < self.asset_ids.len() {
            tracing::warn!(
                execution_id = %self.execution_id,
                requested = self.asset_ids.len(),
                resolved,
                "Some assets could not be fetched"
            );
        }
        resolved
    }

    /// Store the final result and write it to `results.json`.
    pub async fn set_result(&self, result: Value) {
        *self.result.lock() = Some(result.clone());
        let Some(workspace) = self.workspace.get() else {
            return;
        };
        if let Err(e) = workspace
            .write_json(paths::RESULTS, "results", &result)
            .await
        {
            tracing::warn!(execution_id = %self.execution_id, error = %e, "Failed to write results file");
        }
    }

    pub fn result(&self) -> Option<Value> {
        self.result.lock().clone()
    }

    /// Wall-clock time since the context was created.
    pub fn execution_duration(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token cancelled when the execution is stopped or times out.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("execution_id", &self.execution_id)
            .field("job_id", &self.job_id)
            .field("package_id", &self.package_id)
            .field("working_dir", &self.working_dir())
            .finish_non_exhaustive()
    }
}
