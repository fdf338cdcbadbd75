//! Job executor: turns assignments into supervised executions.
//!
//! `execute_job` does the synchronous part (validation, admission, package
//! resolution) and hands the run itself to a tracked task, so the dispatch
//! path returns as soon as the job is underway.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::api::{JobAssignment, ServerApi, StatusUpdate, StepStatus};
use crate::config::AgentConfig;
use crate::error::{JobError, TransportError};
use crate::execution::context::{ContextServices, ExecutionContext, LogLevel};
use crate::execution::outcome::RunOutcome;
use crate::execution::registry::{ActiveExecution, ActiveSummary, CancelReason, ExecutionRegistry};
use crate::execution::state::{ExecutionRecord, ExecutionStatus};
use crate::package::{PackageCache, PackageDescriptor, PackageLease, locate_entry_point};
use crate::runner::{LoadTarget, PackageLoader};
use crate::screenshot::ScreenCapture;

/// Error string recorded for executions stopped on request.
const STOPPED_MESSAGE: &str = "Stopped by request";

/// Collaborators the executor needs.
#[derive(Clone)]
pub struct ExecutorDeps {
    pub api: Arc<dyn ServerApi>,
    pub cache: Arc<PackageCache>,
    pub loader: Arc<dyn PackageLoader>,
    pub capture: Arc<dyn ScreenCapture>,
}

/// Executor tunables.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Base directory for per-execution working directories.
    pub work_dir: PathBuf,
    /// Timeout for assignments that carry none.
    pub default_timeout: Duration,
    pub headless: bool,
}

impl ExecutorSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            work_dir: config.work_dir(),
            default_timeout: config.default_job_timeout,
            headless: config.headless,
        }
    }
}

/// Runs job assignments and owns their execution records.
pub struct JobExecutor {
    deps: ExecutorDeps,
    settings: ExecutorSettings,
    registry: Arc<ExecutionRegistry>,
    tasks: TaskTracker,
}

impl JobExecutor {
    pub fn new(deps: ExecutorDeps, settings: ExecutorSettings) -> Self {
        Self {
            deps,
            settings,
            registry: Arc::new(ExecutionRegistry::new()),
            tasks: TaskTracker::new(),
        }
    }

    /// Accept an assignment and start running it.
    ///
    /// Returns once the job is running in the background, or with the error
    /// that ended it early. Early failures are reported upstream except
    /// `ConcurrencyViolation`, which leaves the original execution alone.
    pub async fn execute_job(&self, assignment: JobAssignment) -> Result<(), JobError> {
        if let Err(err) = assignment.validate() {
            tracing::warn!(execution_id = %assignment.execution_id, error = %err, "Rejecting job assignment");
            self.reject(&assignment, &err).await;
            return Err(err);
        }

        let execution_id = assignment.execution_id.clone();
        let handle = ActiveExecution::new(CancellationToken::new());
        if let Err(err) = self
            .registry
            .admit(ExecutionRecord::new(&assignment), handle.clone())
            .await
        {
            tracing::warn!(execution_id = %execution_id, "Duplicate execution rejected");
            return Err(err);
        }

        let started = self
            .registry
            .update(&execution_id, |r| {
                r.transition_to(ExecutionStatus::Running, Some("accepted".to_string()))
            })
            .await
            .and_then(|r| r);
        if let Err(err) = started {
            // stopped before it started
            self.registry.release(&execution_id).await;
            return Err(err);
        }
        tracing::info!(
            execution_id = %execution_id,
            job_id = %assignment.job_id,
            package_id = %assignment.package_id,
            "Execution running"
        );
        report(
            self.deps.api.as_ref(),
            &execution_id,
            ExecutionStatus::Running,
            None,
            None,
        )
        .await;

        let ctx = Arc::new(ExecutionContext::new(
            &assignment,
            ContextServices {
                api: Arc::clone(&self.deps.api),
                capture: Arc::clone(&self.deps.capture),
                headless: self.settings.headless,
            },
            handle.cancel.clone(),
        ));

        if let Err(e) = ctx.setup_workspace(&self.settings.work_dir).await {
            return Err(self.fail_early(&execution_id, JobError::from(e)).await);
        }

        let lease = match self
            .deps
            .cache
            .resolve(&assignment.package_id, assignment.version.as_deref(), false)
            .await
        {
            Ok(lease) => lease,
            Err(e) => {
                ctx.log(&format!("Package resolution failed: {e}"), LogLevel::Error, None)
                    .await;
                return Err(self.fail_early(&execution_id, JobError::from(e)).await);
            }
        };

        tracing::info!(execution_id = %execution_id, package_id = lease.package_id(), version = ?lease.version(), "Package ready");
        let report_issues = self.deps.cache.verify(lease.path()).await;
        for issue in &report_issues.issues {
            tracing::warn!(execution_id = %execution_id, package_id = lease.package_id(), issue = %issue, "Package verification issue");
        }

        ctx.prefetch_assets().await;

        let timeout = assignment
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.settings.default_timeout);
        let run = RunJob {
            api: Arc::clone(&self.deps.api),
            loader: Arc::clone(&self.deps.loader),
            registry: Arc::clone(&self.registry),
            ctx,
            lease,
            handle,
            timeout,
        };
        self.tasks.spawn(run.run());
        Ok(())
    }

    /// Record and report an assignment that failed validation.
    async fn reject(&self, assignment: &JobAssignment, err: &JobError) {
        if assignment.execution_id.trim().is_empty() {
            return;
        }
        let message = err.summary();
        let mut record = ExecutionRecord::new(assignment);
        if let Err(e) = record.finish(ExecutionStatus::Failed, Some(message.clone()), None) {
            tracing::warn!(error = %e, "Could not record rejected assignment");
            return;
        }
        if self.registry.record_rejected(record).await {
            report(
                self.deps.api.as_ref(),
                &assignment.execution_id,
                ExecutionStatus::Failed,
                Some(message),
                None,
            )
            .await;
        }
    }

    async fn fail_early(&self, execution_id: &str, err: JobError) -> JobError {
        tracing::error!(execution_id, error = %err, "Execution failed before start");
        finalize(
            self.deps.api.as_ref(),
            &self.registry,
            execution_id,
            ExecutionStatus::Failed,
            Some(err.summary()),
            None,
        )
        .await;
        err
    }

    /// Cancel an in-flight execution.
    ///
    /// The record becomes `cancelled` and is reported right away; the running
    /// package code is then interrupted.
    pub async fn stop_job(&self, execution_id: &str) -> Result<(), JobError> {
        let handle = self
            .registry
            .handle(execution_id)
            .await
            .ok_or_else(|| JobError::NotFound {
                execution_id: execution_id.to_string(),
            })?;

        self.registry
            .update(execution_id, |r| {
                r.finish(
                    ExecutionStatus::Cancelled,
                    Some(STOPPED_MESSAGE.to_string()),
                    None,
                )
            })
            .await??;
        tracing::info!(execution_id, "Execution cancelled");
        report(
            self.deps.api.as_ref(),
            execution_id,
            ExecutionStatus::Cancelled,
            Some(STOPPED_MESSAGE.to_string()),
            None,
        )
        .await;

        handle.cancel_with(CancelReason::Stopped);
        Ok(())
    }

    /// In-flight executions, longest running first.
    pub async fn list_active_executions(&self) -> Vec<ActiveSummary> {
        self.registry.active().await
    }

    /// In-flight executions currently in the `running` state.
    pub async fn get_running_jobs(&self) -> Vec<ActiveSummary> {
        self.registry
            .active()
            .await
            .into_iter()
            .filter(|s| s.status == ExecutionStatus::Running)
            .collect()
    }

    pub async fn active_count(&self) -> usize {
        self.registry.active_count().await
    }

    pub async fn execution(&self, execution_id: &str) -> Option<ExecutionRecord> {
        self.registry.get(execution_id).await
    }

    /// Local status, falling back to the server for unknown executions.
    pub async fn execution_status(
        &self,
        execution_id: &str,
    ) -> Result<Option<ExecutionStatus>, TransportError> {
        if let Some(record) = self.registry.get(execution_id).await {
            return Ok(Some(record.status));
        }
        self.deps.api.execution_status(execution_id).await
    }

    /// Wait until an execution has finished and been reported.
    pub async fn wait_for_terminal(
        &self,
        execution_id: &str,
        timeout: Duration,
    ) -> Option<ExecutionRecord> {
        self.registry.wait_for_terminal(execution_id, timeout).await
    }

    /// Stop every in-flight execution and wait up to `grace` for them to end.
    pub async fn shutdown(&self, grace: Duration) {
        let active = self.registry.active().await;
        if !active.is_empty() {
            tracing::info!(count = active.len(), "Stopping in-flight executions");
        }
        for summary in active {
            if let Err(e) = self.stop_job(&summary.execution_id).await {
                tracing::debug!(execution_id = %summary.execution_id, error = %e, "Stop during shutdown skipped");
            }
        }
        for handle in self.registry.active_handles().await {
            handle.cancel_with(CancelReason::Stopped);
        }

        self.tasks.close();
        if tokio::time::timeout(grace, self.tasks.wait()).await.is_err() {
            tracing::warn!(grace_secs = grace.as_secs(), "Executions still running after shutdown grace period");
        }
    }
}

/// Everything the background run of one execution needs.
struct RunJob {
    api: Arc<dyn ServerApi>,
    loader: Arc<dyn PackageLoader>,
    registry: Arc<ExecutionRegistry>,
    ctx: Arc<ExecutionContext>,
    lease: PackageLease,
    handle: ActiveExecution,
    timeout: Duration,
}

impl RunJob {
    async fn run(self) {
        let execution_id = self.ctx.execution_id().to_string();
        let watchdog = spawn_watchdog(execution_id.clone(), self.handle.clone(), self.timeout);

        let outcome = tokio::select! {
            r = invoke(self.loader.as_ref(), &self.ctx, self.lease.path()) => Some(r),
            _ = self.handle.cancel.cancelled() => None,
        };
        watchdog.abort();

        let cancelled = self.handle.cancel.is_cancelled();
        let (status, error, result) = match outcome {
            Some(Ok(outcome)) => self.completed(outcome).await,
            _ if cancelled => match self.handle.reason() {
                Some(CancelReason::Timeout(limit)) => {
                    let message = format!("Timeout: execution exceeded {}s", limit.as_secs());
                    self.ctx.log(&message, LogLevel::Error, None).await;
                    (ExecutionStatus::Failed, Some(message), self.ctx.result())
                }
                _ => (
                    ExecutionStatus::Cancelled,
                    Some(STOPPED_MESSAGE.to_string()),
                    self.ctx.result(),
                ),
            },
            Some(Err(err)) => {
                let summary = err.summary();
                self.ctx
                    .log_step("error", &summary, StepStatus::Failed, None, true)
                    .await;
                (ExecutionStatus::Failed, Some(summary), self.ctx.result())
            }
            None => (
                ExecutionStatus::Cancelled,
                Some(STOPPED_MESSAGE.to_string()),
                self.ctx.result(),
            ),
        };
        drop(self.lease);

        finalize(
            self.api.as_ref(),
            &self.registry,
            &execution_id,
            status,
            error,
            result,
        )
        .await;
        tracing::info!(
            execution_id = %execution_id,
            status = %status,
            duration_ms = self.ctx.execution_duration().as_millis() as u64,
            "Execution finished"
        );
    }

    async fn completed(&self, outcome: RunOutcome) -> (ExecutionStatus, Option<String>, Option<Value>) {
        let result = match &outcome {
            RunOutcome::Payload { result } => Value::Object(result.clone()),
            RunOutcome::ExitCode { code } => self
                .ctx
                .result()
                .unwrap_or_else(|| json!({ "success": *code == 0, "exit_code": code })),
            RunOutcome::Flag { success } => self
                .ctx
                .result()
                .unwrap_or_else(|| json!({ "success": success })),
        };
        if self.ctx.result().as_ref() != Some(&result) {
            self.ctx.set_result(result.clone()).await;
        }

        match outcome.failure_message() {
            None => (ExecutionStatus::Completed, None, Some(result)),
            Some(message) => {
                self.ctx.log(&message, LogLevel::Error, None).await;
                (ExecutionStatus::Failed, Some(message), Some(result))
            }
        }
    }
}

/// Locate, load and run the package entry point.
async fn invoke(
    loader: &dyn PackageLoader,
    ctx: &Arc<ExecutionContext>,
    package_dir: &Path,
) -> Result<RunOutcome, JobError> {
    let descriptor = match PackageDescriptor::load(package_dir).await {
        Ok(descriptor) => Some(descriptor),
        Err(e) => {
            tracing::debug!(execution_id = %ctx.execution_id(), error = %e, "No usable descriptor, using fallbacks");
            None
        }
    };
    let entry_file = locate_entry_point(package_dir, descriptor.as_ref()).await?;
    ctx.log(
        &format!("Running entry point {}", entry_file.display()),
        LogLevel::Info,
        None,
    )
    .await;

    let target = LoadTarget {
        entry_file,
        package_dir: package_dir.to_path_buf(),
        descriptor,
    };
    let entry = loader.load(&target).await?;
    Ok(entry.run(Arc::clone(ctx)).await?)
}

/// Cancel the execution once `limit` elapses.
fn spawn_watchdog(
    execution_id: String,
    handle: ActiveExecution,
    limit: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(limit) => {
                tracing::warn!(execution_id = %execution_id, timeout_secs = limit.as_secs(), "Execution exceeded its timeout, stopping it");
                handle.cancel_with(CancelReason::Timeout(limit));
            }
            _ = handle.cancel.cancelled() => {}
        }
    })
}

/// Move a record to its terminal status, report it and release it.
///
/// A record that is already terminal (stopped while running) keeps its
/// status and is not reported again.
async fn finalize(
    api: &dyn ServerApi,
    registry: &ExecutionRegistry,
    execution_id: &str,
    status: ExecutionStatus,
    error: Option<String>,
    result: Option<Value>,
) {
    let finished = registry
        .update(execution_id, |r| {
            r.finish(status, error.clone(), result.clone())
        })
        .await;
    match finished {
        Ok(Ok(())) => {
            tracing::info!(execution_id, status = %status, error = ?error, "Execution status changed");
            report(api, execution_id, status, error, result).await;
        }
        Ok(Err(e)) => {
            tracing::debug!(execution_id, error = %e, "Execution already finalized");
        }
        Err(e) => {
            tracing::warn!(execution_id, error = %e, "Execution record missing at finalize");
        }
    }
    registry.release(execution_id).await;
}

/// Send a status update. Failures are logged; the job layer never sees them.
async fn report(
    api: &dyn ServerApi,
    execution_id: &str,
    status: ExecutionStatus,
    error: Option<String>,
    results: Option<Value>,
) {
    let update = StatusUpdate {
        execution_id: execution_id.to_string(),
        status,
        error,
        results,
    };
    if let Err(e) = api.update_status(&update).await {
        tracing::warn!(execution_id, status = %status, error = %e, "Failed to report execution status");
    }
}
