//! Job polling.

use futures::future::join_all;

use crate::api::ServerApi;
use crate::error::TransportError;
use crate::execution::JobExecutor;

/// Fetch newly assigned jobs and start each one. Returns how many were
/// received.
///
/// Jobs are started concurrently; a job that fails to start is logged and
/// does not affect the others.
pub async fn poll_once(api: &dyn ServerApi, executor: &JobExecutor) -> Result<usize, TransportError> {
    let jobs = api.poll_jobs().await?;
    if jobs.is_empty() {
        return Ok(0);
    }

    let count = jobs.len();
    tracing::info!(count, "Received job assignments");

    let starts = jobs.into_iter().map(|job| async move {
        let execution_id = job.execution_id.clone();
        (execution_id, executor.execute_job(job).await)
    });
    for (execution_id, result) in join_all(starts).await {
        if let Err(e) = result {
            tracing::warn!(execution_id = %execution_id, kind = e.kind(), error = %e, "Job did not start");
        }
    }
    Ok(count)
}
