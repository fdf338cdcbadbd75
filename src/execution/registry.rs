//! Registry of execution records and in-flight executions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::JobError;
use crate::execution::state::{ExecutionRecord, ExecutionStatus};

/// Why an execution's token was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Timeout(Duration),
    Stopped,
}

/// Control handle of an in-flight execution.
#[derive(Debug, Clone)]
pub struct ActiveExecution {
    pub cancel: CancellationToken,
    reason: Arc<Mutex<Option<CancelReason>>>,
}

impl ActiveExecution {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            reason: Arc::new(Mutex::new(None)),
        }
    }

    /// Cancel with a reason. The first reason recorded wins.
    pub fn cancel_with(&self, reason: CancelReason) {
        self.reason.lock().get_or_insert(reason);
        self.cancel.cancel();
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.reason.lock()
    }
}

/// Diagnostic view of an in-flight execution.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveSummary {
    pub execution_id: String,
    pub job_id: String,
    pub package_id: String,
    pub status: ExecutionStatus,
    pub elapsed_secs: f64,
}

#[derive(Default)]
struct Inner {
    records: HashMap<String, ExecutionRecord>,
    active: HashMap<String, ActiveExecution>,
}

/// Owns every execution record for the lifetime of the process.
#[derive(Default)]
pub struct ExecutionRegistry {
    inner: RwLock<Inner>,
    terminal: Notify,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new execution as in flight.
    ///
    /// Fails with `ConcurrencyViolation` if the id is already in flight; the
    /// existing execution is left untouched.
    pub async fn admit(
        &self,
        record: ExecutionRecord,
        handle: ActiveExecution,
    ) -> Result<(), JobError> {
        let mut inner = self.inner.write().await;
        let execution_id = record.execution_id.clone();
        if inner.active.contains_key(&execution_id) {
            return Err(JobError::ConcurrencyViolation { execution_id });
        }
        inner.active.insert(execution_id.clone(), handle);
        inner.records.insert(execution_id, record);
        Ok(())
    }

    /// Store a record that never went in flight. Returns `false` when the id
    /// belongs to an in-flight execution, which is left untouched.
    pub async fn record_rejected(&self, record: ExecutionRecord) -> bool {
        let mut inner = self.inner.write().await;
        if inner.active.contains_key(&record.execution_id) {
            return false;
        }
        inner.records.insert(record.execution_id.clone(), record);
        drop(inner);
        self.terminal.notify_waiters();
        true
    }

    pub async fn get(&self, execution_id: &str) -> Option<ExecutionRecord> {
        self.inner.read().await.records.get(execution_id).cloned()
    }

    /// Mutate a record in place.
    pub async fn update<F, R>(&self, execution_id: &str, f: F) -> Result<R, JobError>
    where
        F: FnOnce(&mut ExecutionRecord) -> R,
    {
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .get_mut(execution_id)
            .ok_or_else(|| JobError::NotFound {
                execution_id: execution_id.to_string(),
            })?;
        let terminal_before = record.status.is_terminal();
        let out = f(&mut *record);
        let became_terminal = !terminal_before && record.status.is_terminal();
        drop(inner);
        if became_terminal {
            self.terminal.notify_waiters();
        }
        Ok(out)
    }

    pub async fn handle(&self, execution_id: &str) -> Option<ActiveExecution> {
        self.inner.read().await.active.get(execution_id).cloned()
    }

    /// Stop tracking an execution as in flight.
    pub async fn release(&self, execution_id: &str) -> Option<ActiveExecution> {
        let removed = self.inner.write().await.active.remove(execution_id);
        self.terminal.notify_waiters();
        removed
    }

    pub async fn active_count(&self) -> usize {
        self.inner.read().await.active.len()
    }

    pub async fn active_handles(&self) -> Vec<ActiveExecution> {
        self.inner.read().await.active.values().cloned().collect()
    }

    /// Snapshot of in-flight executions, oldest first.
    pub async fn active(&self) -> Vec<ActiveSummary> {
        let inner = self.inner.read().await;
        let mut out: Vec<ActiveSummary> = inner
            .active
            .keys()
            .filter_map(|id| inner.records.get(id))
            .map(|record| ActiveSummary {
                execution_id: record.execution_id.clone(),
                job_id: record.job_id.clone(),
                package_id: record.package_id.clone(),
                status: record.status,
                elapsed_secs: record.elapsed().as_secs_f64(),
            })
            .collect();
        out.sort_by(|a, b| b.elapsed_secs.total_cmp(&a.elapsed_secs));
        out
    }

    /// Wait until the record is terminal and no longer in flight.
    pub async fn wait_for_terminal(
        &self,
        execution_id: &str,
        timeout: Duration,
    ) -> Option<ExecutionRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.terminal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let inner = self.inner.read().await;
                if let Some(record) = inner.records.get(execution_id)
                    && record.status.is_terminal()
                    && !inner.active.contains_key(execution_id)
                {
                    return Some(record.clone());
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.get(execution_id).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::JobAssignment;

    fn record(id: &str) -> ExecutionRecord {
        ExecutionRecord::new(&JobAssignment {
            execution_id: id.into(),
            job_id: "job".into(),
            package_id: "pkg".into(),
            ..JobAssignment::default()
        })
    }

    #[tokio::test]
    async fn duplicate_admission_is_rejected() {
        let registry = ExecutionRegistry::new();
        registry
            .admit(record("e1"), ActiveExecution::new(CancellationToken::new()))
            .await
            .unwrap();
        registry
            .update("e1", |r| r.transition_to(ExecutionStatus::Running, None))
            .await
            .unwrap()
            .unwrap();

        let err = registry
            .admit(record("e1"), ActiveExecution::new(CancellationToken::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::ConcurrencyViolation { .. }));
        assert_eq!(registry.get("e1").await.unwrap().status, ExecutionStatus::Running);
        assert_eq!(registry.active_count().await, 1);
    }

    #[tokio::test]
    async fn rejected_record_never_replaces_in_flight() {
        let registry = ExecutionRegistry::new();
        registry
            .admit(record("e1"), ActiveExecution::new(CancellationToken::new()))
            .await
            .unwrap();
        assert!(!registry.record_rejected(record("e1")).await);
        assert!(registry.record_rejected(record("e2")).await);
        assert_eq!(registry.active_count().await, 1);
    }

    #[tokio::test]
    async fn update_unknown_is_not_found() {
        let registry = ExecutionRegistry::new();
        let err = registry.update("nope", |_| ()).await.unwrap_err();
        assert!(matches!(err, JobError::NotFound { .. }));
    }

    #[test]
    fn first_cancel_reason_wins() {
        let handle = ActiveExecution::new(CancellationToken::new());
        handle.cancel_with(CancelReason::Stopped);
        handle.cancel_with(CancelReason::Timeout(Duration::from_secs(1)));
        assert_eq!(handle.reason(), Some(CancelReason::Stopped));
        assert!(handle.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn wait_for_terminal_wakes_on_release() {
        let registry = Arc::new(ExecutionRegistry::new());
        registry
            .admit(record("e1"), ActiveExecution::new(CancellationToken::new()))
            .await
            .unwrap();

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .wait_for_terminal("e1", Duration::from_secs(5))
                    .await
            })
        };

        registry
            .update("e1", |r| {
                r.transition_to(ExecutionStatus::Running, None)?;
                r.finish(ExecutionStatus::Completed, None, None)
            })
            .await
            .unwrap()
            .unwrap();
        registry.release("e1").await;

        let record = waiter.await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn wait_for_terminal_times_out() {
        let registry = ExecutionRegistry::new();
        registry
            .admit(record("e1"), ActiveExecution::new(CancellationToken::new()))
            .await
            .unwrap();
        let record = registry
            .wait_for_terminal("e1", Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(record.status, ExecutionStatus::Pending);
    }

    #[tokio::test]
    async fn active_lists_in_flight_only() {
        let registry = ExecutionRegistry::new();
        registry
            .admit(record("e1"), ActiveExecution::new(CancellationToken::new()))
            .await
            .unwrap();
        registry.record_rejected(record("e2")).await;

        let active = registry.active().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].execution_id, "e1");
    }
}
