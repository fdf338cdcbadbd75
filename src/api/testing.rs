//! In-memory [`ServerApi`] used by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use secrecy::SecretString;

use crate::api::{
    HeartbeatMetrics, HeartbeatResponse, JobAssignment, Registration, ServerApi, ServerCommand,
    StatusUpdate, StepReport,
};
use crate::error::TransportError;
use crate::execution::ExecutionStatus;
use crate::identity::AgentIdentity;

#[derive(Default)]
pub(crate) struct FakeServer {
    pub packages: Mutex<HashMap<String, Vec<u8>>>,
    pub assets: Mutex<HashMap<String, String>>,
    pub statuses: Mutex<Vec<StatusUpdate>>,
    pub steps: Mutex<Vec<StepReport>>,
    pub heartbeats: Mutex<Vec<HeartbeatMetrics>>,
    pub commands: Mutex<Vec<ServerCommand>>,
    pub jobs: Mutex<VecDeque<Vec<JobAssignment>>>,
    pub remote_status: Mutex<HashMap<String, ExecutionStatus>>,
    pub downloads: AtomicUsize,
    pub asset_fetches: AtomicUsize,
    pub registrations: AtomicUsize,
    /// Number of upcoming calls that fail with a transport error.
    pub failures: AtomicUsize,
    pub offline: AtomicBool,
}

impl FakeServer {
    pub fn with_package(self, package_id: &str, archive: Vec<u8>) -> Self {
        self.packages.lock().insert(package_id.to_string(), archive);
        self
    }

    pub fn with_asset(self, asset_id: &str, value: &str) -> Self {
        self.assets
            .lock()
            .insert(asset_id.to_string(), value.to_string());
        self
    }

    pub fn statuses_for(&self, execution_id: &str) -> Vec<StatusUpdate> {
        self.statuses
            .lock()
            .iter()
            .filter(|u| u.execution_id == execution_id)
            .cloned()
            .collect()
    }

    fn check(&self, endpoint: &str) -> Result<(), TransportError> {
        let down = self.offline.load(Ordering::SeqCst)
            || self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if down {
            return Err(TransportError::Request {
                endpoint: endpoint.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ServerApi for FakeServer {
    async fn register(&self, _identity: &AgentIdentity) -> Result<Registration, TransportError> {
        self.check("register")?;
        let n = self.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(Registration {
            agent_id: format!("agent-{n}"),
            api_key: SecretString::from("issued-key"),
        })
    }

    async fn heartbeat(
        &self,
        metrics: &HeartbeatMetrics,
    ) -> Result<HeartbeatResponse, TransportError> {
        self.check("heartbeat")?;
        self.heartbeats.lock().push(metrics.clone());
        Ok(HeartbeatResponse {
            commands: std::mem::take(&mut *self.commands.lock()),
        })
    }

    async fn poll_jobs(&self) -> Result<Vec<JobAssignment>, TransportError> {
        self.check("poll_jobs")?;
        Ok(self.jobs.lock().pop_front().unwrap_or_default())
    }

    async fn update_status(&self, update: &StatusUpdate) -> Result<(), TransportError> {
        self.statuses.lock().push(update.clone());
        Ok(())
    }

    async fn log_step(&self, step: &StepReport) -> Result<(), TransportError> {
        self.steps.lock().push(step.clone());
        Ok(())
    }

    async fn get_asset(&self, asset_id: &str) -> Result<Option<SecretString>, TransportError> {
        self.asset_fetches.fetch_add(1, Ordering::SeqCst);
        self.check("get_asset")?;
        Ok(self
            .assets
            .lock()
            .get(asset_id)
            .map(|v| SecretString::from(v.clone())))
    }

    async fn download_package(
        &self,
        package_id: &str,
        _version: Option<&str>,
    ) -> Result<Vec<u8>, TransportError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.check("download_package")?;
        self.packages
            .lock()
            .get(package_id)
            .cloned()
            .ok_or_else(|| TransportError::Status {
                endpoint: "download_package".to_string(),
                status: 404,
                body: "package not found".to_string(),
            })
    }

    async fn execution_status(
        &self,
        execution_id: &str,
    ) -> Result<Option<ExecutionStatus>, TransportError> {
        self.check("execution_status")?;
        Ok(self.remote_status.lock().get(execution_id).copied())
    }
}
