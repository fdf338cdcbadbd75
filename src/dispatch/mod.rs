//! Dispatch loop: registration, heartbeat, job polling and cache upkeep.

pub mod backoff;
pub mod heartbeat;
pub mod poller;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::api::ServerApi;
use crate::config::AgentConfig;
use crate::error::TransportError;
use crate::execution::JobExecutor;
use crate::identity::AgentIdentity;
use crate::package::PackageCache;

pub use backoff::Backoff;
pub use heartbeat::{MetricsCollector, heartbeat_once};
pub use poller::poll_once;

/// How often cached packages older than `cache_max_age` are evicted.
pub const JANITOR_INTERVAL: Duration = Duration::from_secs(3600);

/// Timing and persistence settings for the dispatch loops.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
    pub retry_max: Duration,
    pub janitor_interval: Duration,
    pub cache_max_age: Duration,
    pub identity_path: PathBuf,
}

impl DispatchSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval,
            poll_interval: config.poll_interval,
            retry_max: config.retry_max,
            janitor_interval: JANITOR_INTERVAL,
            cache_max_age: config.cache_max_age,
            identity_path: config.identity_path(),
        }
    }
}

/// Drives the agent's conversation with the server.
///
/// Runs three loops until shut down: heartbeat (metrics up, commands
/// down), job polling, and periodic cache eviction. Transport failures
/// never end a loop; they switch it to exponential backoff until the next
/// success.
pub struct Dispatcher {
    api: Arc<dyn ServerApi>,
    executor: Arc<JobExecutor>,
    cache: Arc<PackageCache>,
    identity: Mutex<AgentIdentity>,
    metrics: parking_lot::Mutex<MetricsCollector>,
    settings: DispatchSettings,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        api: Arc<dyn ServerApi>,
        executor: Arc<JobExecutor>,
        cache: Arc<PackageCache>,
        identity: AgentIdentity,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            api,
            executor,
            cache,
            identity: Mutex::new(identity),
            metrics: parking_lot::Mutex::new(MetricsCollector::new()),
            settings,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops every loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Agent id currently assigned by the server.
    pub async fn agent_id(&self) -> Option<String> {
        self.identity.lock().await.agent_id.clone()
    }

    /// Register, then run all loops until shutdown.
    pub async fn run(self: Arc<Self>) {
        let Some(agent_id) = self.register_agent().await else {
            tracing::info!("Shutdown requested before registration completed");
            return;
        };
        tracing::info!(agent_id = %agent_id, "Dispatch loop started");

        let heartbeat = tokio::spawn({
            let this = Arc::clone(&self);
            async move { this.run_heartbeat().await }
        });
        let poller = tokio::spawn({
            let this = Arc::clone(&self);
            async move { this.run_poller().await }
        });
        let janitor = tokio::spawn({
            let this = Arc::clone(&self);
            async move { this.run_janitor().await }
        });

        for result in futures::future::join_all([heartbeat, poller, janitor]).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Dispatch task panicked");
            }
        }
        tracing::info!("Dispatch loop stopped");
    }

    /// Register with the server, retrying with backoff until it accepts.
    /// Returns `None` if shut down first.
    pub async fn register_agent(&self) -> Option<String> {
        let mut backoff = Backoff::new(self.settings.poll_interval, self.settings.retry_max);
        loop {
            match self.register_once().await {
                Ok(agent_id) => return Some(agent_id),
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        error = %e,
                        failures = backoff.failures(),
                        retry_in_ms = delay.as_millis() as u64,
                        "Registration failed"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn register_once(&self) -> Result<String, TransportError> {
        let mut identity = self.identity.lock().await;
        let registration = self.api.register(&identity).await?;
        if identity.assign_agent_id(registration.agent_id.clone())
            && let Err(e) = identity.save(&self.settings.identity_path).await
        {
            tracing::warn!(error = %e, "Failed to persist agent identity");
        }
        tracing::info!(agent_id = %registration.agent_id, "Registered with server");
        Ok(registration.agent_id)
    }

    async fn heartbeat_tick(&self) -> Result<(), TransportError> {
        let agent_id = self.agent_id().await;
        let active = self.executor.active_count().await;
        let metrics = self.metrics.lock().sample(agent_id, active);

        match heartbeat_once(self.api.as_ref(), &self.executor, &self.cache, metrics).await {
            Ok(_) => Ok(()),
            Err(e) => {
                if needs_registration(&e) {
                    tracing::warn!(error = %e, "Server no longer recognizes this agent, re-registering");
                    if let Err(reg) = self.register_once().await {
                        tracing::warn!(error = %reg, "Re-registration failed");
                    }
                }
                Err(e)
            }
        }
    }

    async fn poll_tick(&self) -> Result<(), TransportError> {
        poll_once(self.api.as_ref(), &self.executor).await.map(|_| ())
    }

    async fn run_heartbeat(&self) {
        run_loop(
            "heartbeat",
            self.settings.heartbeat_interval,
            self.settings.retry_max,
            &self.shutdown,
            || self.heartbeat_tick(),
        )
        .await;
    }

    async fn run_poller(&self) {
        run_loop(
            "poll",
            self.settings.poll_interval,
            self.settings.retry_max,
            &self.shutdown,
            || self.poll_tick(),
        )
        .await;
    }

    async fn run_janitor(&self) {
        let mut ticker = tokio::time::interval(self.settings.janitor_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            match self.cache.evict(self.settings.cache_max_age).await {
                Ok(0) => {}
                Ok(count) => tracing::info!(count, "Evicted stale packages"),
                Err(e) => tracing::warn!(error = %e, "Periodic cache eviction failed"),
            }
        }
    }
}

fn needs_registration(err: &TransportError) -> bool {
    matches!(
        err,
        TransportError::NotRegistered | TransportError::Status { status: 401 | 404, .. }
    )
}

/// Run `tick` every `interval` until `shutdown` fires. The first tick runs
/// immediately; failures back off up to `retry_max`.
async fn run_loop<F, Fut>(
    name: &'static str,
    interval: Duration,
    retry_max: Duration,
    shutdown: &CancellationToken,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), TransportError>>,
{
    let mut backoff = Backoff::new(interval, retry_max);
    let mut delay = Duration::ZERO;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!(task = name, "Loop stopped");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        delay = match tick().await {
            Ok(()) => {
                if backoff.failures() > 0 {
                    tracing::info!(task = name, failures = backoff.failures(), "Server reachable again");
                }
                backoff.reset()
            }
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    task = name,
                    error = %e,
                    failures = backoff.failures(),
                    retry_in_ms = delay.as_millis() as u64,
                    "Server call failed, backing off"
                );
                delay
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::api::testing::FakeServer;
    use crate::api::{JobAssignment, ServerCommand};
    use crate::execution::{ExecutionStatus, ExecutorDeps, ExecutorSettings, RunOutcome};
    use crate::package::DependencyInstaller;
    use crate::package::archive::build_archive;
    use crate::runner::NativeLoader;
    use crate::runner::native::from_fn;
    use crate::screenshot::NoCapture;

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        _dir: TempDir,
        server: Arc<FakeServer>,
        cache: Arc<PackageCache>,
        executor: Arc<JobExecutor>,
        dispatcher: Arc<Dispatcher>,
    }

    async fn harness(server: FakeServer) -> Harness {
        let dir = TempDir::new().unwrap();
        let server = Arc::new(server.with_package(
            "bot",
            build_archive(&[
                ("manifest.json", r#"{"name":"bot","version":"1.0","entry_point":"main.py"}"#),
                ("main.py", "# native"),
            ]),
        ));
        let api = Arc::clone(&server) as Arc<dyn ServerApi>;
        let cache = Arc::new(
            PackageCache::open(
                dir.path().join("packages"),
                Arc::clone(&api),
                DependencyInstaller::new(vec!["true".into()]),
                Duration::from_secs(3600),
            )
            .await
            .unwrap(),
        );

        let loader = NativeLoader::new();
        loader
            .register(
                "main.py",
                from_fn(|ctx| async move {
                    if ctx.parameter("wait").is_some() {
                        ctx.cancellation().cancelled().await;
                    }
                    Ok(RunOutcome::from_value(json!({"success": true})))
                }),
            )
            .await;

        let executor = Arc::new(JobExecutor::new(
            ExecutorDeps {
                api: Arc::clone(&api),
                cache: Arc::clone(&cache),
                loader: Arc::new(loader),
                capture: Arc::new(NoCapture),
            },
            ExecutorSettings {
                work_dir: dir.path().join("executions"),
                default_timeout: Duration::from_secs(60),
                headless: true,
            },
        ));

        let config = AgentConfig::default();
        let settings = DispatchSettings {
            heartbeat_interval: Duration::from_millis(20),
            poll_interval: Duration::from_millis(20),
            retry_max: Duration::from_millis(50),
            janitor_interval: JANITOR_INTERVAL,
            cache_max_age: Duration::from_secs(3600),
            identity_path: dir.path().join("identity.json"),
        };
        let dispatcher = Arc::new(Dispatcher::new(
            api,
            Arc::clone(&executor),
            Arc::clone(&cache),
            AgentIdentity::new(&config),
            settings,
        ));

        Harness {
            _dir: dir,
            server,
            cache,
            executor,
            dispatcher,
        }
    }

    fn job(execution_id: &str, wait: bool) -> JobAssignment {
        let mut parameters = serde_json::Map::new();
        if wait {
            parameters.insert("wait".into(), json!(true));
        }
        JobAssignment {
            execution_id: execution_id.into(),
            job_id: "job-1".into(),
            package_id: "bot".into(),
            parameters,
            ..JobAssignment::default()
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !check() {
            assert!(tokio::time::Instant::now() < deadline, "condition not reached");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn registration_retries_and_persists_agent_id() {
        let h = harness(FakeServer::default()).await;
        h.server.failures.store(2, Ordering::SeqCst);

        let agent_id = h.dispatcher.register_agent().await.unwrap();
        assert_eq!(agent_id, "agent-0");
        assert_eq!(h.dispatcher.agent_id().await.as_deref(), Some("agent-0"));

        let saved = std::fs::read_to_string(&h.dispatcher.settings.identity_path).unwrap();
        assert!(saved.contains("agent-0"));
    }

    #[tokio::test]
    async fn registration_gives_up_on_shutdown() {
        let h = harness(FakeServer::default()).await;
        h.server.offline.store(true, Ordering::SeqCst);
        h.dispatcher.shutdown();
        assert!(h.dispatcher.register_agent().await.is_none());
    }

    #[tokio::test]
    async fn poll_starts_every_assignment() {
        let h = harness(FakeServer::default()).await;
        h.server
            .jobs
            .lock()
            .push_back(vec![job("e1", false), job("e2", false), job("e1", false)]);

        let received = poll_once(h.server.as_ref(), &h.executor).await.unwrap();
        assert_eq!(received, 3);

        for id in ["e1", "e2"] {
            let record = h.executor.wait_for_terminal(id, WAIT).await.unwrap();
            assert_eq!(record.status, ExecutionStatus::Completed);
        }
    }

    #[tokio::test]
    async fn heartbeat_applies_stop_command() {
        let h = harness(FakeServer::default()).await;
        h.executor.execute_job(job("e1", true)).await.unwrap();

        h.server.commands.lock().push(ServerCommand::StopJob {
            execution_id: "e1".into(),
        });
        h.dispatcher.heartbeat_tick().await.unwrap();

        let record = h.executor.wait_for_terminal("e1", WAIT).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Cancelled);

        let metrics = h.server.heartbeats.lock()[0].clone();
        assert_eq!(metrics.active_executions, 1);
    }

    #[tokio::test]
    async fn heartbeat_applies_evict_command() {
        let h = harness(FakeServer::default()).await;
        h.executor.execute_job(job("e1", false)).await.unwrap();
        h.executor.wait_for_terminal("e1", WAIT).await.unwrap();
        assert_eq!(h.cache.entries().await.len(), 1);

        h.server.commands.lock().extend([
            ServerCommand::Unknown,
            ServerCommand::EvictCache { max_age_secs: 0 },
        ]);
        h.dispatcher.heartbeat_tick().await.unwrap();

        assert!(h.cache.entries().await.is_empty());
    }

    #[tokio::test]
    async fn loops_survive_outage_and_stop_on_shutdown() {
        let h = harness(FakeServer::default()).await;
        let run = tokio::spawn(Arc::clone(&h.dispatcher).run());

        let server = Arc::clone(&h.server);
        wait_until(|| !server.heartbeats.lock().is_empty()).await;

        h.server.offline.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.server.offline.store(false, Ordering::SeqCst);

        h.server.jobs.lock().push_back(vec![job("late", false)]);
        let record = h.executor.wait_for_terminal("late", WAIT).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);

        h.dispatcher.shutdown();
        tokio::time::timeout(WAIT, run).await.unwrap().unwrap();
    }

    #[test]
    fn registration_errors_are_detected() {
        assert!(needs_registration(&TransportError::NotRegistered));
        assert!(needs_registration(&TransportError::Status {
            endpoint: "heartbeat".into(),
            status: 404,
            body: String::new(),
        }));
        assert!(!needs_registration(&TransportError::Request {
            endpoint: "heartbeat".into(),
            reason: "timeout".into(),
        }));
    }
}
