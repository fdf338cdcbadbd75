use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use fleet_agent::api::{HttpServerApi, ServerApi};
use fleet_agent::config::AgentConfig;
use fleet_agent::dispatch::{DispatchSettings, Dispatcher};
use fleet_agent::execution::{ExecutorDeps, ExecutorSettings, JobExecutor};
use fleet_agent::identity::AgentIdentity;
use fleet_agent::package::{DependencyInstaller, PackageCache};
use fleet_agent::runner::ProcessLoader;
use fleet_agent::screenshot;

/// How long in-flight executions get to wind down after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AgentConfig::from_env().context("Failed to load configuration")?;
    let _log_guard = init_logging(&config)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        server = %config.server_url,
        data_dir = %config.data_dir.display(),
        headless = config.headless,
        "Starting fleet agent"
    );

    let identity = AgentIdentity::load_or_create(&config.identity_path(), &config)
        .await
        .context("Failed to load agent identity")?;

    let http = HttpServerApi::new(&config)?;
    if let Some(agent_id) = &identity.agent_id {
        http.set_agent_id(agent_id.clone()).await;
    }
    let api: Arc<dyn ServerApi> = Arc::new(http);

    let cache = Arc::new(
        PackageCache::open(
            config.cache_dir(),
            Arc::clone(&api),
            DependencyInstaller::new(config.install_command.clone()),
            config.cache_ttl,
        )
        .await
        .context("Failed to open package cache")?,
    );

    let executor = Arc::new(JobExecutor::new(
        ExecutorDeps {
            api: Arc::clone(&api),
            cache: Arc::clone(&cache),
            loader: Arc::new(ProcessLoader::new()),
            capture: screenshot::from_config(&config),
        },
        ExecutorSettings::from_config(&config),
    ));

    let dispatcher = Arc::new(Dispatcher::new(
        api,
        Arc::clone(&executor),
        cache,
        identity,
        DispatchSettings::from_config(&config),
    ));

    let mut dispatch = tokio::spawn(Arc::clone(&dispatcher).run());

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received");
        }
        result = &mut dispatch => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Dispatch loop exited unexpectedly");
            }
        }
    }

    dispatcher.shutdown();
    if !dispatch.is_finished()
        && let Err(e) = dispatch.await
    {
        tracing::error!(error = %e, "Dispatch loop failed during shutdown");
    }
    executor.shutdown(SHUTDOWN_GRACE).await;

    tracing::info!("Fleet agent stopped");
    Ok(())
}

fn init_logging(
    config: &AgentConfig,
) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let log_dir = config.log_dir();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "agent.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .init();

    Ok(guard)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
