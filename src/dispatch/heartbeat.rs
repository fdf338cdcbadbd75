//! Heartbeat: resource metrics up, server commands down.

use std::time::Duration;

use chrono::Utc;
use sysinfo::{Disks, System};

use crate::api::{HeartbeatMetrics, ServerApi, ServerCommand};
use crate::error::TransportError;
use crate::execution::JobExecutor;
use crate::package::PackageCache;

/// Samples host CPU, memory and disk utilization.
pub struct MetricsCollector {
    system: System,
    disks: Disks,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        Self {
            system,
            disks: Disks::new_with_refreshed_list(),
        }
    }

    /// Current utilization, in percent.
    pub fn sample(&mut self, agent_id: Option<String>, active_executions: usize) -> HeartbeatMetrics {
        self.system.refresh_cpu();
        self.system.refresh_memory();
        self.disks.refresh();

        let cpu_percent = self.system.global_cpu_info().cpu_usage().clamp(0.0, 100.0);
        let memory_percent = percent(self.system.used_memory(), self.system.total_memory());

        let (used, total) = self
            .disks
            .list()
            .iter()
            .fold((0u64, 0u64), |(used, total), disk| {
                (
                    used + disk.total_space().saturating_sub(disk.available_space()),
                    total + disk.total_space(),
                )
            });

        HeartbeatMetrics {
            agent_id,
            cpu_percent,
            memory_percent,
            disk_percent: percent(used, total),
            active_executions,
            timestamp: Utc::now(),
        }
    }
}

fn percent(used: u64, total: u64) -> f32 {
    if total == 0 {
        return 0.0;
    }
    ((used as f64 / total as f64) * 100.0).clamp(0.0, 100.0) as f32
}

/// Send one heartbeat and apply the commands that come back.
pub async fn heartbeat_once(
    api: &dyn ServerApi,
    executor: &JobExecutor,
    cache: &PackageCache,
    metrics: HeartbeatMetrics,
) -> Result<usize, TransportError> {
    let response = api.heartbeat(&metrics).await?;
    tracing::debug!(
        cpu = metrics.cpu_percent,
        memory = metrics.memory_percent,
        active = metrics.active_executions,
        commands = response.commands.len(),
        "Heartbeat sent"
    );

    let count = response.commands.len();
    for command in response.commands {
        handle_command(executor, cache, command).await;
    }
    Ok(count)
}

async fn handle_command(executor: &JobExecutor, cache: &PackageCache, command: ServerCommand) {
    match command {
        ServerCommand::StopJob { execution_id } => {
            tracing::info!(execution_id = %execution_id, "Server requested stop");
            if let Err(e) = executor.stop_job(&execution_id).await {
                tracing::warn!(execution_id = %execution_id, error = %e, "Stop request not applied");
            }
        }
        ServerCommand::EvictCache { max_age_secs } => {
            match cache.evict(Duration::from_secs(max_age_secs)).await {
                Ok(count) => tracing::info!(count, max_age_secs, "Cache eviction requested by server"),
                Err(e) => tracing::warn!(error = %e, "Cache eviction failed"),
            }
        }
        ServerCommand::Unknown => {
            tracing::warn!("Ignoring unknown server command");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_handles_zero_total() {
        assert_eq!(percent(5, 0), 0.0);
        assert_eq!(percent(50, 200), 25.0);
        assert_eq!(percent(300, 200), 100.0);
    }

    #[test]
    fn sample_is_in_range() {
        let mut collector = MetricsCollector::new();
        let metrics = collector.sample(Some("agent-1".into()), 2);
        assert_eq!(metrics.agent_id.as_deref(), Some("agent-1"));
        assert_eq!(metrics.active_executions, 2);
        for value in [metrics.cpu_percent, metrics.memory_percent, metrics.disk_percent] {
            assert!((0.0..=100.0).contains(&value), "{value}");
        }
    }
}
