//! Host telemetry
//!
//! Samples CPU, memory, and disk usage via sysinfo for heartbeats, the
//! `metrics` stream channel, and the `system.metrics` command.

use async_trait::async_trait;
use sysinfo::System;
use tokio::sync::Mutex;

use hawser_core::traits::{ContainerCounts, ContainerDriver, MetricsSampler, SystemMetrics};
use hawser_protocol::HeartbeatMetrics;

/// Sysinfo-backed sampler.
///
/// Keeps one `System` across samples because CPU usage is computed from
/// the delta between consecutive refreshes; a fresh instance would
/// always report zero.
pub struct SysinfoSampler {
    system: Mutex<System>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let mut system = System::new_all();
        system.refresh_all();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricsSampler for SysinfoSampler {
    async fn sample(&self) -> anyhow::Result<SystemMetrics> {
        let (cpu_percent, memory_percent) = {
            let mut system = self.system.lock().await;
            system.refresh_cpu_usage();
            system.refresh_memory();

            let cpus = system.cpus();
            let cpu_percent = if cpus.is_empty() {
                0.0
            } else {
                cpus.iter().map(|cpu| cpu.cpu_usage()).sum::<f32>() / cpus.len() as f32
            };
            let memory_percent = if system.total_memory() == 0 {
                0.0
            } else {
                (system.used_memory() as f32 / system.total_memory() as f32) * 100.0
            };
            (cpu_percent, memory_percent)
        };

        Ok(SystemMetrics {
            cpu_percent,
            memory_percent,
            disk_percent: disk_usage_percent(),
        })
    }
}

/// Aggregate usage across all mounted disks
fn disk_usage_percent() -> f32 {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let (total, available) = disks
        .list()
        .iter()
        .fold((0u64, 0u64), |(total, available), disk| {
            (
                total + disk.total_space(),
                available + disk.available_space(),
            )
        });
    if total == 0 {
        0.0
    } else {
        ((total - available) as f32 / total as f32) * 100.0
    }
}

/// Build the telemetry block for a heartbeat.
///
/// A failed sample is logged and reported as zeros; the heartbeat goes
/// out regardless, since liveness matters more than one data point.
pub async fn heartbeat_snapshot(
    sampler: Option<&dyn MetricsSampler>,
    containers: Option<&dyn ContainerDriver>,
) -> HeartbeatMetrics {
    let system = match sampler {
        Some(sampler) => match sampler.sample().await {
            Ok(metrics) => metrics,
            Err(e) => {
                tracing::warn!(error = %e, "Telemetry sample failed; sending zeros");
                SystemMetrics::default()
            }
        },
        None => SystemMetrics::default(),
    };

    let counts = match containers {
        Some(driver) => match driver.counts().await {
            Ok(counts) => counts,
            Err(e) => {
                tracing::warn!(error = %e, "Container count failed; sending zeros");
                ContainerCounts::default()
            }
        },
        None => ContainerCounts::default(),
    };

    HeartbeatMetrics {
        cpu_percent: system.cpu_percent,
        memory_percent: system.memory_percent,
        disk_percent: system.disk_percent,
        container_count: counts.total,
        container_running: counts.running,
    }
}
