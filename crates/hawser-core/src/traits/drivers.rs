//! Resource driver traits
//!
//! The agent touches local resources only through these seams. The
//! process wires in real drivers at startup; tests substitute mocks. No
//! container engine implementation lives in this workspace, by design:
//! the engine is an external collaborator behind [`ContainerDriver`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Point-in-time host utilization
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    /// CPU utilization across all cores, 0.0-100.0
    pub cpu_percent: f32,
    /// Used physical memory as a fraction of total, 0.0-100.0
    pub memory_percent: f32,
    /// Used disk space as a fraction of total, 0.0-100.0
    pub disk_percent: f32,
}

/// Container totals for heartbeat telemetry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerCounts {
    /// Containers known to the engine
    pub total: u32,
    /// Containers currently running
    pub running: u32,
}

/// Samples host utilization for heartbeats and metric streams
#[async_trait]
pub trait MetricsSampler: Send + Sync {
    /// Take one utilization snapshot
    async fn sample(&self) -> anyhow::Result<SystemMetrics>;
}

/// Bridge to a local container engine.
///
/// Results are engine-shaped JSON passed through to the control plane
/// verbatim; the agent does not interpret them beyond `counts`.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Totals for heartbeat telemetry
    async fn counts(&self) -> anyhow::Result<ContainerCounts>;

    /// List containers
    async fn list(&self) -> anyhow::Result<Value>;

    /// Inspect one container
    async fn inspect(&self, id: &str) -> anyhow::Result<Value>;

    /// Start a container
    async fn start(&self, id: &str) -> anyhow::Result<Value>;

    /// Stop a container
    async fn stop(&self, id: &str) -> anyhow::Result<Value>;

    /// Restart a container
    async fn restart(&self, id: &str) -> anyhow::Result<Value>;
}
