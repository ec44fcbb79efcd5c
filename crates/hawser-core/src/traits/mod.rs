//! Core trait definitions

mod drivers;

pub use drivers::{ContainerCounts, ContainerDriver, MetricsSampler, SystemMetrics};
