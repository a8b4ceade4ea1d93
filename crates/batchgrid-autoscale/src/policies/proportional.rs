//! Proportional workload policy.
//!
//! Sizes the cluster directly instead of stepping: the unabsorbed backlog
//! (pending growth minus throughput) is converted to nodes through the
//! observed containers-per-node and damped by `scale`. When nothing new is
//! queueing, the cluster is fitted to what is currently allocated.
//!
//! Default policy for clusters recovered from heartbeats.

use serde::{Deserialize, Serialize};
use tracing::debug;

use batchgrid_state::{MetricsSnapshot, WindowView};

use super::{Policy, PolicyFuture};
use crate::error::{PolicyError, PolicyResult};
use crate::stats::WorkloadStats;

pub(crate) const NAME: &str = "proportional";

/// Containers per node assumed when the metrics cannot tell.
const FALLBACK_CONTAINERS_PER_NODE: f32 = 2.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProportionalConfig {
    /// Fraction of the computed node gap applied per decision.
    pub scale: f32,
}

impl Default for ProportionalConfig {
    fn default() -> Self {
        Self { scale: 0.5 }
    }
}

impl ProportionalConfig {
    pub(crate) fn validate(&self) -> PolicyResult<()> {
        if !self.scale.is_finite() || self.scale <= 0.0 {
            return Err(PolicyError::InvalidSetting {
                policy: NAME,
                reason: format!("scale must be positive, got {}", self.scale),
            });
        }
        Ok(())
    }
}

pub struct ProportionalPolicy {
    config: ProportionalConfig,
}

impl ProportionalPolicy {
    pub fn new(config: ProportionalConfig) -> Self {
        Self { config }
    }

    fn decide(&self, window: &WindowView<MetricsSnapshot>) -> i32 {
        let (Some(stats), Some(last)) = (WorkloadStats::from_window(window), window.last()) else {
            return 0;
        };
        let per_node = containers_per_node(last);

        let delta = if stats.pending_growth == 0.0 && last.allocated_containers > 0 {
            let wanted = (last.allocated_containers as f32 / per_node).ceil() as i32;
            wanted - last.number_of_nodes
        } else {
            ((stats.pending_growth - stats.throughput) / per_node * self.config.scale) as i32
        };
        debug!(
            throughput = stats.throughput,
            pending_growth = stats.pending_growth,
            per_node,
            delta,
            "proportional decision"
        );
        delta
    }
}

/// Containers one node can host, derived from worker memory and the memory
/// footprint of current containers.
fn containers_per_node(snap: &MetricsSnapshot) -> f32 {
    if snap.number_of_nodes <= 0 {
        return FALLBACK_CONTAINERS_PER_NODE;
    }
    let worker_mb = (snap.available_mb + snap.allocated_mb) as f32 / snap.number_of_nodes as f32;
    let container_mb = if snap.allocated_containers > 0 {
        snap.allocated_mb as f32 / snap.allocated_containers as f32
    } else if snap.pending_containers > 0 {
        snap.pending_mb as f32 / snap.pending_containers as f32
    } else {
        0.0
    };
    if container_mb <= 0.0 {
        return FALLBACK_CONTAINERS_PER_NODE;
    }
    let per_node = (worker_mb / container_mb).floor();
    if per_node <= 0.0 {
        FALLBACK_CONTAINERS_PER_NODE
    } else {
        per_node
    }
}

impl Policy for ProportionalPolicy {
    fn name(&self) -> &'static str {
        NAME
    }

    fn apply<'a>(&'a mut self, window: &'a WindowView<MetricsSnapshot>) -> PolicyFuture<'a> {
        let delta = self.decide(window);
        Box::pin(async move { delta })
    }
}
