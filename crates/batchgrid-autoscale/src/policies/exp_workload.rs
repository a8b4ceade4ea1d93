//! Exponential workload policy.
//!
//! Compares average pending growth with average throughput. While the
//! backlog outgrows throughput the step doubles each check (1, 2, 4, ...)
//! up to `max_step`; while throughput wins the step doubles in the other
//! direction. A balanced window resets the step, unless the backlog is idle
//! (pending growth at or below `idle_threshold`), which counts as a reason
//! to shrink.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use batchgrid_state::{MetricsSnapshot, WindowView};

use super::{DEFAULT_LOWER_BOUND_NODES, Policy, PolicyFuture, crosses_lower_bound};
use crate::error::{PolicyError, PolicyResult};
use crate::feedback::FeedbackRecorder;
use crate::predictor::Predictor;
use crate::stats::WorkloadStats;

pub(crate) const NAME: &str = "exp_workload";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpWorkloadConfig {
    /// Largest step magnitude. Steps saturate here.
    pub max_step: i32,
    /// Pending growth at or below this is treated as an idle backlog.
    pub idle_threshold: f32,
    pub lower_bound_nodes: i32,
}

impl Default for ExpWorkloadConfig {
    fn default() -> Self {
        Self {
            max_step: 64,
            idle_threshold: 0.0,
            lower_bound_nodes: DEFAULT_LOWER_BOUND_NODES,
        }
    }
}

impl ExpWorkloadConfig {
    pub(crate) fn validate(&self) -> PolicyResult<()> {
        if self.max_step < 1 {
            return Err(PolicyError::InvalidSetting {
                policy: NAME,
                reason: format!("max_step must be positive, got {}", self.max_step),
            });
        }
        if self.idle_threshold < 0.0 {
            return Err(PolicyError::InvalidSetting {
                policy: NAME,
                reason: "idle_threshold must not be negative".into(),
            });
        }
        Ok(())
    }
}

pub struct ExpWorkloadPolicy {
    config: ExpWorkloadConfig,
    step: i32,
    feedback: FeedbackRecorder,
}

impl ExpWorkloadPolicy {
    pub fn new(
        config: ExpWorkloadConfig,
        cluster: &str,
        predictor: Option<Arc<dyn Predictor>>,
    ) -> Self {
        Self {
            config,
            step: 0,
            feedback: FeedbackRecorder::new(cluster, predictor),
        }
    }

    /// Advance the step for one decision.
    fn next_step(&self, stats: &WorkloadStats) -> i32 {
        let max = self.config.max_step;
        if stats.throughput < stats.pending_growth {
            if self.step <= 0 {
                1
            } else {
                self.step.saturating_mul(2).min(max)
            }
        } else if stats.throughput > stats.pending_growth
            || stats.pending_growth <= self.config.idle_threshold
        {
            if self.step >= 0 {
                -1
            } else {
                self.step.saturating_mul(2).max(-max)
            }
        } else {
            0
        }
    }

    fn decide(&mut self, window: &WindowView<MetricsSnapshot>) -> i32 {
        let (Some(stats), Some(last)) = (WorkloadStats::from_window(window), window.last()) else {
            return 0;
        };
        let performance = stats.performance();
        self.feedback.close(performance, last);

        self.step = self.next_step(&stats);
        if crosses_lower_bound(last.number_of_nodes, self.step, self.config.lower_bound_nodes) {
            self.step = 0;
        }
        debug!(
            throughput = stats.throughput,
            pending_growth = stats.pending_growth,
            step = self.step,
            "exp workload decision"
        );

        self.feedback.open(self.step, performance, last);
        self.step
    }
}

impl Policy for ExpWorkloadPolicy {
    fn name(&self) -> &'static str {
        NAME
    }

    fn apply<'a>(&'a mut self, window: &'a WindowView<MetricsSnapshot>) -> PolicyFuture<'a> {
        let delta = self.decide(window);
        Box::pin(async move { delta })
    }
}
